//! Gatekeeper - Admission Control for HTTP Services
//!
//! This crate gates inbound requests per caller, identity or endpoint. It
//! provides a fixed-window counter backed by a pluggable counting store, an
//! exact sliding-window log, and a small framework-agnostic middleware
//! contract with an axum adapter at the edge.

pub mod config;
pub mod error;
pub mod web;
pub mod middleware;
pub mod ratelimit;

//! axum integration edge.
//!
//! [`enforce`] adapts any [`Middleware`](crate::middleware::Middleware) to an
//! axum `from_fn_with_state` layer; [`routes`] wires the service's policies
//! onto its endpoints and [`HttpServer`] runs the result.

mod adapter;
pub mod routes;
mod server;

pub use adapter::{enforce, request_info, Identity, SharedMiddleware};
pub use routes::{router, RateLimiters};
pub use server::HttpServer;

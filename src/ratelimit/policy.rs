//! Preconfigured limiter policies.
//!
//! Each factory takes a [`LimiterBuilder`] carrying the caller's `max`,
//! `window` and any other options, fills in the policy's key derivation, and
//! builds the limiter. A key generator already set on the builder wins over
//! the policy default.

use std::sync::Arc;

use crate::error::Result;
use crate::middleware::RequestView;

use super::key::{caller_key, endpoint_key, identity_key, is_anonymous, KeyGenerator, SkipPredicate};
use super::limiter::{FixedWindowLimiter, LimiterBuilder, DEFAULT_NAME};

/// Limit each caller network address.
pub fn by_caller(builder: LimiterBuilder) -> Result<FixedWindowLimiter> {
    with_default_key(builder, Arc::new(caller_key))
        .name_if_default("rate-limit-caller")
        .build()
}

/// Limit each authenticated identity.
///
/// Anonymous requests are never limited by this policy; any `skip` already on
/// the builder still applies to authenticated requests.
pub fn by_identity(mut builder: LimiterBuilder) -> Result<FixedWindowLimiter> {
    let anonymous: SkipPredicate = Arc::new(is_anonymous);
    let skip: SkipPredicate = match builder.skip.take() {
        Some(user_skip) => {
            Arc::new(move |request: &dyn RequestView| anonymous(request) || user_skip(request))
        }
        None => anonymous,
    };
    builder.skip = Some(skip);

    with_default_key(builder, Arc::new(identity_key))
        .name_if_default("rate-limit-identity")
        .build()
}

/// Give every route (method + path) its own counter.
pub fn by_endpoint(builder: LimiterBuilder) -> Result<FixedWindowLimiter> {
    with_default_key(builder, Arc::new(endpoint_key))
        .name_if_default("rate-limit-endpoint")
        .build()
}

/// A caller-address limiter meant for sensitive operations, built with a
/// deliberately low `max` / long `window` supplied by the caller.
pub fn strict(builder: LimiterBuilder) -> Result<FixedWindowLimiter> {
    with_default_key(builder, Arc::new(caller_key))
        .name_if_default("rate-limit-strict")
        .build()
}

fn with_default_key(mut builder: LimiterBuilder, key_generator: KeyGenerator) -> LimiterBuilder {
    if builder.key_generator.is_none() {
        builder.key_generator = Some(key_generator);
    }
    builder
}

impl LimiterBuilder {
    fn name_if_default(self, name: &'static str) -> Self {
        if self.name == DEFAULT_NAME {
            self.name(name)
        } else {
            self
        }
    }
}

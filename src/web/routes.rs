//! Service endpoints and the policy guarding each one.
//!
//! | Route         | Policy          |
//! |---------------|-----------------|
//! | `/health`     | none            |
//! | `/api/status` | by caller       |
//! | `/api/me`     | by identity     |
//! | `/api/items`  | by endpoint     |
//! | `/api/login`  | strict          |
//! | `/api/feed`   | sliding window  |

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post, MethodRouter};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::adapter::{enforce, SharedMiddleware};
use crate::config::{LimitSettings, LimitsConfig};
use crate::error::Result;
use crate::ratelimit::{
    by_caller, by_endpoint, by_identity, strict, CleanupHandle, FixedWindowLimiter, LimiterBuilder,
    MemoryStore, SlidingWindowLimiter,
};

/// Every limiter the service runs, each over its own store.
pub struct RateLimiters {
    pub caller: Arc<FixedWindowLimiter>,
    pub identity: Arc<FixedWindowLimiter>,
    pub endpoint: Arc<FixedWindowLimiter>,
    pub strict: Arc<FixedWindowLimiter>,
    pub sliding: Arc<SlidingWindowLimiter>,
    stores: Vec<Arc<MemoryStore>>,
}

impl RateLimiters {
    /// Build every policy from `limits`.
    pub fn from_config(limits: &LimitsConfig) -> Result<Self> {
        let mut stores = Vec::with_capacity(4);
        let caller = fixed_window(&limits.caller, by_caller, &mut stores)?;
        let identity = fixed_window(&limits.identity, by_identity, &mut stores)?;
        let endpoint = fixed_window(&limits.endpoint, by_endpoint, &mut stores)?;
        let sensitive = fixed_window(&limits.strict, strict, &mut stores)?;
        let sliding = Arc::new(limits.sliding.sliding_builder().build()?);

        info!(
            caller_max = limits.caller.max,
            identity_max = limits.identity.max,
            endpoint_max = limits.endpoint.max,
            strict_max = limits.strict.max,
            sliding_max = limits.sliding.max,
            "Rate limiters initialized"
        );

        Ok(Self {
            caller,
            identity,
            endpoint,
            strict: sensitive,
            sliding,
            stores,
        })
    }

    /// Start a background sweep over every store and the sliding log.
    ///
    /// The sweeps stop when the returned handles are dropped.
    pub fn start_cleanup(&self, interval: Duration) -> Vec<CleanupHandle> {
        let mut handles: Vec<CleanupHandle> = self
            .stores
            .iter()
            .map(|store| store.start_cleanup(interval))
            .collect();
        handles.push(self.sliding.log().start_cleanup(interval));
        handles
    }
}

fn fixed_window(
    settings: &LimitSettings,
    policy: fn(LimiterBuilder) -> Result<FixedWindowLimiter>,
    stores: &mut Vec<Arc<MemoryStore>>,
) -> Result<Arc<FixedWindowLimiter>> {
    let store = Arc::new(MemoryStore::new().with_default_window(settings.window()));
    stores.push(store.clone());
    Ok(Arc::new(policy(settings.builder().store(store))?))
}

/// Build the service router.
pub fn router(limiters: &RateLimiters) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", guarded(get(status), limiters.caller.clone()))
        .route("/api/me", guarded(get(accepted), limiters.identity.clone()))
        .route(
            "/api/items",
            guarded(get(accepted).post(accepted), limiters.endpoint.clone()),
        )
        .route("/api/login", guarded(post(accepted), limiters.strict.clone()))
        .route("/api/feed", guarded(get(accepted), limiters.sliding.clone()))
}

fn guarded(route: MethodRouter, limiter: SharedMiddleware) -> MethodRouter {
    route.layer(from_fn_with_state(limiter, enforce))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn status() -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn accepted() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

//! Fixed-window limiter engine.

use http::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::error::{GatekeeperError, Result};
use crate::middleware::{headers, Flow, Middleware, RequestView, ResponseSink, RATE_LIMIT_EXCEEDED};

use super::clock::{Clock, SystemClock};
use super::key::{caller_key, KeyGenerator, LimitHandler, SkipPredicate};
use super::store::{CounterStore, MemoryStore};

pub(super) const DEFAULT_NAME: &str = "rate-limit";

/// Outcome of counting one request against a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request fits in the window
    pub allowed: bool,
    /// Configured maximum for the window
    pub limit: u64,
    /// Requests counted so far in the window, this one included
    pub count: u64,
    /// Requests left in the window, clamped to `[0, limit]`
    pub remaining: u64,
    /// When the current window ends
    pub reset_time: Instant,
}

/// Admits at most `max` requests per key in each fixed window.
///
/// The request that brings a key's count to exactly `max` is admitted; the
/// next one in the same window is the first rejected.
pub struct FixedWindowLimiter {
    name: &'static str,
    max: u64,
    window: Duration,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    key_generator: KeyGenerator,
    skip: Option<SkipPredicate>,
    standard_headers: bool,
    legacy_headers: bool,
    on_limit_reached: Option<LimitHandler>,
}

impl std::fmt::Debug for FixedWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowLimiter")
            .field("name", &self.name)
            .field("max", &self.max)
            .field("window", &self.window)
            .field("skip", &self.skip.is_some())
            .field("standard_headers", &self.standard_headers)
            .field("legacy_headers", &self.legacy_headers)
            .field("on_limit_reached", &self.on_limit_reached.is_some())
            .finish()
    }
}

impl FixedWindowLimiter {
    /// Creates a new limiter builder.
    pub fn builder() -> LimiterBuilder {
        LimiterBuilder::new()
    }

    /// Count one request for `key` and decide whether it is admitted.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let record = self.store.increment(key, self.window);

        trace!(
            limiter = self.name,
            key = %key,
            count = record.count,
            limit = self.max,
            "Checking rate limit"
        );

        RateLimitDecision {
            allowed: record.count <= self.max,
            limit: self.max,
            count: record.count,
            remaining: self.max.saturating_sub(record.count),
            reset_time: record.reset_time,
        }
    }

    /// Forget the count for `key`.
    pub fn reset_key(&self, key: &str) {
        self.store.reset(key);
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// The store this limiter counts in.
    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    fn write_headers(&self, response: &mut dyn ResponseSink, remaining: u64) {
        if self.standard_headers {
            response.set_header(headers::RATELIMIT_LIMIT, self.max.to_string());
            response.set_header(headers::RATELIMIT_REMAINING, remaining.to_string());
        }
        if self.legacy_headers {
            response.set_header(headers::X_RATELIMIT_LIMIT, self.max.to_string());
            response.set_header(headers::X_RATELIMIT_REMAINING, remaining.to_string());
        }
    }

    fn reject(&self, response: &mut dyn ResponseSink, decision: &RateLimitDecision) {
        let retry_after = retry_after_secs(decision.reset_time.saturating_duration_since(self.clock.now()));

        if self.standard_headers || self.legacy_headers {
            response.set_header(headers::RETRY_AFTER, retry_after.to_string());
        }

        response.reject(
            StatusCode::TOO_MANY_REQUESTS,
            serde_json::json!({
                "error": RATE_LIMIT_EXCEEDED,
                "retry_after_secs": retry_after,
            }),
        );
    }
}

impl Middleware for FixedWindowLimiter {
    fn name(&self) -> &'static str {
        self.name
    }

    fn handle(&self, request: &dyn RequestView, response: &mut dyn ResponseSink) -> Flow {
        if let Some(ref skip) = self.skip {
            if skip(request) {
                trace!(limiter = self.name, path = request.path(), "Skipping rate limit");
                return Flow::Continue;
            }
        }

        // Fail open: a request we cannot key is admitted untouched.
        let key = match (self.key_generator)(request) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    limiter = self.name,
                    error = %e,
                    method = request.method(),
                    path = request.path(),
                    "Could not derive rate limit key, admitting request"
                );
                return Flow::Continue;
            }
        };

        let decision = self.check(&key);
        self.write_headers(response, decision.remaining);

        if decision.allowed {
            return Flow::Continue;
        }

        debug!(
            limiter = self.name,
            key = %key,
            count = decision.count,
            limit = decision.limit,
            "Rate limit exceeded"
        );

        if let Some(ref handler) = self.on_limit_reached {
            handler(request, response);
        }
        self.reject(response, &decision);

        Flow::Halt
    }
}

/// Round a wait up to whole seconds, never below one.
pub(crate) fn retry_after_secs(wait: Duration) -> u64 {
    let millis = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
    millis.div_ceil(1000).max(1)
}

pub(super) fn default_key_generator() -> KeyGenerator {
    Arc::new(caller_key)
}

/// Builder for [`FixedWindowLimiter`].
///
/// `max` and `window` are required; everything else has a default: a fresh
/// [`MemoryStore`], keys derived from the caller address, no skipping,
/// standard headers on and legacy headers off.
#[derive(Clone)]
pub struct LimiterBuilder {
    pub(super) name: &'static str,
    pub(super) max: Option<u64>,
    pub(super) window: Option<Duration>,
    pub(super) store: Option<Arc<dyn CounterStore>>,
    pub(super) clock: Option<Arc<dyn Clock>>,
    pub(super) key_generator: Option<KeyGenerator>,
    pub(super) skip: Option<SkipPredicate>,
    pub(super) standard_headers: bool,
    pub(super) legacy_headers: bool,
    pub(super) on_limit_reached: Option<LimitHandler>,
}

impl LimiterBuilder {
    pub fn new() -> Self {
        Self {
            name: DEFAULT_NAME,
            max: None,
            window: None,
            store: None,
            clock: None,
            key_generator: None,
            skip: None,
            standard_headers: true,
            legacy_headers: false,
            on_limit_reached: None,
        }
    }

    /// Name used in logs.
    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Maximum requests admitted per key per window. Must be greater than 0.
    pub fn max(mut self, max: u64) -> Self {
        self.max = Some(max);
        self
    }

    /// Window length. Must be non-zero.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    pub fn window_ms(self, millis: u64) -> Self {
        self.window(Duration::from_millis(millis))
    }

    /// Count in `store` instead of a private one. Limiters sharing a store
    /// share quota for keys they both generate.
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Time source for the default store and for `Retry-After`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn key_generator<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn RequestView) -> Result<String> + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(f));
        self
    }

    /// Requests matching `f` pass through without being counted.
    pub fn skip<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn RequestView) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(f));
        self
    }

    /// Emit `RateLimit-Limit` / `RateLimit-Remaining`.
    pub fn standard_headers(mut self, enabled: bool) -> Self {
        self.standard_headers = enabled;
        self
    }

    /// Emit `X-RateLimit-Limit` / `X-RateLimit-Remaining`.
    pub fn legacy_headers(mut self, enabled: bool) -> Self {
        self.legacy_headers = enabled;
        self
    }

    /// Called for every rejected request, before the 429 is written.
    pub fn on_limit_reached<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn RequestView, &mut dyn ResponseSink) + Send + Sync + 'static,
    {
        self.on_limit_reached = Some(Arc::new(f));
        self
    }

    /// Validate the configuration and build the limiter.
    pub fn build(self) -> Result<FixedWindowLimiter> {
        let max = validate_max(self.max)?;
        let window = validate_window(self.window)?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::with_clock(clock.clone()).with_default_window(window)),
        };

        Ok(FixedWindowLimiter {
            name: self.name,
            max,
            window,
            store,
            clock,
            key_generator: self.key_generator.unwrap_or_else(default_key_generator),
            skip: self.skip,
            standard_headers: self.standard_headers,
            legacy_headers: self.legacy_headers,
            on_limit_reached: self.on_limit_reached,
        })
    }
}

impl Default for LimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn validate_max(max: Option<u64>) -> Result<u64> {
    match max {
        None => Err(GatekeeperError::Config("max is required".to_string())),
        Some(0) => Err(GatekeeperError::Config("max must be greater than 0".to_string())),
        Some(max) => Ok(max),
    }
}

pub(crate) fn validate_window(window: Option<Duration>) -> Result<Duration> {
    match window {
        None => Err(GatekeeperError::Config("window is required".to_string())),
        Some(window) if window.is_zero() => Err(GatekeeperError::Config(
            "window must be greater than 0".to_string(),
        )),
        Some(window) => Ok(window),
    }
}

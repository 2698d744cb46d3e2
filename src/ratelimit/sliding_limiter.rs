//! Sliding-window log limiter as a middleware.

use http::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{GatekeeperError, Result};
use crate::middleware::{headers, Flow, Middleware, RequestView, ResponseSink, RATE_LIMIT_EXCEEDED};

use super::clock::{Clock, SystemClock};
use super::key::{KeyGenerator, SkipPredicate};
use super::limiter::{default_key_generator, retry_after_secs, validate_max, validate_window};
use super::sliding::SlidingWindowLog;

/// Gates requests through a [`SlidingWindowLog`].
///
/// Headers report the remaining allowance measured after the current request
/// was recorded; rejected requests report zero.
pub struct SlidingWindowLimiter {
    log: Arc<SlidingWindowLog>,
    key_generator: KeyGenerator,
    skip: Option<SkipPredicate>,
    standard_headers: bool,
    legacy_headers: bool,
}

impl SlidingWindowLimiter {
    pub fn builder() -> SlidingWindowBuilder {
        SlidingWindowBuilder::new()
    }

    /// The underlying log, e.g. for periodic [`SlidingWindowLog::cleanup`].
    pub fn log(&self) -> &Arc<SlidingWindowLog> {
        &self.log
    }

    fn write_headers(&self, response: &mut dyn ResponseSink, remaining: usize) {
        let limit = self.log.max().to_string();
        let remaining = remaining.to_string();

        if self.standard_headers {
            response.set_header(headers::RATELIMIT_LIMIT, limit.clone());
            response.set_header(headers::RATELIMIT_REMAINING, remaining.clone());
        }
        if self.legacy_headers {
            response.set_header(headers::X_RATELIMIT_LIMIT, limit);
            response.set_header(headers::X_RATELIMIT_REMAINING, remaining);
        }
    }
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("max", &self.log.max())
            .field("window", &self.log.window())
            .field("skip", &self.skip.is_some())
            .field("standard_headers", &self.standard_headers)
            .field("legacy_headers", &self.legacy_headers)
            .finish()
    }
}

impl Middleware for SlidingWindowLimiter {
    fn name(&self) -> &'static str {
        "sliding-window"
    }

    fn handle(&self, request: &dyn RequestView, response: &mut dyn ResponseSink) -> Flow {
        if let Some(ref skip) = self.skip {
            if skip(request) {
                return Flow::Continue;
            }
        }

        let key = match (self.key_generator)(request) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    limiter = self.name(),
                    error = %e,
                    method = request.method(),
                    path = request.path(),
                    "Could not derive rate limit key, admitting request"
                );
                return Flow::Continue;
            }
        };

        if let Some(remaining) = self.log.admit(&key) {
            self.write_headers(response, remaining);
            return Flow::Continue;
        }

        self.write_headers(response, 0);

        let retry_after = retry_after_secs(self.log.retry_after(&key));
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

        Flow::Halt
    }
}

/// Builder for [`SlidingWindowLimiter`].
#[derive(Clone)]
pub struct SlidingWindowBuilder {
    max: Option<u64>,
    window: Option<Duration>,
    clock: Option<Arc<dyn Clock>>,
    key_generator: Option<KeyGenerator>,
    skip: Option<SkipPredicate>,
    standard_headers: bool,
    legacy_headers: bool,
}

impl SlidingWindowBuilder {
    pub fn new() -> Self {
        Self {
            max: None,
            window: None,
            clock: None,
            key_generator: None,
            skip: None,
            standard_headers: true,
            legacy_headers: false,
        }
    }

    pub fn max(mut self, max: u64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    pub fn window_ms(self, millis: u64) -> Self {
        self.window(Duration::from_millis(millis))
    }

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

    pub fn skip<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn RequestView) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(f));
        self
    }

    pub fn standard_headers(mut self, enabled: bool) -> Self {
        self.standard_headers = enabled;
        self
    }

    pub fn legacy_headers(mut self, enabled: bool) -> Self {
        self.legacy_headers = enabled;
        self
    }

    pub fn build(self) -> Result<SlidingWindowLimiter> {
        let max = validate_max(self.max)?;
        let window = validate_window(self.window)?;
        let max = usize::try_from(max)
            .map_err(|_| GatekeeperError::Config(format!("max {} does not fit in memory", max)))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        Ok(SlidingWindowLimiter {
            log: Arc::new(SlidingWindowLog::with_clock(max, window, clock)?),
            key_generator: self.key_generator.unwrap_or_else(default_key_generator),
            skip: self.skip,
            standard_headers: self.standard_headers,
            legacy_headers: self.legacy_headers,
        })
    }
}

impl Default for SlidingWindowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

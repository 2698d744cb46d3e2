//! Sliding-window log rate limiting.
//!
//! Each key keeps the timestamps of its admitted requests inside the trailing
//! window. A request is admitted only while fewer than `max` timestamps
//! remain, so no trailing interval of length `window` ever holds more than
//! `max` admissions, wherever it starts. Rejected attempts are not logged, which
//! caps each log at `max` entries regardless of the request rate.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::error::{GatekeeperError, Result};

use super::clock::{Clock, SystemClock};
use super::limiter::validate_window;
use super::store::{spawn_sweep, CleanupHandle};

/// Exact rolling-rate limiter over per-key timestamp logs.
pub struct SlidingWindowLog {
    max: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    logs: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLog {
    /// Create a limiter admitting `max` requests per trailing `window`.
    ///
    /// Fails if `max` or `window` is zero.
    pub fn new(max: usize, window: Duration) -> Result<Self> {
        Self::with_clock(max, window, Arc::new(SystemClock))
    }

    pub fn with_clock(max: usize, window: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        if max == 0 {
            return Err(GatekeeperError::Config("max must be greater than 0".to_string()));
        }
        let window = validate_window(Some(window))?;

        Ok(Self {
            max,
            window,
            clock,
            logs: DashMap::new(),
        })
    }

    /// Admit and record a request for `key` if the trailing window has room.
    ///
    /// A rejected attempt leaves the log unchanged.
    pub fn is_allowed(&self, key: &str) -> bool {
        self.admit(key).is_some()
    }

    /// Like [`is_allowed`](Self::is_allowed), returning the allowance left
    /// right after this admission, or `None` if the request was rejected.
    ///
    /// The count is read under the same entry lock as the admission, so a
    /// concurrent request for the same key cannot land in between.
    pub fn admit(&self, key: &str) -> Option<usize> {
        let now = self.clock.now();
        let mut log = self.logs.entry(key.to_string()).or_default();

        prune(&mut log, now, self.window);

        if log.len() < self.max {
            log.push_back(now);
            trace!(key = %key, logged = log.len(), max = self.max, "Sliding window admitted");
            Some(self.max - log.len())
        } else {
            debug!(key = %key, max = self.max, "Sliding window limit exceeded");
            None
        }
    }

    /// Requests `key` could still make right now without being rejected.
    pub fn remaining(&self, key: &str) -> usize {
        let now = self.clock.now();

        match self.logs.get_mut(key) {
            Some(mut log) => {
                prune(&mut log, now, self.window);
                self.max.saturating_sub(log.len())
            }
            None => self.max,
        }
    }

    /// How long until `key` can be admitted again. Zero if it can be now.
    pub fn retry_after(&self, key: &str) -> Duration {
        let now = self.clock.now();

        let Some(mut log) = self.logs.get_mut(key) else {
            return Duration::ZERO;
        };
        prune(&mut log, now, self.window);

        if log.len() < self.max {
            return Duration::ZERO;
        }

        // The oldest entry has to age out before another slot opens.
        match log.front() {
            Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Forget every admission recorded for `key`.
    pub fn reset(&self, key: &str) {
        self.logs.remove(key);
    }

    /// Prune every log and drop keys left with no admissions in the window.
    ///
    /// Returns the number of keys dropped.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let before = self.logs.len();

        self.logs.retain(|_, log| {
            prune(log, now, self.window);
            !log.is_empty()
        });

        let dropped = before.saturating_sub(self.logs.len());
        debug!(dropped = dropped, remaining = self.logs.len(), "Sliding window cleanup sweep");
        dropped
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` on a tokio task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime or if `interval` is zero.
    #[must_use = "dropping the handle stops the cleanup task"]
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration) -> CleanupHandle {
        let task = spawn_sweep(Arc::downgrade(self), interval, |log: &SlidingWindowLog| {
            log.cleanup();
        });
        info!(interval = ?interval, "Sliding window cleanup started");
        CleanupHandle::new(task.abort_handle())
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of keys with a log, including logs that have not been pruned yet.
    pub fn key_count(&self) -> usize {
        self.logs.len()
    }
}

/// Drop timestamps at least `window` old, leaving only `(now - window, now]`.
fn prune(log: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while log
        .front()
        .is_some_and(|&at| now.saturating_duration_since(at) >= window)
    {
        log.pop_front();
    }
}

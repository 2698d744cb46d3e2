//! Counting store for fixed-window rate limiting.
//!
//! The store maps a string key to a [`CounterRecord`]. Records are created
//! lazily on first access, replaced in place once their window has passed,
//! and reclaimed by [`MemoryStore::cleanup`], which can run on a background
//! task started with [`MemoryStore::start_cleanup`].

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::clock::{Clock, SystemClock};

/// Window used by [`MemoryStore::get`] when it synthesizes a record for an unseen key.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Request count for one key inside one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    /// Requests counted in the current window
    pub count: u64,
    /// Instant at which the current window ends
    pub reset_time: Instant,
}

impl CounterRecord {
    /// Whether the window this record belongs to is still open at `now`.
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.reset_time
    }
}

/// Keyed counter storage used by the fixed-window limiter.
///
/// Implementations must make `increment` a single atomic step per key: two
/// concurrent calls for the same key must never observe the same count.
pub trait CounterStore: Send + Sync {
    /// Peek at the record for `key` without modifying the store.
    fn get(&self, key: &str) -> CounterRecord;

    /// Count one request for `key`, opening a new window of length `window`
    /// if none is live.
    fn increment(&self, key: &str, window: Duration) -> CounterRecord;

    /// Forget everything about `key`.
    fn reset(&self, key: &str);
}

/// In-process [`CounterStore`] backed by a sharded concurrent map.
pub struct MemoryStore {
    records: DashMap<String, CounterRecord>,
    default_window: Duration,
    clock: Arc<dyn Clock>,
    cleanup_task: Mutex<Option<AbortHandle>>,
}

impl MemoryStore {
    /// Create a store that reads time from the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            default_window: DEFAULT_WINDOW,
            clock,
            cleanup_task: Mutex::new(None),
        }
    }

    /// Set the window reported for keys that have no live record.
    pub fn with_default_window(mut self, window: Duration) -> Self {
        self.default_window = window;
        self
    }

    /// Remove every record whose window has passed.
    ///
    /// Returns the number of records evicted. Live windows are never touched.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, record| record.is_live(now));
        let evicted = before.saturating_sub(self.records.len());

        debug!(
            evicted = evicted,
            remaining = self.records.len(),
            "Counter store cleanup sweep"
        );

        evicted
    }

    /// Start sweeping expired records every `interval`.
    ///
    /// The sweep runs on a tokio task that only holds a weak reference to the
    /// store, so it ends on its own once the store is dropped. Starting a new
    /// sweep replaces (and cancels) any previous one.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime or if `interval` is zero.
    #[must_use = "dropping the handle stops the cleanup task"]
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration) -> CleanupHandle {
        let task = spawn_sweep(Arc::downgrade(self), interval, |store: &MemoryStore| {
            store.cleanup();
        });

        if let Some(previous) = self.cleanup_task.lock().replace(task.abort_handle()) {
            previous.abort();
        }

        info!(interval = ?interval, "Counter store cleanup started");

        CleanupHandle::new(task.abort_handle())
    }

    /// Cancel the background sweep, if one is running.
    ///
    /// Safe to call any number of times, including before `start_cleanup`.
    pub fn stop_cleanup(&self) {
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
            info!("Counter store cleanup stopped");
        }
    }

    /// Number of records currently held, expired or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup_task.get_mut().take() {
            task.abort();
        }
    }
}

impl CounterStore for MemoryStore {
    fn get(&self, key: &str) -> CounterRecord {
        let now = self.clock.now();

        match self.records.get(key) {
            Some(record) if record.is_live(now) => *record,
            _ => CounterRecord {
                count: 0,
                reset_time: now + self.default_window,
            },
        }
    }

    fn increment(&self, key: &str, window: Duration) -> CounterRecord {
        let now = self.clock.now();

        // The entry guard holds the shard lock for the whole check-and-update.
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| CounterRecord {
                count: 0,
                reset_time: now + window,
            });

        if record.is_live(now) {
            record.count += 1;
        } else {
            trace!(key = %key, "Opening new counter window");
            *record = CounterRecord {
                count: 1,
                reset_time: now + window,
            };
        }

        *record
    }

    fn reset(&self, key: &str) {
        self.records.remove(key);
    }
}

/// Run `sweep` against `target` every `interval` until the target is dropped.
///
/// The task holds only a weak reference, so it never keeps its target alive.
pub(super) fn spawn_sweep<T, F>(target: Weak<T>, interval: Duration, sweep: F) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: Fn(&T) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(target) = target.upgrade() else {
                break;
            };
            sweep(&target);
        }
    })
}

/// Cancels a background cleanup task.
///
/// The task is also cancelled when the handle is dropped.
#[derive(Debug)]
pub struct CleanupHandle {
    task: Option<AbortHandle>,
}

impl CleanupHandle {
    pub(super) fn new(task: AbortHandle) -> Self {
        Self { task: Some(task) }
    }

    /// Stop the cleanup task. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether this handle still controls a task.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    const WINDOW: Duration = Duration::from_secs(60);

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[test]
    fn test_get_unseen_key_does_not_create_record() {
        let (store, clock) = store_with_clock();

        let record = store.get("client");

        assert_eq!(record.count, 0);
        assert_eq!(record.reset_time, clock.now() + DEFAULT_WINDOW);
        assert!(store.is_empty());
    }

    #[test]
    fn test_increment_opens_window() {
        let (store, clock) = store_with_clock();

        let record = store.increment("client", WINDOW);

        assert_eq!(record.count, 1);
        assert_eq!(record.reset_time, clock.now() + WINDOW);
        assert_eq!(store.get("client"), record);
    }

    #[test]
    fn test_increment_keeps_reset_time_within_window() {
        let (store, clock) = store_with_clock();

        let first = store.increment("client", WINDOW);
        clock.advance(Duration::from_secs(30));
        let second = store.increment("client", WINDOW);

        assert_eq!(second.count, 2);
        assert_eq!(second.reset_time, first.reset_time);
    }

    #[test]
    fn test_increment_after_expiry_starts_fresh_window() {
        let (store, clock) = store_with_clock();

        for _ in 0..3 {
            store.increment("client", WINDOW);
        }
        clock.advance(WINDOW);

        let record = store.increment("client", WINDOW);
        assert_eq!(record.count, 1);
        assert_eq!(record.reset_time, clock.now() + WINDOW);
    }

    #[test]
    fn test_get_after_expiry_reports_empty_window() {
        let (store, clock) = store_with_clock();

        store.increment("client", WINDOW);
        clock.advance(WINDOW + Duration::from_millis(1));

        assert_eq!(store.get("client").count, 0);
        // Peeking never removes the stale record.
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reset_forgets_key() {
        let (store, _clock) = store_with_clock();

        store.increment("client", WINDOW);
        store.increment("client", WINDOW);
        store.reset("client");

        assert!(store.is_empty());
        assert_eq!(store.increment("client", WINDOW).count, 1);
    }

    #[test]
    fn test_reset_unknown_key_is_noop() {
        let (store, _clock) = store_with_clock();
        store.reset("nobody");
        assert!(store.is_empty());
    }

    #[test]
    fn test_cleanup_evicts_only_expired_records() {
        let (store, clock) = store_with_clock();

        store.increment("short", Duration::from_secs(1));
        store.increment("long", Duration::from_secs(10));
        clock.advance(Duration::from_secs(1));

        assert_eq!(store.cleanup(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("long").count, 1);

        clock.advance(Duration::from_secs(9));
        assert_eq!(store.cleanup(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_cleanup_never_evicts_live_window() {
        let (store, clock) = store_with_clock();

        store.increment("client", WINDOW);
        clock.advance(WINDOW - Duration::from_millis(1));

        assert_eq!(store.cleanup(), 0);
        assert_eq!(store.get("client").count, 1);
    }

    #[test]
    fn test_distinct_keys_are_independent() {
        let (store, _clock) = store_with_clock();

        for _ in 0..4 {
            store.increment("a", WINDOW);
        }
        store.increment("b", WINDOW);

        assert_eq!(store.get("a").count, 4);
        assert_eq!(store.get("b").count, 1);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        store.increment("shared", WINDOW);
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(store.get("shared").count, 2000);
    }

    #[test]
    fn test_stop_cleanup_without_start() {
        let store = MemoryStore::new();
        store.stop_cleanup();
        store.stop_cleanup();
    }

    #[tokio::test]
    async fn test_background_cleanup_evicts_expired() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));

        store.increment("client", Duration::from_millis(100));
        clock.advance(Duration::from_millis(100));

        let mut handle = store.start_cleanup(Duration::from_millis(10));
        assert!(handle.is_active());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.is_empty());

        handle.stop();
        handle.stop();
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn test_stopped_cleanup_no_longer_sweeps() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));

        let handle = store.start_cleanup(Duration::from_millis(10));
        store.stop_cleanup();
        store.stop_cleanup();
        drop(handle);

        store.increment("client", Duration::from_millis(100));
        clock.advance(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_cleanup() {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));

        drop(store.start_cleanup(Duration::from_millis(10)));

        store.increment("client", Duration::from_millis(100));
        clock.advance(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.len(), 1);
    }
}

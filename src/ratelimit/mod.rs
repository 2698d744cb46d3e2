//! Rate limiting algorithms, stores and policies.

mod clock;
mod key;
mod limiter;
mod policy;
mod sliding;
mod sliding_limiter;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{
    caller_key, endpoint_key, identity_key, is_anonymous, path_key, KeyGenerator, LimitHandler,
    SkipPredicate,
};
pub use limiter::{FixedWindowLimiter, LimiterBuilder, RateLimitDecision};
pub use policy::{by_caller, by_endpoint, by_identity, strict};
pub use sliding::SlidingWindowLog;
pub use sliding_limiter::{SlidingWindowBuilder, SlidingWindowLimiter};
pub use store::{CleanupHandle, CounterRecord, CounterStore, MemoryStore, DEFAULT_WINDOW};

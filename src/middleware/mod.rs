//! Framework-agnostic middleware contract.
//!
//! A limiter sees a request only through [`RequestView`] and answers only
//! through [`ResponseSink`] plus the [`Flow`] it returns. Integration edges
//! (see [`crate::web`]) adapt a concrete framework to these two traits.

mod request;
mod response;

pub use request::{RequestInfo, RequestView};
pub use response::{BufferedResponse, ResponseSink};

/// Rate limit header names.
pub mod headers {
    /// Limit for the window, standard draft style.
    pub const RATELIMIT_LIMIT: &str = "RateLimit-Limit";
    /// Requests left in the window, standard draft style.
    pub const RATELIMIT_REMAINING: &str = "RateLimit-Remaining";
    /// Limit for the window, legacy style.
    pub const X_RATELIMIT_LIMIT: &str = "X-RateLimit-Limit";
    /// Requests left in the window, legacy style.
    pub const X_RATELIMIT_REMAINING: &str = "X-RateLimit-Remaining";
    /// Seconds to wait before retrying (on 429).
    pub const RETRY_AFTER: &str = "Retry-After";
}

/// Error string carried by every rate limit rejection.
pub const RATE_LIMIT_EXCEEDED: &str = "Rate limit exceeded";

/// What the pipeline should do after a middleware ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Hand the request to the next stage.
    Continue,
    /// Stop here; the response sink holds the reply.
    Halt,
}

/// A request-gating stage.
///
/// `handle` must resolve synchronously: a decision never waits on I/O, so a
/// read-modify-write on limiter state cannot interleave with another request.
pub trait Middleware: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Inspect the request, optionally annotate or fill the response, and
    /// decide whether the pipeline continues.
    fn handle(&self, request: &dyn RequestView, response: &mut dyn ResponseSink) -> Flow;
}

/// Run `middleware` in the `(request, response, next)` shape, calling `next`
/// only when the request is admitted.
pub fn dispatch<F>(
    middleware: &dyn Middleware,
    request: &dyn RequestView,
    response: &mut dyn ResponseSink,
    next: F,
) where
    F: FnOnce(),
{
    if middleware.handle(request, response) == Flow::Continue {
        next();
    }
}

//! Bridges axum requests and responses to the middleware contract.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use crate::middleware::{BufferedResponse, Flow, Middleware, RequestInfo, RATE_LIMIT_EXCEEDED};

/// A limiter shared across every request routed through it.
pub type SharedMiddleware = Arc<dyn Middleware>;

/// Authenticated identity, inserted into request extensions by whatever
/// authenticates the caller upstream of the limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(pub String);

/// Snapshot the fields a limiter may read from an axum request.
///
/// The caller address comes from [`ConnectInfo`], so the router must be
/// served with `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn request_info(request: &Request) -> RequestInfo {
    let mut info = RequestInfo::new(request.method().as_str(), request.uri().path());

    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        info = info.with_remote_addr(addr.ip());
    }
    if let Some(Identity(id)) = request.extensions().get::<Identity>() {
        info = info.with_identity(id.clone());
    }

    info
}

/// axum middleware function running `middleware` in front of the handler.
///
/// ```ignore
/// let limiter: SharedMiddleware = Arc::new(strict(LimiterBuilder::new().max(5).window_ms(60_000))?);
/// let app = Router::new().route(
///     "/login",
///     post(login).layer(axum::middleware::from_fn_with_state(limiter, enforce)),
/// );
/// ```
pub async fn enforce(
    State(middleware): State<SharedMiddleware>,
    request: Request,
    next: Next,
) -> Response {
    let info = request_info(&request);
    let mut buffered = BufferedResponse::new();
    let flow = middleware.handle(&info, &mut buffered);
    let (headers, rejection) = buffered.into_parts();

    let mut response = match flow {
        Flow::Continue => next.run(request).await,
        Flow::Halt => match rejection {
            Some((status, body)) => (status, Json(body)).into_response(),
            None => {
                warn!(
                    middleware = middleware.name(),
                    "Middleware halted without a response, rejecting"
                );
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(serde_json::json!({ "error": RATE_LIMIT_EXCEEDED })),
                )
                    .into_response()
            }
        },
    };

    apply_headers(response.headers_mut(), &headers);
    response
}

fn apply_headers(target: &mut HeaderMap, headers: &[(&'static str, String)]) {
    for (name, value) in headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                target.insert(name, value);
            }
            _ => warn!(header = %name, "Dropping invalid response header"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{RequestView, ResponseSink};
    use crate::ratelimit::{by_identity, strict, LimiterBuilder, ManualClock};
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use std::net::{IpAddr, Ipv4Addr};
    use tower::ServiceExt;

    fn app(limiter: SharedMiddleware) -> Router {
        Router::new().route(
            "/",
            get(|| async { "ok" }).layer(axum::middleware::from_fn_with_state(limiter, enforce)),
        )
    }

    fn request_from(ip: [u8; 4]) -> Request {
        let mut request = http::Request::builder().uri("/").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 40000))));
        request
    }

    #[test]
    fn test_request_info_reads_extensions() {
        let mut request = http::Request::builder()
            .method("POST")
            .uri("/api/login?next=/home")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 9], 5000))));
        request.extensions_mut().insert(Identity("u-1".to_string()));

        let info = request_info(&request);

        assert_eq!(info.method(), "POST");
        assert_eq!(info.path(), "/api/login");
        assert_eq!(info.remote_addr(), Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9))));
        assert_eq!(info.identity(), Some("u-1"));
    }

    #[test]
    fn test_request_info_without_extensions() {
        let request = http::Request::builder().uri("/").body(Body::empty()).unwrap();
        let info = request_info(&request);

        assert_eq!(info.remote_addr(), None);
        assert_eq!(info.identity(), None);
    }

    #[tokio::test]
    async fn test_admits_then_rejects() {
        let limiter: SharedMiddleware = Arc::new(
            strict(
                LimiterBuilder::new()
                    .max(2)
                    .window_ms(60_000)
                    .clock(Arc::new(ManualClock::new())),
            )
            .unwrap(),
        );
        let app = app(limiter);

        for expected in ["1", "0"] {
            let response = app.clone().oneshot(request_from([10, 0, 0, 1])).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["ratelimit-limit"], "2");
            assert_eq!(response.headers()["ratelimit-remaining"], expected);
        }

        let response = app.clone().oneshot(request_from([10, 0, 0, 1])).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["ratelimit-remaining"], "0");
        assert_eq!(response.headers()["retry-after"], "60");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "Rate limit exceeded");

        // A different caller has its own budget.
        let response = app.oneshot(request_from([10, 0, 0, 2])).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_anonymous_bypasses_identity_limiter() {
        let limiter: SharedMiddleware = Arc::new(
            by_identity(LimiterBuilder::new().max(1).window_ms(60_000)).unwrap(),
        );
        let app = app(limiter);

        for _ in 0..3 {
            let response = app.clone().oneshot(request_from([10, 0, 0, 1])).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get("ratelimit-limit").is_none());
        }

        let mut request = request_from([10, 0, 0, 1]);
        request.extensions_mut().insert(Identity("u-1".to_string()));
        assert_eq!(app.clone().oneshot(request).await.unwrap().status(), StatusCode::OK);

        let mut request = request_from([10, 0, 0, 1]);
        request.extensions_mut().insert(Identity("u-1".to_string()));
        assert_eq!(
            app.oneshot(request).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_missing_connect_info_fails_open() {
        let limiter: SharedMiddleware = Arc::new(
            LimiterBuilder::new().max(1).window_ms(60_000).build().unwrap(),
        );
        let app = app(limiter);

        for _ in 0..3 {
            let request = http::Request::builder().uri("/").body(Body::empty()).unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    struct HaltSilently;

    impl Middleware for HaltSilently {
        fn name(&self) -> &'static str {
            "halt-silently"
        }

        fn handle(&self, _request: &dyn RequestView, _response: &mut dyn ResponseSink) -> Flow {
            Flow::Halt
        }
    }

    #[tokio::test]
    async fn test_halt_without_rejection_is_429() {
        let response = app(Arc::new(HaltSilently))
            .oneshot(request_from([10, 0, 0, 1]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}

//! Rate limit key derivation.
//!
//! A key groups requests that share one quota: a caller address, an
//! authenticated identity, or an endpoint.

use std::sync::Arc;

use crate::error::{GatekeeperError, Result};
use crate::middleware::{RequestView, ResponseSink};

/// Derives the rate limit key for a request.
pub type KeyGenerator = Arc<dyn Fn(&dyn RequestView) -> Result<String> + Send + Sync>;

/// Returns `true` for requests that bypass the limiter entirely.
pub type SkipPredicate = Arc<dyn Fn(&dyn RequestView) -> bool + Send + Sync>;

/// Invoked just before a request is rejected.
pub type LimitHandler = Arc<dyn Fn(&dyn RequestView, &mut dyn ResponseSink) + Send + Sync>;

/// Key on the caller's network address.
pub fn caller_key(request: &dyn RequestView) -> Result<String> {
    request
        .remote_addr()
        .map(|addr| addr.to_string())
        .ok_or_else(|| GatekeeperError::KeyDerivation("request has no remote address".to_string()))
}

/// Key on the authenticated identity id.
pub fn identity_key(request: &dyn RequestView) -> Result<String> {
    request
        .identity()
        .map(|id| format!("identity:{}", id))
        .ok_or_else(|| GatekeeperError::KeyDerivation("request has no identity".to_string()))
}

/// Key on the request path alone.
pub fn path_key(request: &dyn RequestView) -> Result<String> {
    Ok(format!("path:{}", request.path()))
}

/// Key on method and path, so `GET /items` and `POST /items` count separately.
pub fn endpoint_key(request: &dyn RequestView) -> Result<String> {
    Ok(format!("endpoint:{} {}", request.method(), request.path()))
}

/// Whether the request carries no authenticated identity.
pub fn is_anonymous(request: &dyn RequestView) -> bool {
    request.identity().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::RequestInfo;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_caller_key_ipv4() {
        let request = RequestInfo::new("GET", "/")
            .with_remote_addr(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(caller_key(&request).unwrap(), "192.168.1.1");
    }

    #[test]
    fn test_caller_key_ipv6() {
        let request = RequestInfo::new("GET", "/").with_remote_addr(IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(caller_key(&request).unwrap(), "::1");
    }

    #[test]
    fn test_caller_key_missing_address() {
        let request = RequestInfo::new("GET", "/");
        assert!(matches!(
            caller_key(&request),
            Err(GatekeeperError::KeyDerivation(_))
        ));
    }

    #[test]
    fn test_identity_key() {
        let request = RequestInfo::new("GET", "/").with_identity("user-42");
        assert_eq!(identity_key(&request).unwrap(), "identity:user-42");
        assert!(!is_anonymous(&request));
    }

    #[test]
    fn test_identity_key_anonymous() {
        let request = RequestInfo::new("GET", "/");
        assert!(identity_key(&request).is_err());
        assert!(is_anonymous(&request));
    }

    #[test]
    fn test_endpoint_key_includes_method() {
        let get = RequestInfo::new("GET", "/api/items");
        let post = RequestInfo::new("POST", "/api/items");

        assert_eq!(endpoint_key(&get).unwrap(), "endpoint:GET /api/items");
        assert_ne!(endpoint_key(&get).unwrap(), endpoint_key(&post).unwrap());
        assert_eq!(path_key(&get).unwrap(), path_key(&post).unwrap());
    }
}

//! Read-only request capabilities.

use std::net::IpAddr;

/// The request fields a limiter may read.
pub trait RequestView {
    /// Network address of the caller, when known.
    fn remote_addr(&self) -> Option<IpAddr>;

    /// Authenticated identity id, when the caller is authenticated.
    fn identity(&self) -> Option<&str>;

    /// Request path, without the query string.
    fn path(&self) -> &str;

    /// Request method, e.g. `GET`.
    fn method(&self) -> &str;
}

/// Owned snapshot of the fields in [`RequestView`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub remote_addr: Option<IpAddr>,
    pub identity: Option<String>,
    pub path: String,
    pub method: String,
}

impl RequestInfo {
    /// Create an anonymous request with no known address.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            remote_addr: None,
            identity: None,
            path: path.into(),
            method: method.into(),
        }
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }
}

impl RequestView for RequestInfo {
    fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn method(&self) -> &str {
        &self.method
    }
}

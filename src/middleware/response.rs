//! Write-only response capabilities.

use http::StatusCode;
use serde_json::Value;

/// The response operations a limiter may perform.
pub trait ResponseSink {
    /// Set (or overwrite) a response header.
    fn set_header(&mut self, name: &'static str, value: String);

    /// Terminate the exchange with `status` and a JSON body.
    fn reject(&mut self, status: StatusCode, body: Value);
}

/// A [`ResponseSink`] that records everything written to it.
///
/// Integration edges replay the recorded headers onto the downstream response
/// (or build the rejection from it); tests inspect it directly.
#[derive(Debug, Clone, Default)]
pub struct BufferedResponse {
    headers: Vec<(&'static str, String)>,
    rejection: Option<(StatusCode, Value)>,
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers in the order they were first set.
    pub fn headers(&self) -> &[(&'static str, String)] {
        &self.headers
    }

    /// Value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.rejection.as_ref().map(|(status, _)| *status)
    }

    pub fn body(&self) -> Option<&Value> {
        self.rejection.as_ref().map(|(_, body)| body)
    }

    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }

    /// Split into the recorded headers and the rejection, if any.
    pub fn into_parts(self) -> (Vec<(&'static str, String)>, Option<(StatusCode, Value)>) {
        (self.headers, self.rejection)
    }
}

impl ResponseSink for BufferedResponse {
    fn set_header(&mut self, name: &'static str, value: String) {
        match self.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(existing) => existing.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    fn reject(&mut self, status: StatusCode, body: Value) {
        self.rejection = Some((status, body));
    }
}

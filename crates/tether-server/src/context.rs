//! Handshake context for axum upgrades.

use std::collections::HashMap;

use axum::http::HeaderMap;
use tether_core::PeerContext;

/// Named values attached to a request by upstream middleware, typically the
/// authenticated user id under `UserID`.
///
/// Insert it as a request extension before the WebSocket route:
///
/// ```ignore
/// req.extensions_mut().insert(ContextValues::new().with("UserID", "alice"));
/// ```
#[derive(Clone, Debug, Default)]
pub struct ContextValues(HashMap<String, String>);

impl ContextValues {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.0.insert(key.into(), value.into());
        self
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// [`PeerContext`] captured from the upgrade request.
#[derive(Clone, Debug, Default)]
pub struct HttpContext {
    headers: HeaderMap,
    values: ContextValues,
}

impl HttpContext {
    /// Capture headers and middleware values.
    pub fn new(headers: HeaderMap, values: ContextValues) -> Self {
        Self { headers, values }
    }
}

impl PeerContext for HttpContext {
    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }

    fn value(&self, key: &str) -> Option<String> {
        self.values.get(key).map(str::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn headers_are_case_insensitive() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert("ws-client", HeaderValue::from_static("true"));
        let ctx = HttpContext::new(headers, ContextValues::new());
        assert_eq!(ctx.header("WS-Client").as_deref(), Some("true"));
        assert_eq!(ctx.header("origin"), None);
    }

    #[test]
    fn values_come_from_middleware() {
        let ctx = HttpContext::new(HeaderMap::new(), ContextValues::new().with("UserID", "alice"));
        assert_eq!(ctx.value("UserID").as_deref(), Some("alice"));
        assert_eq!(ctx.value("other"), None);
    }

    #[test]
    fn non_ascii_header_is_absent() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert("x-name", HeaderValue::from_bytes(b"caf\xe9").unwrap());
        let ctx = HttpContext::new(headers, ContextValues::new());
        assert_eq!(ctx.header("x-name"), None);
    }
}

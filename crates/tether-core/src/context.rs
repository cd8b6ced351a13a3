//! Peer context capability.
//!
//! Handshake adapters hand the core an opaque context value for each new
//! connection. The core only ever asks it for a header or a named value.

use std::collections::HashMap;

/// Read-only view of the request that opened a connection.
pub trait PeerContext: Send + Sync {
    /// Value of an HTTP header from the handshake request.
    fn header(&self, name: &str) -> Option<String>;

    /// Named value attached by upstream middleware (e.g. an authenticated
    /// user id).
    fn value(&self, key: &str) -> Option<String>;
}

/// A [`PeerContext`] backed by two plain maps.
///
/// Header names are matched case-insensitively.
#[derive(Clone, Debug, Default)]
pub struct StaticContext {
    headers: HashMap<String, String>,
    values: HashMap<String, String>,
}

impl StaticContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        let _ = self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Add a named value.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.values.insert(key.into(), value.into());
        self
    }
}

impl PeerContext for StaticContext {
    fn header(&self, name: &str) -> Option<String> {
        self.headers.get(&name.to_ascii_lowercase()).cloned()
    }

    fn value(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

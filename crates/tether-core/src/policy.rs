//! Pluggable decisions: what to do with malformed frames and which peers to
//! admit.

use std::fmt;
use std::sync::Arc;

use crate::connection::Connection;
use crate::context::PeerContext;
use crate::errors::ProtocolError;

/// Callback invoked for a frame that failed to decode.
pub type MalformedFrameHook = Arc<dyn Fn(&Connection, &[u8], &ProtocolError) + Send + Sync>;

/// Admission check run against the handshake context.
pub type OriginCheck = Arc<dyn Fn(&dyn PeerContext) -> bool + Send + Sync>;

/// Reaction to an inbound frame that could not be decoded.
#[derive(Clone, Default)]
pub enum MalformedFramePolicy {
    /// Log at debug level and keep reading.
    #[default]
    Drop,
    /// Close the offending connection.
    Close,
    /// Hand the frame to a callback and keep reading.
    Custom(MalformedFrameHook),
}

impl fmt::Debug for MalformedFramePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop => f.write_str("Drop"),
            Self::Close => f.write_str("Close"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Policy hooks of a [`Channel`](crate::channel::Channel).
#[derive(Clone, Default)]
pub struct Policies {
    /// Malformed frame handling.
    pub malformed_frames: MalformedFramePolicy,
    /// Admission check; every peer is admitted when unset.
    pub origin_check: Option<OriginCheck>,
}

impl Policies {
    /// Default policies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the malformed frame policy.
    #[must_use]
    pub fn malformed_frames(mut self, policy: MalformedFramePolicy) -> Self {
        self.malformed_frames = policy;
        self
    }

    /// Only admit peers for which `check` returns true.
    #[must_use]
    pub fn origin_check(
        mut self,
        check: impl Fn(&dyn PeerContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.origin_check = Some(Arc::new(check));
        self
    }

    pub(crate) fn admits(&self, context: &dyn PeerContext) -> bool {
        self.origin_check.as_ref().is_none_or(|check| check(context))
    }
}

impl fmt::Debug for Policies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policies")
            .field("malformed_frames", &self.malformed_frames)
            .field("origin_check", &self.origin_check.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StaticContext;

    #[test]
    fn admits_everyone_by_default() {
        assert!(Policies::new().admits(&StaticContext::new()));
    }

    #[test]
    fn origin_check_filters() {
        let policies = Policies::new().origin_check(|ctx| {
            ctx.header("origin").as_deref() == Some("https://app.example")
        });
        assert!(!policies.admits(&StaticContext::new()));
        assert!(policies.admits(
            &StaticContext::new().with_header("Origin", "https://app.example")
        ));
    }

    #[test]
    fn debug_hides_callbacks() {
        let policies = Policies::new()
            .malformed_frames(MalformedFramePolicy::Custom(Arc::new(
                |_: &Connection, _: &[u8], _: &ProtocolError| {},
            )));
        assert_eq!(
            format!("{policies:?}"),
            "Policies { malformed_frames: Custom(..), origin_check: false }"
        );
    }
}

//! Users: the set of live connections sharing one identity.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::connection::{Connection, ConnectionId};
use crate::connections::{self, Connections};
use crate::errors::Result;
use crate::message::Message;
use crate::registry::Registry;

/// Caller identity taken from the handshake context.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap an identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// An identity and its live connections.
///
/// A user exists in the channel exactly while it has at least one live
/// connection.
pub struct User {
    id: UserId,
    pub(crate) connections: Registry<ConnectionId, Arc<Connection>>,
}

impl User {
    pub(crate) fn new(id: UserId) -> Self {
        Self {
            id,
            connections: Registry::new(),
        }
    }

    /// Identity.
    pub fn id(&self) -> &UserId {
        &self.id
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Connections {
        self.connections.values().into_iter().collect()
    }

    /// One of this user's connections.
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the user has no live connection left.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Send to every connection of this user.
    pub async fn send(&self, command: &str, message: impl Into<Message>) -> Result<()> {
        let targets = self.connections.values();
        connections::send_all(&targets, command, &message.into()).await
    }

    /// This user's connections subscribed to any of `topics`.
    pub fn subscribers(&self, topics: &str) -> Connections {
        self.connections().subscribers(topics)
    }

    /// Close every connection; the user leaves the channel with the last one.
    pub async fn close(&self) {
        self.connections().close().await;
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("connections", &self.connections.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::config::ChannelConfig;
    use crate::context::StaticContext;
    use crate::transport::memory::{self, MemoryTransport};

    fn make_conn(channel: &Channel, user: &str) -> (Arc<Connection>, MemoryTransport) {
        let (server, peer) = memory::pair();
        let ctx = StaticContext::new()
            .with_header("ws-client", "true")
            .with_value("UserID", user);
        let conn = channel.accept(Arc::new(server), Arc::new(ctx)).unwrap();
        (conn, peer)
    }

    #[test]
    fn user_id_display() {
        let id = UserId::from("alice");
        assert_eq!(id.to_string(), "alice");
        assert_eq!(id.as_str(), "alice");
    }

    #[tokio::test]
    async fn connections_group_under_one_user() {
        let channel = Channel::new(ChannelConfig::default());
        let (a, _pa) = make_conn(&channel, "u1");
        let (b, _pb) = make_conn(&channel, "u1");
        let (_c, _pc) = make_conn(&channel, "u2");

        let user = channel.user(&UserId::from("u1")).unwrap();
        assert_eq!(user.len(), 2);
        assert!(user.connection(a.id()).is_some());
        assert!(Arc::ptr_eq(&a.user().unwrap(), &b.user().unwrap()));
        assert_eq!(channel.user_count(), 2);
    }

    #[tokio::test]
    async fn last_close_evicts_user() {
        let channel = Channel::new(ChannelConfig::default());
        let (a, _pa) = make_conn(&channel, "u1");
        let (b, _pb) = make_conn(&channel, "u1");
        let id = UserId::from("u1");

        a.close().await;
        assert_eq!(channel.user(&id).unwrap().len(), 1);
        b.close().await;
        assert!(channel.user(&id).is_none());
        assert_eq!(channel.user_count(), 0);
    }

    #[tokio::test]
    async fn reconnect_after_eviction_gets_fresh_user() {
        let channel = Channel::new(ChannelConfig::default());
        let (a, _pa) = make_conn(&channel, "u1");
        let old = a.user().unwrap();
        a.close().await;

        let (b, _pb) = make_conn(&channel, "u1");
        let fresh = b.user().unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.len(), 1);
        assert!(old.is_empty());
    }

    #[tokio::test]
    async fn send_reaches_all_user_connections() {
        let channel = Channel::new(ChannelConfig::default());
        let (_a, pa) = make_conn(&channel, "u1");
        let (_b, pb) = make_conn(&channel, "u1");
        let user = channel.user(&UserId::from("u1")).unwrap();
        user.send("dm", "hi").await.unwrap();
        assert_eq!(pa.read_text().await.unwrap(), "0:dm:\"hi\"");
        assert_eq!(pb.read_text().await.unwrap(), "0:dm:\"hi\"");
    }

    #[tokio::test]
    async fn user_subscribers_and_close() {
        let channel = Channel::new(ChannelConfig::default());
        let (a, _pa) = make_conn(&channel, "u1");
        let (_b, _pb) = make_conn(&channel, "u1");
        a.subscribe("t");
        let user = channel.user(&UserId::from("u1")).unwrap();
        assert_eq!(user.subscribers("t").ids(), vec![a.id()]);

        user.close().await;
        assert!(user.is_empty());
        assert!(channel.user(&UserId::from("u1")).is_none());
    }

    #[tokio::test]
    async fn anonymous_connection_has_no_user() {
        let channel = Channel::new(ChannelConfig::default());
        let (server, _peer) = memory::pair();
        let conn = channel
            .accept(Arc::new(server), Arc::new(StaticContext::new()))
            .unwrap();
        assert!(conn.user().is_none());
        assert_eq!(channel.user_count(), 0);
    }
}

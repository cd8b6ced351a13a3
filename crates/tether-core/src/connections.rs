//! Deduplicated connection sets and fan-out sends.

use std::collections::BTreeMap;
use std::collections::btree_map;
use std::sync::Arc;

use futures::future::join_all;

use crate::connection::{Connection, ConnectionId};
use crate::errors::{BroadcastError, Result};
use crate::message::Message;
use crate::metrics::BROADCAST_FAILURES_TOTAL;

/// A set of connections keyed by id, in id order.
#[derive(Clone, Default)]
pub struct Connections {
    members: BTreeMap<ConnectionId, Arc<Connection>>,
}

impl Connections {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection. Adding the same id twice keeps one entry.
    pub fn add(&mut self, connection: Arc<Connection>) {
        let _ = self.members.insert(connection.id(), connection);
    }

    /// Merge another set into this one.
    pub fn extend(&mut self, other: Connections) {
        self.members.extend(other.members);
    }

    /// Remove a connection by id.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.members.remove(&id)
    }

    /// Look up a member.
    pub fn connection(&self, id: ConnectionId) -> Option<&Arc<Connection>> {
        self.members.get(&id)
    }

    /// Member ids in ascending order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.members.keys().copied().collect()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Iterate members in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.members.values()
    }

    /// Members subscribed to any of the comma-separated `topics`.
    pub fn subscribers(&self, topics: &str) -> Connections {
        self.iter()
            .filter(|c| c.is_subscribed(topics))
            .cloned()
            .collect()
    }

    /// Send to every member. Failures do not stop delivery to the others;
    /// they are collected into one [`Error::Broadcast`](crate::Error::Broadcast).
    pub async fn send(&self, command: &str, message: impl Into<Message>) -> Result<()> {
        send_all(self.iter(), command, &message.into()).await
    }

    /// Close every member.
    pub async fn close(&self) {
        let _ = join_all(self.iter().map(|c| c.close())).await;
    }
}

impl std::fmt::Debug for Connections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.members.keys()).finish()
    }
}

impl FromIterator<Arc<Connection>> for Connections {
    fn from_iter<I: IntoIterator<Item = Arc<Connection>>>(iter: I) -> Self {
        let mut set = Self::new();
        for connection in iter {
            set.add(connection);
        }
        set
    }
}

impl IntoIterator for Connections {
    type Item = Arc<Connection>;
    type IntoIter = btree_map::IntoValues<ConnectionId, Arc<Connection>>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.into_values()
    }
}

/// Send one message to many connections concurrently and aggregate failures
/// in target order.
pub(crate) async fn send_all<'a>(
    targets: impl IntoIterator<Item = &'a Arc<Connection>>,
    command: &str,
    message: &Message,
) -> Result<()> {
    let targets: Vec<&Arc<Connection>> = targets.into_iter().collect();
    let results = join_all(
        targets
            .iter()
            .map(|c| c.send(command, message.clone())),
    )
    .await;

    let mut failures = BroadcastError::default();
    for (connection, result) in targets.iter().zip(results) {
        if let Err(e) = result {
            failures.push(connection.id(), e);
        }
    }
    if !failures.is_empty() {
        metrics::counter!(BROADCAST_FAILURES_TOTAL).increment(failures.len() as u64);
    }
    failures.into_result()
}

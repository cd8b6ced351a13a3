//! One live broker-side connection.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::ChannelInner;
use crate::connections::Connections;
use crate::context::PeerContext;
use crate::errors::{Error, Result};
use crate::frame::{self, Envelope, RequestId};
use crate::message::Message;
use crate::metrics::{CONNECTIONS_ACTIVE, DISCONNECTIONS_TOTAL};
use crate::transport::{MessageKind, Transport};
use crate::user::User;

/// Upper bound on the close frame and stream teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Channel-unique connection id. Assigned in increasing order, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected peer: one stream, its subscriptions, and its write lock.
pub struct Connection {
    id: ConnectionId,
    channel: Weak<ChannelInner>,
    user: Option<Arc<User>>,
    transport: Arc<dyn Transport>,
    context: Arc<dyn PeerContext>,
    protocol_aware: bool,
    use_binary: AtomicBool,
    request_timeout: Duration,
    subscriptions: RwLock<BTreeSet<String>>,
    closed: AtomicBool,
    closing: CancellationToken,
    write_lock: Mutex<()>,
}

pub(crate) struct ConnectionParts {
    pub id: ConnectionId,
    pub channel: Weak<ChannelInner>,
    pub user: Option<Arc<User>>,
    pub transport: Arc<dyn Transport>,
    pub context: Arc<dyn PeerContext>,
    pub protocol_aware: bool,
    pub use_binary: bool,
    pub request_timeout: Duration,
}

impl Connection {
    pub(crate) fn new(parts: ConnectionParts) -> Self {
        Self {
            id: parts.id,
            channel: parts.channel,
            user: parts.user,
            transport: parts.transport,
            context: parts.context,
            protocol_aware: parts.protocol_aware,
            use_binary: AtomicBool::new(parts.use_binary),
            request_timeout: parts.request_timeout,
            subscriptions: RwLock::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
            closing: CancellationToken::new(),
            write_lock: Mutex::new(()),
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Owning user, if the handshake carried an identity.
    pub fn user(&self) -> Option<Arc<User>> {
        self.user.clone()
    }

    /// Context captured at handshake.
    pub fn context(&self) -> Arc<dyn PeerContext> {
        self.context.clone()
    }

    /// Whether the peer speaks the compact frame protocol.
    pub fn is_protocol_aware(&self) -> bool {
        self.protocol_aware
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send binary instead of text messages from now on.
    pub fn set_use_binary(&self, binary: bool) {
        self.use_binary.store(binary, Ordering::Relaxed);
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    /// Push a message with no correlation id.
    pub async fn send(&self, command: &str, message: impl Into<Message>) -> Result<()> {
        self.send_tagged(command, message, None).await
    }

    /// Send a message carrying `request_id`.
    ///
    /// A write failure tears the connection down before the error is
    /// returned.
    pub async fn send_tagged(
        &self,
        command: &str,
        message: impl Into<Message>,
        request_id: Option<RequestId>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed(self.id));
        }
        let message = message.into();
        let data = if self.protocol_aware {
            frame::encode(request_id, command, &message.to_payload()?)
        } else {
            Envelope::new(command, request_id, message.to_value()).encode()?
        };
        let kind = if self.use_binary.load(Ordering::Relaxed) {
            MessageKind::Binary
        } else {
            MessageKind::Text
        };

        // close() cancels `closing`, which abandons a write stuck on a
        // peer that stopped reading.
        let written = tokio::select! {
            () = self.closing.cancelled() => return Err(Error::ConnectionClosed(self.id)),
            written = async {
                let _guard = self.write_lock.lock().await;
                self.transport.write_message(kind, data).await
            } => written,
        };
        if let Err(e) = written {
            warn!(conn_id = %self.id, command, error = %e, "write failed, closing connection");
            self.close().await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Send a request and wait for its answer, using the channel's default
    /// timeout.
    pub async fn request(&self, command: &str, message: impl Into<Message>) -> Result<Bytes> {
        self.request_with_timeout(command, message, self.request_timeout)
            .await
    }

    /// Send a request and wait up to `timeout` for its answer.
    ///
    /// Pending requests are not cancelled when the connection closes; they
    /// end on their own timeout.
    pub async fn request_with_timeout(
        &self,
        command: &str,
        message: impl Into<Message>,
        timeout: Duration,
    ) -> Result<Bytes> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed(self.id));
        }
        let channel = self.channel.upgrade().ok_or(Error::ChannelClosed)?;
        let waiter = channel.requests.register();
        if let Err(e) = self.send_tagged(command, message, Some(waiter.id())).await {
            channel.requests.cancel(&waiter);
            return Err(e);
        }
        channel.requests.wait(waiter, command, timeout).await
    }

    /// Subscribe to `topic`. Repeating a subscription is a no-op.
    pub fn subscribe(self: &Arc<Self>, topic: &str) {
        let topic = topic.trim();
        if topic.is_empty() || self.is_closed() {
            return;
        }
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        channel.add_subscriber(topic, self);
        let _ = self.subscriptions.write().insert(topic.to_owned());
        debug!(conn_id = %self.id, topic, "subscribed");

        // Lost a race with close(): undo so no stale entry remains.
        if self.is_closed() {
            channel.remove_subscriber(topic, self.id);
        }
    }

    /// Drop a subscription.
    pub fn unsubscribe(&self, topic: &str) {
        let topic = topic.trim();
        let removed = self.subscriptions.write().remove(topic);
        if removed {
            if let Some(channel) = self.channel.upgrade() {
                channel.remove_subscriber(topic, self.id);
            }
            debug!(conn_id = %self.id, topic, "unsubscribed");
        }
    }

    /// Whether the connection is subscribed to any topic of a
    /// comma-separated list.
    pub fn is_subscribed(&self, topics: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        let subscriptions = self.subscriptions.read();
        topics
            .split(',')
            .any(|t| subscriptions.contains(t.trim()))
    }

    /// Current subscriptions, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.subscriptions.read().iter().cloned().collect()
    }

    /// This connection, if live and subscribed to any of `topics`.
    pub fn subscribers(self: &Arc<Self>, topics: &str) -> Connections {
        let mut set = Connections::new();
        if self.is_subscribed(topics) {
            set.add(self.clone());
        }
        set
    }

    /// Close the connection. Idempotent.
    ///
    /// The connection leaves the channel, every topic set and its user
    /// before any I/O happens; the user is evicted if this was its last
    /// connection.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closing.cancel();
        self.detach();
        metrics::counter!(DISCONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);

        let teardown = async {
            {
                let _guard = self.write_lock.lock().await;
                if let Err(e) = self
                    .transport
                    .write_message(MessageKind::Close, Bytes::new())
                    .await
                {
                    debug!(conn_id = %self.id, error = %e, "close frame not delivered");
                }
            }
            if let Err(e) = self.transport.close().await {
                debug!(conn_id = %self.id, error = %e, "stream close failed");
            }
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, teardown).await.is_err() {
            debug!(conn_id = %self.id, "stream teardown timed out");
        }
        debug!(conn_id = %self.id, "connection closed");
    }

    fn detach(&self) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let _ = channel.connections.delete(&self.id);
        let topics = std::mem::take(&mut *self.subscriptions.write());
        for topic in &topics {
            channel.remove_subscriber(topic, self.id);
        }
        if let Some(user) = &self.user {
            channel.detach_user(user, self.id);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user", &self.user.as_ref().map(|u| u.id().clone()))
            .field("protocol_aware", &self.protocol_aware)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

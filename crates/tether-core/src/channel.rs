//! The broker: accepts connections, dispatches frames, and owns every
//! registry (connections, users, topics, handlers, pending requests).
//!
//! Several channels may live in one process; nothing here is global.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{Adapter, Peer};
use crate::config::ChannelConfig;
use crate::connection::{Connection, ConnectionId, ConnectionParts};
use crate::connections::{self, Connections};
use crate::context::PeerContext;
use crate::correlator::Correlator;
use crate::errors::{Error, Result};
use crate::frame::{Frame, Origin};
use crate::handler::{self, Handler, Handlers, SUBSCRIBE};
use crate::message::Message;
use crate::metrics::{
    CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, FRAMES_RECEIVED_TOTAL, MALFORMED_FRAMES_TOTAL,
};
use crate::policy::{MalformedFramePolicy, Policies};
use crate::registry::Registry;
use crate::transport::Transport;
use crate::user::{User, UserId};

type TopicSet = Registry<ConnectionId, Arc<Connection>>;

pub(crate) struct ChannelInner {
    config: ChannelConfig,
    policies: Policies,
    next_id: AtomicU64,
    pub(crate) connections: Registry<ConnectionId, Arc<Connection>>,
    users: Registry<UserId, Arc<User>>,
    topics: Registry<String, Arc<TopicSet>>,
    handlers: Handlers,
    pub(crate) requests: Correlator,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl ChannelInner {
    pub(crate) fn add_subscriber(&self, topic: &str, connection: &Arc<Connection>) {
        self.topics.mutate(|topics| {
            let set = topics.entry(topic.to_owned()).or_default();
            let _ = set.set(connection.id(), connection.clone());
        });
    }

    pub(crate) fn remove_subscriber(&self, topic: &str, id: ConnectionId) {
        self.topics.mutate(|topics| {
            let emptied = topics.get(topic).is_some_and(|set| {
                let _ = set.delete(&id);
                set.is_empty()
            });
            if emptied {
                let _ = topics.remove(topic);
            }
        });
    }

    pub(crate) fn detach_user(&self, user: &Arc<User>, id: ConnectionId) {
        self.users.mutate(|users| {
            let _ = user.connections.delete(&id);
            if !user.is_empty() {
                return;
            }
            let current = users.get(user.id()).is_some_and(|u| Arc::ptr_eq(u, user));
            if current {
                let _ = users.remove(user.id());
                debug!(user = %user.id(), "user evicted");
            }
        });
    }
}

/// Broker handle. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Channel with default policies.
    pub fn new(config: ChannelConfig) -> Self {
        Self::with_policies(config, Policies::default())
    }

    /// Channel with explicit policy hooks.
    pub fn with_policies(config: ChannelConfig, policies: Policies) -> Self {
        let channel = Self {
            inner: Arc::new(ChannelInner {
                config,
                policies,
                next_id: AtomicU64::new(1),
                connections: Registry::new(),
                users: Registry::new(),
                topics: Registry::new(),
                handlers: Registry::new(),
                requests: Correlator::new(Origin::Broker),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        };
        channel.read(SUBSCRIBE, |a: Adapter| async move {
            if let Some(connection) = a.connection() {
                // Topics arrive JSON-encoded; bare words are taken as-is.
                let topic = a
                    .json_data::<String>()
                    .unwrap_or_else(|_| a.string_data());
                connection.subscribe(&topic);
            }
        });
        channel
    }

    /// Active configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Whether the policy hooks admit a peer with this context.
    pub fn check_origin(&self, context: &dyn PeerContext) -> bool {
        self.inner.policies.admits(context)
    }

    /// Register a stream as a new connection without starting its read loop.
    ///
    /// [`serve`](Self::serve) is the usual entry point; `accept` is useful
    /// when the caller drives reads itself.
    pub fn accept(
        &self,
        transport: Arc<dyn Transport>,
        context: Arc<dyn PeerContext>,
    ) -> Result<Arc<Connection>> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        if !self.check_origin(context.as_ref()) {
            return Err(Error::OriginRejected);
        }

        let config = &self.inner.config;
        let id = ConnectionId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        transport.set_read_limit(config.max_message_size);
        let protocol_aware = context
            .header(&config.protocol_header)
            .is_some_and(|v| !v.is_empty());
        let user_id = context
            .value(&config.user_key)
            .filter(|v| !v.is_empty())
            .map(UserId::from);

        let parts = |user: Option<Arc<User>>| ConnectionParts {
            id,
            channel: Arc::downgrade(&self.inner),
            user,
            transport: transport.clone(),
            context: context.clone(),
            protocol_aware,
            use_binary: config.use_binary,
            request_timeout: config.request_timeout(),
        };

        let connection = match user_id {
            Some(user_id) => self.inner.users.mutate(|users| {
                let user = users
                    .entry(user_id.clone())
                    .or_insert_with(|| Arc::new(User::new(user_id)))
                    .clone();
                let connection = Arc::new(Connection::new(parts(Some(user.clone()))));
                let _ = user.connections.set(id, connection.clone());
                connection
            }),
            None => Arc::new(Connection::new(parts(None))),
        };
        let _ = self.inner.connections.set(id, connection.clone());

        // close() may have run between the check above and registration.
        if self.is_closed() {
            let connection = connection.clone();
            let _ = tokio::spawn(async move { connection.close().await });
            return Err(Error::ChannelClosed);
        }

        metrics::counter!(CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        let user = connection.user();
        info!(
            conn_id = %id,
            user = user.as_ref().map(|u| u.id().as_str()),
            protocol_aware,
            "connection accepted"
        );
        Ok(connection)
    }

    /// Accept a stream and run its read loop until the peer goes away, the
    /// connection is closed, or the channel shuts down.
    pub async fn serve(
        &self,
        transport: Arc<dyn Transport>,
        context: Arc<dyn PeerContext>,
    ) -> Result<()> {
        let connection = self.accept(transport, context)?;
        self.read_loop(connection).await;
        Ok(())
    }

    #[instrument(skip_all, fields(conn_id = %connection.id()))]
    async fn read_loop(&self, connection: Arc<Connection>) {
        let transport = connection.transport().clone();
        loop {
            let data = tokio::select! {
                () = self.inner.shutdown.cancelled() => break,
                () = connection.closing().cancelled() => break,
                read = transport.read_message() => match read {
                    Ok(data) => data,
                    Err(e) => {
                        debug!(error = %e, "read loop ended");
                        break;
                    }
                },
            };
            let channel = self.clone();
            let sender = connection.clone();
            let _ = tokio::spawn(async move { channel.dispatch(sender, data).await });
        }
        connection.close().await;
    }

    async fn dispatch(&self, connection: Arc<Connection>, data: Bytes) {
        metrics::counter!(FRAMES_RECEIVED_TOTAL).increment(1);
        let frame = match Frame::decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                metrics::counter!(MALFORMED_FRAMES_TOTAL).increment(1);
                match &self.inner.policies.malformed_frames {
                    MalformedFramePolicy::Drop => {
                        debug!(conn_id = %connection.id(), error = %e, "malformed frame dropped");
                    }
                    MalformedFramePolicy::Close => {
                        warn!(conn_id = %connection.id(), error = %e, "malformed frame, closing connection");
                        connection.close().await;
                    }
                    MalformedFramePolicy::Custom(hook) => hook(connection.as_ref(), &data[..], &e),
                }
                return;
            }
        };

        if let Some(id) = frame.request_id {
            if id.origin() == Origin::Broker {
                let _ = self.inner.requests.resolve(id, frame.payload);
                return;
            }
        }

        let command = frame.command.clone();
        let adapter = Adapter::new(
            frame.command,
            frame.payload,
            frame.request_id,
            Peer::Connection(connection.clone()),
        );
        if !handler::dispatch(&self.inner.handlers, adapter).await {
            debug!(conn_id = %connection.id(), %command, "no handler for command");
        }
    }

    /// Register a handler for `command`. Handlers for one command run in
    /// registration order for each frame.
    ///
    /// Each inbound frame is dispatched on its own task, so handlers may
    /// observe frames from one connection out of arrival order.
    pub fn read(&self, command: &str, handler: impl Handler) {
        self.inner
            .handlers
            .append(command.to_owned(), Arc::new(handler) as Arc<dyn Handler>);
    }

    /// Broadcast to every live connection.
    pub async fn send(&self, command: &str, message: impl Into<Message>) -> Result<()> {
        let targets = self.inner.connections.values();
        connections::send_all(&targets, command, &message.into()).await
    }

    /// Connections subscribed to any of the comma-separated `topics`.
    pub fn subscribers(&self, topics: &str) -> Connections {
        let mut set = Connections::new();
        for topic in topics.split(',').map(str::trim) {
            if let Some(members) = self.inner.topics.get(&topic.to_owned()) {
                for connection in members.values() {
                    set.add(connection);
                }
            }
        }
        set
    }

    /// A user by identity.
    pub fn user(&self, id: &UserId) -> Option<Arc<User>> {
        self.inner.users.get(id)
    }

    /// A connection by id.
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.connections.get(&id)
    }

    /// Snapshot of every live connection.
    pub fn connections(&self) -> Connections {
        self.inner.connections.values().into_iter().collect()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Number of users with at least one live connection.
    pub fn user_count(&self) -> usize {
        self.inner.users.len()
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.inner.topics.len()
    }

    /// Requests still waiting for an answer.
    pub fn pending_requests(&self) -> usize {
        self.inner.requests.len()
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop every read loop and close every live connection. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        let live = self.inner.connections.values();
        let _ = join_all(live.iter().map(|c| c.close())).await;
        info!(connections = live.len(), "channel closed");
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("connections", &self.connection_count())
            .field("users", &self.user_count())
            .field("topics", &self.topic_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

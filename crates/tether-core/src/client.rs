//! Reconnecting client.
//!
//! A background task owns the stream and loops
//! `Disconnected → Connecting → Connected → Disconnected` until
//! [`Client::close`] is called. Sends never block: they go into a bounded
//! queue that the task drains while connected. Subscriptions are committed
//! locally and replayed on every (re)connect, before any queued send.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{Adapter, Peer};
use crate::config::ClientConfig;
use crate::correlator::Correlator;
use crate::errors::{Error, Result, TransportError};
use crate::frame::{self, Frame, Origin, RequestId};
use crate::handler::{self, Handler, Handlers, SUBSCRIBE};
use crate::message::Message;
use crate::metrics::CLIENT_DIALS_TOTAL;
use crate::registry::Registry;
use crate::transport::tungstenite::TungsteniteDialer;
use crate::transport::{Dialer, MessageKind, Transport};

/// Connection state of a [`Client`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// No stream; waiting to dial or closed.
    Disconnected,
    /// Dialing.
    Connecting,
    /// Stream up and subscriptions replayed.
    Connected,
}

struct ClientInner {
    config: ClientConfig,
    url: RwLock<Option<String>>,
    dialer: Arc<dyn Dialer>,
    outbound: mpsc::Sender<Bytes>,
    handlers: Handlers,
    requests: Correlator,
    subscriptions: RwLock<BTreeSet<String>>,
    state: watch::Sender<ClientState>,
    restart: Notify,
    shutdown: CancellationToken,
}

/// Handle to a reconnecting client. Cheap to clone; clones share the
/// connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Start a client for `url` using the WebSocket dialer.
    ///
    /// Must be called inside a Tokio runtime. Returns immediately; use
    /// [`wait_for_state`](Self::wait_for_state) to wait for the first
    /// connection.
    pub fn connect(url: impl Into<String>, config: ClientConfig) -> Self {
        let dialer = TungsteniteDialer::new(&*config.protocol_header, config.handshake_timeout());
        Self::with_dialer(url, config, Arc::new(dialer))
    }

    /// Start a client with a custom dialer.
    pub fn with_dialer(url: impl Into<String>, config: ClientConfig, dialer: Arc<dyn Dialer>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (state, _) = watch::channel(ClientState::Disconnected);
        let inner = Arc::new(ClientInner {
            config,
            url: RwLock::new(Some(url.into())),
            dialer,
            outbound: tx,
            handlers: Registry::new(),
            requests: Correlator::new(Origin::Client),
            subscriptions: RwLock::new(BTreeSet::new()),
            state,
            restart: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let _ = tokio::spawn(run(inner.clone(), rx));
        Self { inner }
    }

    /// Current state.
    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Receiver observing every state change.
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Wait until the client reaches `target`, for at most `timeout`.
    /// Returns whether the state was reached.
    pub async fn wait_for_state(&self, target: ClientState, timeout: Duration) -> bool {
        let mut rx = self.watch_state();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await;
        reached.is_ok_and(|r| r.is_ok())
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Queue a message with no correlation id.
    pub fn send(&self, command: &str, message: impl Into<Message>) -> Result<()> {
        self.send_tagged(command, message, None)
    }

    /// Queue a message carrying `request_id`.
    pub fn send_tagged(
        &self,
        command: &str,
        message: impl Into<Message>,
        request_id: Option<RequestId>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }
        let payload = message.into().to_payload()?;
        self.inner
            .outbound
            .try_send(frame::encode(request_id, command, &payload))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::QueueFull,
                mpsc::error::TrySendError::Closed(_) => Error::ClientClosed,
            })
    }

    /// Send a request and wait for its answer with the configured timeout.
    pub async fn request(&self, command: &str, message: impl Into<Message>) -> Result<Bytes> {
        let timeout = self.inner.config.request_timeout();
        self.request_with_timeout(command, message, timeout).await
    }

    /// Send a request and wait up to `timeout` for its answer.
    pub async fn request_with_timeout(
        &self,
        command: &str,
        message: impl Into<Message>,
        timeout: Duration,
    ) -> Result<Bytes> {
        let waiter = self.inner.requests.register();
        if let Err(e) = self.send_tagged(command, message, Some(waiter.id())) {
            self.inner.requests.cancel(&waiter);
            return Err(e);
        }
        self.inner.requests.wait(waiter, command, timeout).await
    }

    /// Requests still waiting for an answer.
    pub fn pending_requests(&self) -> usize {
        self.inner.requests.len()
    }

    /// Register a handler for frames the broker pushes under `command`.
    pub fn read(&self, command: &str, handler: impl Handler) {
        self.inner
            .handlers
            .append(command.to_owned(), Arc::new(handler) as Arc<dyn Handler>);
    }

    /// Subscribe to `topic`; the subscription survives reconnects.
    pub fn subscribe(&self, topic: &str) -> Result<()> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Ok(());
        }
        let added = self.inner.subscriptions.write().insert(topic.to_owned());
        // The replay snapshot is taken after the state flips to Connected,
        // so a topic missed by it is sent here.
        if added && self.state() == ClientState::Connected {
            self.send(SUBSCRIBE, topic)?;
        }
        Ok(())
    }

    /// Drop a subscription. There is no unsubscribe on the wire, so a live
    /// connection is restarted to reset the broker's view.
    pub fn unsubscribe(&self, topic: &str) {
        let removed = self.inner.subscriptions.write().remove(topic.trim());
        if removed && self.state() == ClientState::Connected {
            self.inner.restart.notify_one();
        }
    }

    /// Committed subscriptions, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.read().iter().cloned().collect()
    }

    /// Switch to another broker; the current connection is restarted.
    pub fn change_url(&self, url: impl Into<String>) {
        *self.inner.url.write() = Some(url.into());
        self.inner.restart.notify_one();
    }

    /// Stop the client. Queued sends are dropped; pending requests end on
    /// their own timeout.
    pub fn close(&self) {
        *self.inner.url.write() = None;
        self.inner.shutdown.cancel();
    }

    async fn dispatch(&self, data: Bytes) {
        let frame = match Frame::decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "malformed frame dropped");
                return;
            }
        };
        if let Some(id) = frame.request_id {
            if id.origin() == Origin::Client {
                let _ = self.inner.requests.resolve(id, frame.payload);
                return;
            }
        }
        let command = frame.command.clone();
        let adapter = Adapter::new(
            frame.command,
            frame.payload,
            frame.request_id,
            Peer::Client(self.clone()),
        );
        if !handler::dispatch(&self.inner.handlers, adapter).await {
            debug!(%command, "no handler for command");
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("url", &*self.inner.url.read())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    fn set_state(&self, state: ClientState) {
        let _ = self.state.send_replace(state);
    }

    fn current_url(&self) -> Option<String> {
        self.url.read().clone()
    }

    /// Replay committed topics, then the frame whose write failed last
    /// session, straight onto the new stream.
    async fn replay(
        &self,
        transport: &dyn Transport,
        unsent: &mut Option<Bytes>,
    ) -> std::result::Result<(), TransportError> {
        let topics: Vec<String> = self.subscriptions.read().iter().cloned().collect();
        for topic in topics {
            let payload = serde_json::Value::String(topic).to_string();
            transport
                .write_message(
                    MessageKind::Text,
                    frame::encode(None, SUBSCRIBE, payload.as_bytes()),
                )
                .await?;
        }
        if let Some(data) = unsent.take() {
            if let Err(e) = transport.write_message(MessageKind::Text, data.clone()).await {
                *unsent = Some(data);
                return Err(e);
            }
        }
        Ok(())
    }
}

async fn run(inner: Arc<ClientInner>, mut outbound: mpsc::Receiver<Bytes>) {
    let mut unsent = None;
    while let Some(url) = inner.current_url() {
        inner.set_state(ClientState::Connecting);
        let dialed = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            dialed = inner.dialer.dial(&url) => dialed,
        };
        match dialed {
            Ok(transport) => {
                metrics::counter!(CLIENT_DIALS_TOTAL, "status" => "success").increment(1);
                // A restart requested while not connected is settled by
                // this dial or by the url check below.
                let _ = inner.restart.notified().now_or_never();
                if inner.current_url().as_deref() == Some(url.as_str()) {
                    info!(%url, "connected");
                    session(&inner, transport, &mut outbound, &mut unsent).await;
                    info!(%url, "disconnected");
                } else {
                    debug!(%url, "url changed while dialing");
                    if let Err(e) = transport.close().await {
                        debug!(error = %e, "stream close failed");
                    }
                }
            }
            Err(e) => {
                metrics::counter!(CLIENT_DIALS_TOTAL, "status" => "failure").increment(1);
                warn!(%url, error = %e, "dial failed");
            }
        }
        inner.set_state(ClientState::Disconnected);

        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            () = tokio::time::sleep(inner.config.reconnect_delay()) => {}
        }
    }
    inner.set_state(ClientState::Disconnected);
    debug!("client stopped");
}

#[instrument(skip_all)]
async fn session(
    inner: &Arc<ClientInner>,
    transport: Arc<dyn Transport>,
    outbound: &mut mpsc::Receiver<Bytes>,
    unsent: &mut Option<Bytes>,
) {
    transport.set_read_limit(inner.config.max_message_size);
    inner.set_state(ClientState::Connected);

    match inner.replay(transport.as_ref(), unsent).await {
        Ok(()) => {
            let token = inner.shutdown.child_token();
            let reader = tokio::spawn(read_loop(inner.clone(), transport.clone(), token.clone()));
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = inner.restart.notified() => {
                        debug!("restart requested");
                        break;
                    }
                    next = outbound.recv() => {
                        let Some(data) = next else { break };
                        if let Err(e) = transport.write_message(MessageKind::Text, data.clone()).await {
                            debug!(error = %e, "write failed");
                            *unsent = Some(data);
                            break;
                        }
                    }
                }
            }
            token.cancel();
            let _ = reader.await;
        }
        Err(e) => debug!(error = %e, "subscription replay failed"),
    }

    if let Err(e) = transport.close().await {
        debug!(error = %e, "stream close failed");
    }
}

async fn read_loop(inner: Arc<ClientInner>, transport: Arc<dyn Transport>, token: CancellationToken) {
    loop {
        let data = tokio::select! {
            () = token.cancelled() => break,
            read = transport.read_message() => match read {
                Ok(data) => data,
                Err(e) => {
                    debug!(error = %e, "read loop ended");
                    break;
                }
            },
        };
        let client = Client { inner: inner.clone() };
        let _ = tokio::spawn(async move { client.dispatch(data).await });
    }
    token.cancel();
}

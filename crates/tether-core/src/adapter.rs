//! The view of one inbound frame handed to handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::client::Client;
use crate::connection::Connection;
use crate::connections::Connections;
use crate::context::PeerContext;
use crate::errors::{Error, Result};
use crate::frame::RequestId;
use crate::message::Message;
use crate::user::User;

/// Where a frame came from.
#[derive(Clone)]
pub enum Peer {
    /// A connection accepted by a channel.
    Connection(Arc<Connection>),
    /// The remote broker of a client.
    Client(Client),
}

/// One inbound frame plus the means to answer it.
///
/// Clones share the answered flag: across every handler of a frame at most
/// one reply is sent.
#[derive(Clone)]
pub struct Adapter {
    command: Arc<str>,
    payload: Bytes,
    request_id: Option<RequestId>,
    peer: Peer,
    answered: Arc<AtomicBool>,
}

impl Adapter {
    pub(crate) fn new(
        command: impl Into<Arc<str>>,
        payload: Bytes,
        request_id: Option<RequestId>,
        peer: Peer,
    ) -> Self {
        Self {
            command: command.into(),
            payload,
            request_id,
            peer,
            answered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Command the frame was sent under.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Raw payload.
    pub fn data(&self) -> &Bytes {
        &self.payload
    }

    /// Payload as text, with one pair of surrounding double quotes removed.
    pub fn string_data(&self) -> String {
        let text = String::from_utf8_lossy(&self.payload);
        let text = text.trim();
        text.strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .unwrap_or(text)
            .to_owned()
    }

    /// Payload decoded as JSON.
    pub fn json_data<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Correlation id of the frame.
    pub fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    /// Sender of the frame.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Originating connection, on the broker side.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        match &self.peer {
            Peer::Connection(c) => Some(c),
            Peer::Client(_) => None,
        }
    }

    /// Receiving client, on the client side.
    pub fn client(&self) -> Option<&Client> {
        match &self.peer {
            Peer::Client(c) => Some(c),
            Peer::Connection(_) => None,
        }
    }

    /// User owning the originating connection.
    pub fn user(&self) -> Option<Arc<User>> {
        self.connection().and_then(|c| c.user())
    }

    /// Handshake context of the originating connection.
    pub fn context(&self) -> Option<Arc<dyn PeerContext>> {
        self.connection().map(|c| c.context())
    }

    /// The originating connection, if subscribed to any of `topics`.
    pub fn subscribers(&self, topics: &str) -> Connections {
        self.connection()
            .map(|c| c.subscribers(topics))
            .unwrap_or_default()
    }

    /// Answer the frame: same command, same request id.
    ///
    /// Only the first call across all clones sends; later calls return
    /// [`Error::AlreadyAnswered`].
    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        if self.answered.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyAnswered);
        }
        match &self.peer {
            Peer::Connection(c) => {
                c.send_tagged(&self.command, message, self.request_id)
                    .await
            }
            Peer::Client(c) => c.send_tagged(&self.command, message, self.request_id),
        }
    }

    /// Whether a reply was already sent.
    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::Acquire)
    }

    /// Close the originating side: the connection, or the client.
    pub async fn close(&self) {
        match &self.peer {
            Peer::Connection(c) => c.close().await,
            Peer::Client(c) => c.close(),
        }
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("command", &self.command)
            .field("request_id", &self.request_id)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

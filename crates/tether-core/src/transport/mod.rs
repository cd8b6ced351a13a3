//! Stream capability supplied by handshake adapters.
//!
//! A [`Transport`] is one upgraded full-duplex message stream. Reads and
//! writes may run concurrently from different tasks; concurrent writes are
//! serialized by the owner (see [`Connection`](crate::connection::Connection)).

pub mod memory;
pub mod tungstenite;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::TransportError;

/// Kind of an outbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text message.
    Text,
    /// Binary message.
    Binary,
    /// Close control message; the data is ignored.
    Close,
}

/// One upgraded bidirectional message stream.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Reject inbound messages larger than `limit` bytes.
    fn set_read_limit(&self, limit: usize);

    /// Block until the next data message arrives.
    ///
    /// Control frames are handled internally. A close from the peer, or any
    /// failure, is returned as an error and ends the stream. Must be
    /// cancel-safe: the read loop races it against a close signal.
    async fn read_message(&self) -> Result<Bytes, TransportError>;

    /// Write one message.
    async fn write_message(&self, kind: MessageKind, data: Bytes) -> Result<(), TransportError>;

    /// Close the stream. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Dials outbound streams for a [`Client`](crate::client::Client).
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a new stream to `url`, announcing the compact protocol.
    async fn dial(&self, url: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

/// An outbound message validated for its kind, ready to map onto a
/// concrete socket's message type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Text payload, checked to be UTF-8.
    Text(String),
    /// Binary payload.
    Binary(Bytes),
    /// Close control message.
    Close,
}

impl Outbound {
    /// Pair `data` with `kind`. Text must be valid UTF-8.
    pub fn new(kind: MessageKind, data: Bytes) -> Result<Self, TransportError> {
        Ok(match kind {
            MessageKind::Text => Self::Text(
                String::from_utf8(data.into()).map_err(|e| TransportError::Io(e.to_string()))?,
            ),
            MessageKind::Binary => Self::Binary(data),
            MessageKind::Close => Self::Close,
        })
    }
}

/// Enforce a read limit set through [`Transport::set_read_limit`]
/// (`0` = unlimited).
pub fn check_limit(size: usize, limit: usize) -> Result<(), TransportError> {
    if limit > 0 && size > limit {
        Err(TransportError::MessageTooLarge { size, limit })
    } else {
        Ok(())
    }
}

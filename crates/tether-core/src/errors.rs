//! Error taxonomy.
//!
//! Every failure is scoped to one connection or one request; nothing here is
//! process-fatal.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionId;

/// Failures of the underlying byte stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The stream was closed by either side.
    #[error("stream closed")]
    Closed,
    /// An inbound message exceeded the configured read limit.
    #[error("message of {size} bytes exceeds read limit of {limit} bytes")]
    MessageTooLarge {
        /// Size of the offending message.
        size: usize,
        /// Active read limit.
        limit: usize,
    },
    /// Handshake with the remote endpoint failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// Any other I/O or protocol-level failure reported by the stream.
    #[error("{0}")]
    Io(String),
}

/// A frame that could not be decoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer than three `:`-separated segments.
    #[error("frame has fewer than 3 segments")]
    MissingSegments,
    /// The request id segment is not a signed integer.
    #[error("invalid request id {0:?}")]
    InvalidRequestId(String),
    /// The request id is a valid integer but has no representation.
    #[error("request id {0} is out of range")]
    RequestIdOutOfRange(i64),
    /// The command segment is not UTF-8.
    #[error("command is not valid UTF-8")]
    InvalidCommand,
}

/// One failed target of a multi-target send.
#[derive(Debug)]
pub struct BroadcastFailure {
    /// The connection that could not be reached.
    pub connection_id: ConnectionId,
    /// Why.
    pub error: Error,
}

/// Aggregated failures of a broadcast. Only failed targets are listed.
#[derive(Debug, Default)]
pub struct BroadcastError {
    /// Failures in attempt order.
    pub failures: Vec<BroadcastFailure>,
}

impl BroadcastError {
    /// Ids of every connection that failed.
    pub fn failed_ids(&self) -> Vec<ConnectionId> {
        self.failures.iter().map(|f| f.connection_id).collect()
    }

    /// Number of failed targets.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Whether no target failed.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn push(&mut self, connection_id: ConnectionId, error: Error) {
        self.failures.push(BroadcastFailure {
            connection_id,
            error,
        });
    }

    pub(crate) fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Broadcast(self))
        }
    }
}

impl fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "connection {}: {}", failure.connection_id, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for BroadcastError {}

/// Errors returned by channel, connection and client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Read or write failure on the stream.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// Malformed inbound frame.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// No answer arrived before the deadline.
    #[error("{command:?} request timeout after {timeout:?}")]
    RequestTimeout {
        /// Command that was requested.
        command: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },
    /// The connection was already closed.
    #[error("connection {0} already closed")]
    ConnectionClosed(ConnectionId),
    /// The channel was already closed.
    #[error("channel is closed")]
    ChannelClosed,
    /// The client was closed.
    #[error("client is closed")]
    ClientClosed,
    /// Some targets of a multi-target send failed.
    #[error("broadcast failed: {0}")]
    Broadcast(BroadcastError),
    /// The outbound message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    /// The client's outbound queue is full.
    #[error("outbound queue is full")]
    QueueFull,
    /// The origin check hook refused the peer.
    #[error("origin rejected")]
    OriginRejected,
    /// The frame was already answered through this adapter.
    #[error("frame already answered")]
    AlreadyAnswered,
}

/// Result type for tether operations.
pub type Result<T> = std::result::Result<T, Error>;

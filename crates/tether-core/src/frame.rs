//! Wire codec.
//!
//! A compact frame is `"<requestID>:<command>:<payload>"`. The payload is
//! opaque: splitting stops after the second `:` so the payload may itself
//! contain colons.
//!
//! Request ids carry their origin explicitly ([`RequestId`]). On the wire a
//! broker-originated id is written negative and a client-originated id
//! positive; `0` means "no correlation". The answering side echoes the id
//! unchanged, so the sign always names the side that asked.
//!
//! Peers that did not announce themselves as protocol-aware at handshake
//! receive an [`Envelope`] instead of the compact form.

use std::fmt;
use std::num::NonZeroU64;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

const DELIMITER: u8 = b':';

/// Which side of the stream allocated a request id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Allocated by a [`Channel`](crate::channel::Channel) connection.
    Broker,
    /// Allocated by a [`Client`](crate::client::Client) or other peer.
    Client,
}

/// Correlation id of a request and its answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId {
    origin: Origin,
    seq: NonZeroU64,
}

impl RequestId {
    /// Build an id. Returns `None` for `0` or sequences above `i64::MAX`,
    /// which have no wire representation.
    pub fn new(origin: Origin, seq: u64) -> Option<Self> {
        if i64::try_from(seq).is_err() {
            return None;
        }
        NonZeroU64::new(seq).map(|seq| Self { origin, seq })
    }

    /// Side that allocated the id.
    pub fn origin(self) -> Origin {
        self.origin
    }

    /// Unsigned sequence number within the origin's id space.
    pub fn seq(self) -> u64 {
        self.seq.get()
    }

    /// Signed wire value.
    pub fn to_wire(self) -> i64 {
        // `new` guarantees seq <= i64::MAX.
        let magnitude = i64::try_from(self.seq.get()).unwrap_or(i64::MAX);
        match self.origin {
            Origin::Broker => -magnitude,
            Origin::Client => magnitude,
        }
    }

    /// Parse a signed wire value. `0` decodes to `None`.
    pub fn from_wire(value: i64) -> Result<Option<Self>, ProtocolError> {
        let origin = match value.signum() {
            0 => return Ok(None),
            -1 => Origin::Broker,
            _ => Origin::Client,
        };
        Self::new(origin, value.unsigned_abs())
            .map(Some)
            .ok_or(ProtocolError::RequestIdOutOfRange(value))
    }

    /// Wire value of an optional id.
    pub fn wire_or_zero(id: Option<Self>) -> i64 {
        id.map_or(0, Self::to_wire)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

/// One decoded compact frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Correlation id, if any.
    pub request_id: Option<RequestId>,
    /// Command / topic name.
    pub command: String,
    /// Opaque payload.
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame.
    pub fn new(request_id: Option<RequestId>, command: impl Into<String>, payload: Bytes) -> Self {
        Self {
            request_id,
            command: command.into(),
            payload,
        }
    }

    /// Decode a compact frame.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut parts = data.splitn(3, |b| *b == DELIMITER);
        let (Some(id), Some(command), Some(payload)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::MissingSegments);
        };

        let id_text = std::str::from_utf8(id)
            .map_err(|_| ProtocolError::InvalidRequestId(String::from_utf8_lossy(id).into_owned()))?;
        let wire: i64 = id_text
            .trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidRequestId(id_text.to_owned()))?;
        let command = std::str::from_utf8(command).map_err(|_| ProtocolError::InvalidCommand)?;

        Ok(Self {
            request_id: RequestId::from_wire(wire)?,
            command: command.to_owned(),
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Encode to the compact wire form.
    pub fn encode(&self) -> Bytes {
        encode(self.request_id, &self.command, &self.payload)
    }
}

/// Encode a compact frame without building a [`Frame`] first.
///
/// Any `:` in `command` is replaced by `_` so the command can never spill
/// into the payload segment.
pub fn encode(request_id: Option<RequestId>, command: &str, payload: &[u8]) -> Bytes {
    let id = RequestId::wire_or_zero(request_id).to_string();
    let command = sanitize_command(command);
    let mut buf = BytesMut::with_capacity(id.len() + command.len() + payload.len() + 2);
    buf.put_slice(id.as_bytes());
    buf.put_u8(DELIMITER);
    buf.put_slice(command.as_bytes());
    buf.put_u8(DELIMITER);
    buf.put_slice(payload);
    buf.freeze()
}

/// Replace the frame delimiter in a command name.
pub fn sanitize_command(command: &str) -> std::borrow::Cow<'_, str> {
    if command.contains(':') {
        std::borrow::Cow::Owned(command.replace(':', "_"))
    } else {
        std::borrow::Cow::Borrowed(command)
    }
}

/// Structured form sent to peers that are not protocol-aware.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Command / topic name.
    pub command: String,
    /// Client-originated id being answered, or `0`.
    #[serde(rename = "requestID")]
    pub request_id: i64,
    /// Broker-originated id being asked, or `0`.
    #[serde(rename = "srvRequestID")]
    pub srv_request_id: i64,
    /// Message body.
    pub data: serde_json::Value,
}

impl Envelope {
    /// Build an envelope, placing the id in the field matching its origin.
    pub fn new(command: &str, request_id: Option<RequestId>, data: serde_json::Value) -> Self {
        let (request_id, srv_request_id) = match request_id {
            Some(id) if id.origin() == Origin::Broker => (0, id.to_wire()),
            Some(id) => (id.to_wire(), 0),
            None => (0, 0),
        };
        Self {
            command: command.to_owned(),
            request_id,
            srv_request_id,
            data,
        }
    }

    /// Serialize to JSON bytes.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

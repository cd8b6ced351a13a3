//! Outbound message bodies.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

/// Body of an outbound frame.
///
/// Raw bytes are written as-is; structured values are JSON-encoded.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Pre-encoded payload, passed through untouched.
    Raw(Bytes),
    /// Structured value, JSON-encoded on send.
    Json(Value),
}

impl Message {
    /// Serialize any value into a structured message.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::Json)
    }

    /// Raw bytes message.
    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        Self::Raw(bytes.into())
    }

    /// JSON `null`.
    pub fn null() -> Self {
        Self::Json(Value::Null)
    }

    /// Payload bytes for the compact wire form.
    pub fn to_payload(&self) -> Result<Bytes, serde_json::Error> {
        match self {
            Self::Raw(bytes) => Ok(bytes.clone()),
            Self::Json(value) => serde_json::to_vec(value).map(Bytes::from),
        }
    }

    /// Value for the `data` field of an envelope.
    ///
    /// Raw bytes holding valid JSON are embedded as that JSON; anything else
    /// becomes a string.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Json(value) => value.clone(),
            Self::Raw(bytes) => serde_json::from_slice(bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
        }
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Bytes> for Message {
    fn from(bytes: Bytes) -> Self {
        Self::Raw(bytes)
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Raw(bytes.into())
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::Json(Value::String(text.to_owned()))
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::Json(Value::String(text))
    }
}

impl From<()> for Message {
    fn from((): ()) -> Self {
        Self::null()
    }
}

//! In-process transport pair.
//!
//! Both ends share one link: closing either end (or writing a close message)
//! ends the stream in both directions, like a torn-down socket.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::{MessageKind, Transport, check_limit};
use crate::errors::TransportError;

/// One end of an in-memory stream.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    link: CancellationToken,
    read_limit: AtomicUsize,
}

/// Create two connected ends.
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let link = CancellationToken::new();
    let a = MemoryTransport {
        tx: b_tx,
        rx: Mutex::new(a_rx),
        link: link.clone(),
        read_limit: AtomicUsize::new(0),
    };
    let b = MemoryTransport {
        tx: a_tx,
        rx: Mutex::new(b_rx),
        link,
        read_limit: AtomicUsize::new(0),
    };
    (a, b)
}

impl MemoryTransport {
    /// Whether the link has been torn down.
    pub fn is_closed(&self) -> bool {
        self.link.is_cancelled()
    }

    /// Read the next message as UTF-8 text (test convenience).
    pub async fn read_text(&self) -> Result<String, TransportError> {
        let data = self.read_message().await?;
        String::from_utf8(data.to_vec()).map_err(|e| TransportError::Io(e.to_string()))
    }

    /// Write a text message (test convenience).
    pub async fn write_text(&self, text: &str) -> Result<(), TransportError> {
        self.write_message(MessageKind::Text, Bytes::copy_from_slice(text.as_bytes()))
            .await
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn set_read_limit(&self, limit: usize) {
        self.read_limit.store(limit, Ordering::Relaxed);
    }

    async fn read_message(&self) -> Result<Bytes, TransportError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            msg = rx.recv() => match msg {
                Some(data) => {
                    check_limit(data.len(), self.read_limit.load(Ordering::Relaxed))?;
                    Ok(data)
                }
                None => Err(TransportError::Closed),
            },
            () = self.link.cancelled() => Err(TransportError::Closed),
        }
    }

    async fn write_message(&self, kind: MessageKind, data: Bytes) -> Result<(), TransportError> {
        if self.link.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if kind == MessageKind::Close {
            self.link.cancel();
            return Ok(());
        }
        self.tx.send(data).map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.link.cancel();
        Ok(())
    }
}

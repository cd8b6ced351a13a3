//! [`Transport`] over an axum WebSocket.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tether_core::transport::{Outbound, check_limit};
use tether_core::{MessageKind, Transport, TransportError};
use tokio::sync::Mutex;
use tracing::debug;

/// An upgraded axum socket, split so reads and writes can proceed
/// concurrently.
pub struct AxumTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
    read_limit: AtomicUsize,
}

impl AxumTransport {
    /// Wrap an upgraded socket.
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            read_limit: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transport for AxumTransport {
    fn set_read_limit(&self, limit: usize) {
        self.read_limit.store(limit, Ordering::Relaxed);
    }

    async fn read_message(&self) -> Result<Bytes, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            let msg = match stream.next().await {
                None => return Err(TransportError::Closed),
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                Some(Ok(msg)) => msg,
            };
            match msg {
                Message::Text(_) | Message::Binary(_) => {
                    let data = msg.into_data();
                    check_limit(data.len(), self.read_limit.load(Ordering::Relaxed))?;
                    return Ok(data);
                }
                Message::Close(_) => return Err(TransportError::Closed),
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }

    async fn write_message(&self, kind: MessageKind, data: Bytes) -> Result<(), TransportError> {
        let msg = match Outbound::new(kind, data)? {
            Outbound::Text(text) => Message::text(text),
            Outbound::Binary(data) => Message::binary(data),
            Outbound::Close => Message::Close(None),
        };
        self.sink
            .lock()
            .await
            .send(msg)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Err(e) = self.sink.lock().await.close().await {
            debug!(error = %e, "websocket close after teardown");
        }
        Ok(())
    }
}

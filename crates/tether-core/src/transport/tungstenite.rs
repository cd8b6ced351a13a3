//! `tokio-tungstenite` stream wrapper and the default client dialer.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::debug;

use super::{Dialer, MessageKind, Outbound, Transport, check_limit};
use crate::errors::TransportError;

/// A [`Transport`] over a tungstenite WebSocket stream.
pub struct WebSocketTransport<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    read_limit: AtomicUsize,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established WebSocket stream.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            read_limit: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
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
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
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

/// Default [`Dialer`]: `tokio_tungstenite::connect_async` with the
/// protocol-aware header set.
#[derive(Clone, Debug)]
pub struct TungsteniteDialer {
    protocol_header: String,
    handshake_timeout: Duration,
}

impl TungsteniteDialer {
    /// Dialer announcing itself through `protocol_header`.
    pub fn new(protocol_header: impl Into<String>, handshake_timeout: Duration) -> Self {
        Self {
            protocol_header: protocol_header.into(),
            handshake_timeout,
        }
    }
}

#[async_trait]
impl Dialer for TungsteniteDialer {
    async fn dial(&self, url: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let name = HeaderName::from_bytes(self.protocol_header.as_bytes())
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let _ = request
            .headers_mut()
            .insert(name, HeaderValue::from_static("true"));

        let (ws, _response) =
            tokio::time::timeout(self.handshake_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| TransportError::Handshake("handshake timed out".into()))?
                .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(Arc::new(WebSocketTransport::new(ws)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn socket_pair() -> (
        WebSocketTransport<tokio::io::DuplexStream>,
        WebSocketTransport<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (WebSocketTransport::new(client), WebSocketTransport::new(server))
    }

    #[tokio::test]
    async fn text_round_trip() {
        let (client, server) = socket_pair().await;
        client
            .write_message(MessageKind::Text, Bytes::from_static(b"1:ping:null"))
            .await
            .unwrap();
        let data = server.read_message().await.unwrap();
        assert_eq!(&data[..], b"1:ping:null");
    }

    #[tokio::test]
    async fn binary_is_delivered_as_bytes() {
        let (client, server) = socket_pair().await;
        server
            .write_message(MessageKind::Binary, Bytes::from_static(b"\x00\x01"))
            .await
            .unwrap();
        assert_eq!(&client.read_message().await.unwrap()[..], b"\x00\x01");
    }

    #[tokio::test]
    async fn close_message_ends_peer_reads() {
        let (client, server) = socket_pair().await;
        client
            .write_message(MessageKind::Close, Bytes::new())
            .await
            .unwrap();
        assert_eq!(server.read_message().await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn read_limit_rejects_large_messages() {
        let (client, server) = socket_pair().await;
        server.set_read_limit(4);
        client
            .write_message(MessageKind::Text, Bytes::from_static(b"too long"))
            .await
            .unwrap();
        assert_eq!(
            server.read_message().await,
            Err(TransportError::MessageTooLarge { size: 8, limit: 4 })
        );
    }

    #[tokio::test]
    async fn invalid_utf8_text_is_rejected() {
        let (client, _server) = socket_pair().await;
        let err = client
            .write_message(MessageKind::Text, Bytes::from_static(b"\xff"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[tokio::test]
    async fn dial_bad_url_is_handshake_error() {
        let dialer = TungsteniteDialer::new("ws-client", Duration::from_millis(200));
        let err = dialer.dial("not a url").await.err().unwrap();
        assert!(matches!(err, TransportError::Handshake(_)));
    }
}

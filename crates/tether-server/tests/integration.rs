//! End-to-end tests against a real listener, using raw tungstenite sockets
//! and the tether client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Extension;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tether_core::{
    Adapter, Channel, ChannelConfig, Client, ClientConfig, ClientState, Envelope, PeerContext,
    Policies, UserId,
};
use tether_server::{ChannelServer, ContextValues, ServerConfig};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Boot a server on an auto-assigned port.
async fn boot_server(server: ChannelServer) -> (SocketAddr, Arc<ChannelServer>) {
    let server = Arc::new(server);
    let (addr, _handle) = server.listen().await.unwrap();
    (addr, server)
}

async fn boot_default() -> (SocketAddr, Arc<ChannelServer>) {
    let server = ChannelServer::new(ServerConfig::default());
    server.channel().read("echo", |a: Adapter| async move {
        let _ = a.send(a.string_data()).await;
    });
    boot_server(server).await
}

fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{addr}/ws")
}

/// Open a raw socket, optionally announcing the compact protocol.
async fn connect_raw(addr: SocketAddr, compact: bool) -> WsStream {
    let mut request = ws_url(addr).into_client_request().unwrap();
    if compact {
        let _ = request
            .headers_mut()
            .insert("ws-client", HeaderValue::from_static("true"));
    }
    let (ws, _) = timeout(TIMEOUT, connect_async(request))
        .await
        .unwrap()
        .unwrap();
    ws
}

async fn send_text(ws: &mut WsStream, text: &str) {
    ws.send(Message::text(text)).await.unwrap();
}

/// Next data message as text, skipping control frames.
async fn next_text(ws: &mut WsStream) -> String {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return text.as_str().to_owned(),
            Message::Binary(data) => return String::from_utf8(data.to_vec()).unwrap(),
            _ => {}
        }
    }
}

async fn wait_until(check: impl Fn() -> bool) {
    timeout(TIMEOUT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

// ── Raw protocol ──

#[tokio::test]
async fn compact_request_is_answered_with_same_id() {
    let (addr, _server) = boot_default().await;
    let mut ws = connect_raw(addr, true).await;

    send_text(&mut ws, r#"7:echo:"hi""#).await;
    assert_eq!(next_text(&mut ws).await, r#"7:echo:"hi""#);
}

#[tokio::test]
async fn envelope_peer_receives_json() {
    let (addr, server) = boot_default().await;
    let mut ws = connect_raw(addr, false).await;
    let channel = server.channel().clone();
    wait_until(|| channel.connection_count() == 1).await;

    channel.send("news", json!({"a": 1})).await.unwrap();

    let envelope: Envelope = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(envelope.command, "news");
    assert_eq!(envelope.request_id, 0);
    assert_eq!(envelope.srv_request_id, 0);
    assert_eq!(envelope.data, json!({"a": 1}));
}

#[tokio::test]
async fn envelope_answer_carries_request_id() {
    let (addr, _server) = boot_default().await;
    let mut ws = connect_raw(addr, false).await;

    send_text(&mut ws, r#"12:echo:"hello""#).await;
    let value: Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(value["command"], "echo");
    assert_eq!(value["requestID"], 12);
    assert_eq!(value["srvRequestID"], 0);
    assert_eq!(value["data"], "hello");
}

#[tokio::test]
async fn topic_fanout_reaches_only_subscribers() {
    let (addr, server) = boot_default().await;
    let mut subscriber = connect_raw(addr, true).await;
    let mut bystander = connect_raw(addr, true).await;
    let channel = server.channel().clone();

    send_text(&mut subscriber, r#"0:subscribe:"news""#).await;
    wait_until(|| channel.subscribers("news").len() == 1).await;
    assert_eq!(channel.connection_count(), 2);

    channel.subscribers("news").send("news", "hello").await.unwrap();

    assert_eq!(next_text(&mut subscriber).await, r#"0:news:"hello""#);
    assert!(
        timeout(Duration::from_millis(200), bystander.next())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn broker_request_is_answered_by_peer() {
    let (addr, server) = boot_default().await;
    let mut ws = connect_raw(addr, true).await;
    let channel = server.channel().clone();
    wait_until(|| channel.connection_count() == 1).await;

    let id = channel.connections().ids()[0];
    let connection = channel.connection(id).unwrap();
    let pending = tokio::spawn(async move { connection.request("ping", ()).await });

    let frame = next_text(&mut ws).await;
    assert_eq!(frame, "-1:ping:null");
    send_text(&mut ws, r#"-1:ping:"pong""#).await;

    let answer = timeout(TIMEOUT, pending).await.unwrap().unwrap().unwrap();
    assert_eq!(&answer[..], br#""pong""#);
    assert_eq!(channel.pending_requests(), 0);
}

#[tokio::test]
async fn peer_disconnect_cleans_up_registries() {
    let (addr, server) = boot_default().await;
    let mut ws = connect_raw(addr, true).await;
    let channel = server.channel().clone();

    send_text(&mut ws, r#"0:subscribe:"news""#).await;
    wait_until(|| channel.topic_count() == 1).await;

    ws.close(None).await.unwrap();
    wait_until(|| channel.connection_count() == 0).await;
    assert_eq!(channel.topic_count(), 0);
    assert!(channel.subscribers("news").is_empty());
}

#[tokio::test]
async fn oversized_message_closes_connection() {
    let config = ServerConfig {
        channel: ChannelConfig {
            max_message_size: 64,
            ..ChannelConfig::default()
        },
        ..ServerConfig::default()
    };
    let (addr, server) = boot_server(ChannelServer::new(config)).await;
    let mut ws = connect_raw(addr, true).await;
    let channel = server.channel().clone();
    wait_until(|| channel.connection_count() == 1).await;

    let big = format!("0:echo:\"{}\"", "x".repeat(1024));
    let _ = ws.send(Message::text(big)).await;
    wait_until(|| channel.connection_count() == 0).await;
}

// ── Admission ──

#[tokio::test]
async fn origin_check_rejects_upgrade_with_403() {
    let policies = Policies::new().origin_check(|ctx: &dyn PeerContext| {
        ctx.header("origin").as_deref() == Some("https://app.example")
    });
    let config = ServerConfig::default();
    let channel = Channel::with_policies(config.channel.clone(), policies);
    let (addr, server) = boot_server(ChannelServer::with_channel(config, channel)).await;

    let request = ws_url(addr).into_client_request().unwrap();
    match connect_async(request).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 403);
        }
        Err(e) => panic!("expected 403, got {e}"),
        Ok(_) => panic!("upgrade should have been rejected"),
    }

    let mut request = ws_url(addr).into_client_request().unwrap();
    let _ = request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("https://app.example"));
    let (_ws, _) = connect_async(request).await.unwrap();
    let channel = server.channel().clone();
    wait_until(|| channel.connection_count() == 1).await;
}

#[tokio::test]
async fn middleware_values_group_connections_by_user() {
    let server = ChannelServer::new(ServerConfig::default());
    let channel = server.channel().clone();
    let app = server
        .router()
        .layer(Extension(ContextValues::new().with("UserID", "alice")));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _serve = tokio::spawn(async move { axum::serve(listener, app).await });

    let mut first = connect_raw(addr, true).await;
    let mut second = connect_raw(addr, true).await;
    let alice = UserId::from("alice");
    wait_until(|| channel.user(&alice).is_some_and(|u| u.len() == 2)).await;
    assert_eq!(channel.user_count(), 1);

    let user = channel.user(&alice).unwrap();
    user.send("notice", "hi").await.unwrap();
    assert_eq!(next_text(&mut first).await, r#"0:notice:"hi""#);
    assert_eq!(next_text(&mut second).await, r#"0:notice:"hi""#);

    first.close(None).await.unwrap();
    second.close(None).await.unwrap();
    wait_until(|| channel.user_count() == 0).await;
}

// ── Client ──

#[tokio::test]
async fn client_subscribes_and_receives_pushes() {
    let (addr, server) = boot_default().await;
    let channel = server.channel().clone();

    let client = Client::connect(ws_url(addr), ClientConfig::default());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.read("news", move |a: Adapter| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(a.string_data());
        }
    });
    client.subscribe("news").unwrap();
    assert!(client.wait_for_state(ClientState::Connected, TIMEOUT).await);
    wait_until(|| channel.subscribers("news").len() == 1).await;

    channel.subscribers("news").send("news", "hello").await.unwrap();
    let got = timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, "hello");

    let answer = client.request("echo", "ping").await.unwrap();
    assert_eq!(&answer[..], br#""ping""#);
    client.close();
}

#[tokio::test]
async fn client_replays_subscriptions_after_server_drop() {
    let (addr, server) = boot_default().await;
    let channel = server.channel().clone();

    let client = Client::connect(
        ws_url(addr),
        ClientConfig {
            reconnect_delay_ms: 50,
            ..ClientConfig::default()
        },
    );
    client.subscribe("a").unwrap();
    client.subscribe("b").unwrap();
    wait_until(|| channel.subscribers("a,b").len() == 1 && channel.topic_count() == 2).await;
    let first_id = channel.connections().ids()[0];

    channel.connection(first_id).unwrap().close().await;

    wait_until(|| {
        let ids = channel.subscribers("a").ids();
        ids.len() == 1 && ids[0] != first_id && channel.subscribers("b").len() == 1
    })
    .await;
    assert_eq!(client.state(), ClientState::Connected);
    client.close();
}

// ── HTTP routes ──

#[tokio::test]
async fn health_reports_live_counts() {
    let (addr, server) = boot_default().await;
    let mut ws = connect_raw(addr, true).await;
    send_text(&mut ws, r#"0:subscribe:"news""#).await;
    let channel = server.channel().clone();
    wait_until(|| channel.topic_count() == 1).await;

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
    assert_eq!(body["users"], 0);
    assert_eq!(body["topics"], 1);
}

#[tokio::test]
async fn shutdown_closes_open_sockets() {
    let (addr, server) = boot_default().await;
    let mut ws = connect_raw(addr, true).await;
    let channel = server.channel().clone();
    wait_until(|| channel.connection_count() == 1).await;

    server.shutdown();
    wait_until(|| channel.is_closed() && channel.connection_count() == 0).await;

    let ended = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}

//! `ChannelServer`: axum router around one [`Channel`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Extension, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tether_core::Channel;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::context::{ContextValues, HttpContext};
use crate::errors::Result;
use crate::health::{self, HealthResponse};
use crate::metrics::{self as server_metrics, UPGRADES_REJECTED_TOTAL};
use crate::transport::AxumTransport;

#[derive(Clone)]
struct AppState {
    channel: Channel,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

/// HTTP front end of a channel: the WebSocket route, `/health`, and
/// optionally `/metrics`.
pub struct ChannelServer {
    config: ServerConfig,
    channel: Channel,
    shutdown: CancellationToken,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl ChannelServer {
    /// Server with a fresh channel built from `config.channel`.
    pub fn new(config: ServerConfig) -> Self {
        let channel = Channel::new(config.channel.clone());
        Self::with_channel(config, channel)
    }

    /// Server fronting an existing channel (e.g. one built with custom
    /// policies and handlers).
    pub fn with_channel(config: ServerConfig, channel: Channel) -> Self {
        Self {
            config,
            channel,
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle` (when enabled in the config).
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        let state = AppState {
            channel: self.channel.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone().filter(|_| self.config.metrics),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route(&self.config.path, get(ws_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve in a background task. Returns the bound address and
    /// the task handle; the task ends after [`shutdown`](Self::shutdown),
    /// once the channel has closed every socket.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.clone();
        let channel = self.channel.clone();

        let handle = tokio::spawn(async move {
            let signal = {
                let channel = channel.clone();
                async move {
                    token.cancelled().await;
                    channel.close().await;
                }
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(signal)
                .await
            {
                error!(error = %e, "server error");
            }
            channel.close().await;
            info!("server stopped");
        });

        info!(%addr, path = %self.config.path, "tether server listening");
        Ok((addr, handle))
    }

    /// Stop accepting upgrades and close the channel. Returns without
    /// waiting; see [`stop`](Self::stop).
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Shut down, close every connection, then wait for the serving task
    /// up to the configured grace period. A task still running after that
    /// is aborted.
    pub async fn stop(&self, mut handle: JoinHandle<()>) {
        self.shutdown();
        self.channel.close().await;

        let grace = self.config.shutdown_timeout();
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "server task failed"),
            Err(_) => {
                warn!(
                    timeout_secs = grace.as_secs(),
                    connections = self.channel.connection_count(),
                    "server did not stop within the grace period, aborting"
                );
                handle.abort();
            }
        }
    }

    /// The channel.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, &state.channel))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => server_metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET {path}: admission check, then upgrade and hand the socket to the
/// channel.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    values: Option<Extension<ContextValues>>,
    State(state): State<AppState>,
) -> Response {
    let values = values.map(|Extension(v)| v).unwrap_or_default();
    let context = HttpContext::new(headers, values);
    if !state.channel.check_origin(&context) {
        metrics::counter!(UPGRADES_REJECTED_TOTAL).increment(1);
        warn!("websocket upgrade rejected by origin check");
        return StatusCode::FORBIDDEN.into_response();
    }

    let limit = state.channel.config().max_message_size;
    let ws = if limit > 0 { ws.max_message_size(limit) } else { ws };
    ws.on_upgrade(move |socket| async move {
        let transport = Arc::new(AxumTransport::new(socket));
        if let Err(e) = state.channel.serve(transport, Arc::new(context)).await {
            debug!(error = %e, "connection refused");
        }
    })
}

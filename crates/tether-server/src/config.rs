//! Server configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::ChannelConfig;

use crate::errors::Result;

/// Environment prefix for overrides, e.g. `TETHER_PORT=9000` or
/// `TETHER_CHANNEL__REQUEST_TIMEOUT_MS=500`.
pub const ENV_PREFIX: &str = "TETHER_";

/// Configuration for [`ChannelServer`](crate::server::ChannelServer).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Route of the WebSocket endpoint.
    pub path: String,
    /// Serve Prometheus text on `/metrics`.
    pub metrics: bool,
    /// Grace period for in-flight tasks on shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
    /// Broker settings.
    pub channel: ChannelConfig,
}

impl ServerConfig {
    /// Load defaults, then `path` if given, then `TETHER_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Ok(tether_core::config::load(path, ENV_PREFIX)?)
    }

    /// `host:port`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Shutdown grace period.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            path: "/ws".into(),
            metrics: true,
            shutdown_timeout_secs: 30,
            channel: ChannelConfig::default(),
        }
    }
}

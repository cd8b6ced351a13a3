//! Channel and client configuration.
//!
//! Loading flow (see [`load`]):
//! 1. Start with compiled defaults
//! 2. Merge the JSON file, if one is given and exists
//! 3. Merge `TETHER_`-prefixed environment variables (highest priority,
//!    `__` separates nested keys, e.g. `TETHER_CLIENT__QUEUE_CAPACITY`)

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Header a protocol-aware peer sets during the handshake.
pub const DEFAULT_PROTOCOL_HEADER: &str = "ws-client";
/// Context value holding the caller's identity.
pub const DEFAULT_USER_KEY: &str = "UserID";
/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Default inbound message size limit.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Broker-side settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Largest inbound message accepted, in bytes (`0` = unlimited).
    pub max_message_size: usize,
    /// Default timeout for [`Connection::request`](crate::connection::Connection::request).
    pub request_timeout_ms: u64,
    /// Handshake header marking a protocol-aware peer.
    pub protocol_header: String,
    /// Context value key holding the caller identity.
    pub user_key: String,
    /// Send binary instead of text messages by default.
    pub use_binary: bool,
}

impl ChannelConfig {
    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            protocol_header: DEFAULT_PROTOCOL_HEADER.into(),
            user_key: DEFAULT_USER_KEY.into(),
            use_binary: false,
        }
    }
}

/// Client-side settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default timeout for [`Client::request`](crate::client::Client::request).
    pub request_timeout_ms: u64,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay_ms: u64,
    /// WebSocket handshake timeout.
    pub handshake_timeout_ms: u64,
    /// Capacity of the outbound queue.
    pub queue_capacity: usize,
    /// Largest inbound message accepted, in bytes (`0` = unlimited).
    pub max_message_size: usize,
    /// Header announcing the compact protocol to the broker.
    pub protocol_header: String,
}

impl ClientConfig {
    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Reconnect backoff as a [`Duration`].
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            reconnect_delay_ms: 50,
            handshake_timeout_ms: 1_000,
            queue_capacity: 100_000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            protocol_header: DEFAULT_PROTOCOL_HEADER.into(),
        }
    }
}

/// Layered figment: defaults, then optional JSON file, then environment.
pub fn figment<T: Serialize + Default>(path: Option<&Path>, env_prefix: &str) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(T::default()));
    if let Some(path) = path {
        figment = figment.merge(Json::file(path));
    }
    figment.merge(Env::prefixed(env_prefix).split("__"))
}

/// Load a configuration type through [`figment`].
pub fn load<T>(path: Option<&Path>, env_prefix: &str) -> Result<T, figment::Error>
where
    T: Serialize + DeserializeOwned + Default,
{
    figment::<T>(path, env_prefix).extract()
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn channel_defaults() {
        let cfg = ChannelConfig::default();
        assert_eq!(cfg.request_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.protocol_header, "ws-client");
        assert_eq!(cfg.user_key, "UserID");
        assert_eq!(cfg.max_message_size, 16 * 1024 * 1024);
        assert!(!cfg.use_binary);
    }

    #[test]
    fn client_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.reconnect_delay(), Duration::from_millis(50));
        assert_eq!(cfg.handshake_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.queue_capacity, 100_000);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: ChannelConfig = serde_json::from_str(r#"{"request_timeout_ms": 500}"#).unwrap();
        assert_eq!(cfg.request_timeout_ms, 500);
        assert_eq!(cfg.protocol_header, "ws-client");
    }

    #[test]
    fn load_without_file_is_default() {
        Jail::expect_with(|_jail| {
            let cfg: ClientConfig = load(None, "TETHER_TEST_")?;
            assert_eq!(cfg, ClientConfig::default());
            Ok(())
        });
    }

    #[test]
    fn file_then_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file("tether.json", r#"{"request_timeout_ms": 1000, "use_binary": true}"#)?;
            jail.set_env("TETHER_TEST_REQUEST_TIMEOUT_MS", "2500");
            let cfg: ChannelConfig = load(Some(Path::new("tether.json")), "TETHER_TEST_")?;
            assert_eq!(cfg.request_timeout_ms, 2500);
            assert!(cfg.use_binary);
            assert_eq!(cfg.user_key, "UserID");
            Ok(())
        });
    }

    #[test]
    fn missing_file_is_ignored() {
        Jail::expect_with(|_jail| {
            let cfg: ChannelConfig = load(Some(Path::new("nope.json")), "TETHER_TEST_")?;
            assert_eq!(cfg, ChannelConfig::default());
            Ok(())
        });
    }
}

//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;
use tether_core::Channel;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server runs.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live connections.
    pub connections: usize,
    /// Users with at least one live connection.
    pub users: usize,
    /// Topics with at least one subscriber.
    pub topics: usize,
}

/// Build a health response from the channel's live counters.
pub fn health_check(start_time: Instant, channel: &Channel) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: channel.connection_count(),
        users: channel.user_count(),
        topics: channel.topic_count(),
    }
}

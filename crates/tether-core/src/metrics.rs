//! Metric names recorded through the `metrics` facade.
//!
//! Recording is a no-op until the host installs a recorder (the server crate
//! installs a Prometheus one).

/// Connections accepted (counter).
pub const CONNECTIONS_TOTAL: &str = "tether_connections_total";
/// Connections closed (counter).
pub const DISCONNECTIONS_TOTAL: &str = "tether_disconnections_total";
/// Live connections (gauge).
pub const CONNECTIONS_ACTIVE: &str = "tether_connections_active";
/// Inbound frames read by channel read loops (counter).
pub const FRAMES_RECEIVED_TOTAL: &str = "tether_frames_received_total";
/// Inbound frames that failed to decode (counter).
pub const MALFORMED_FRAMES_TOTAL: &str = "tether_malformed_frames_total";
/// Failed targets of multi-target sends (counter).
pub const BROADCAST_FAILURES_TOTAL: &str = "tether_broadcast_failures_total";
/// Requests that timed out (counter, labels: origin).
pub const REQUEST_TIMEOUTS_TOTAL: &str = "tether_request_timeouts_total";
/// Client dial attempts (counter, labels: status).
pub const CLIENT_DIALS_TOTAL: &str = "tether_client_dials_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_prefixed_snake_case() {
        let names = [
            CONNECTIONS_TOTAL,
            DISCONNECTIONS_TOTAL,
            CONNECTIONS_ACTIVE,
            FRAMES_RECEIVED_TOTAL,
            MALFORMED_FRAMES_TOTAL,
            BROADCAST_FAILURES_TOTAL,
            REQUEST_TIMEOUTS_TOTAL,
            CLIENT_DIALS_TOTAL,
        ];
        for name in names {
            assert!(name.starts_with("tether_"), "{name}");
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}

//! Prometheus recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

use crate::errors::{Result, ServerError};

/// Upgrade requests refused by the origin check (counter).
pub const UPGRADES_REJECTED_TOTAL: &str = "tether_upgrades_rejected_total";

/// Install the global Prometheus recorder. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Metrics(e.to_string()))?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Prometheus text format from `handle`.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_recorder_renders_recorded_counters() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(tether_core::metrics::CONNECTIONS_TOTAL).increment(2);
        });
        let text = render(&handle);
        assert!(text.contains("tether_connections_total 2"), "{text}");
    }
}

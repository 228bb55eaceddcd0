//! Prometheus exposition.
//!
//! The cache crates emit through the `metrics` facade; this module installs
//! the recorder and renders `/metrics`.

use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

use canvas_cache::{CacheSnapshot, Tier};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const MONITOR_HIT_RATE: &str = "authz_monitor_hit_rate";
    pub const MONITOR_P95_SECONDS: &str = "authz_monitor_p95_seconds";
}

/// Install the Prometheus recorder. Returns `false` if already installed or
/// another recorder owns the facade.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics renders from the handle.
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format, `None` before
/// [`init_metrics`].
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Publish snapshot-derived gauges just before a scrape.
pub fn publish_snapshot(snapshot: &CacheSnapshot) {
    gauge!(names::MONITOR_HIT_RATE).set(snapshot.monitor.overall_hit_rate);
    gauge!(names::MONITOR_P95_SECONDS).set(snapshot.monitor.p95_ms / 1000.0);
    canvas_cache::metrics::set_cache_entries(Tier::Local.as_str(), snapshot.local.size);
}

//! Metric names and helpers for the cache tiers.
//!
//! Everything goes through the `metrics` facade; the binary decides which
//! recorder (if any) is installed.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "authz_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "authz_cache_misses_total";
    pub const CACHE_ERRORS_TOTAL: &str = "authz_cache_errors_total";
    pub const CACHE_SKIPPED_TOTAL: &str = "authz_cache_skipped_total";
    pub const CACHE_ENTRIES: &str = "authz_cache_entries";
    pub const CACHE_EVICTIONS_TOTAL: &str = "authz_cache_evictions_total";
    pub const CACHE_INVALIDATIONS_TOTAL: &str = "authz_cache_invalidations_total";

    pub const LATENCY_SECONDS: &str = "authz_latency_seconds";

    pub const BREAKER_STATE: &str = "authz_breaker_state";
    pub const BREAKER_TRIPS_TOTAL: &str = "authz_breaker_trips_total";

    pub const MONITOR_DROPPED_SAMPLES_TOTAL: &str = "authz_monitor_dropped_samples_total";
    pub const MONITOR_ALERT_STATE: &str = "authz_monitor_alert_state";
}

// =============================================================================
// Tier outcomes
// =============================================================================

pub fn record_outcome(operation: &'static str, tier: &'static str, outcome: &'static str) {
    let name = match outcome {
        "hit" => names::CACHE_HITS_TOTAL,
        "miss" => names::CACHE_MISSES_TOTAL,
        "error" => names::CACHE_ERRORS_TOTAL,
        "skipped" => names::CACHE_SKIPPED_TOTAL,
        _ => return,
    };
    counter!(name, "operation" => operation, "tier" => tier).increment(1);
}

pub fn record_latency(operation: &'static str, tier: &'static str, latency: Duration) {
    histogram!(names::LATENCY_SECONDS, "operation" => operation, "tier" => tier)
        .record(latency.as_secs_f64());
}

pub fn set_cache_entries(tier: &'static str, count: usize) {
    gauge!(names::CACHE_ENTRIES, "tier" => tier).set(count as f64);
}

pub fn record_evictions(count: u64) {
    counter!(names::CACHE_EVICTIONS_TOTAL).increment(count);
}

pub fn record_invalidation(scope: &'static str, removed: usize) {
    counter!(names::CACHE_INVALIDATIONS_TOTAL, "scope" => scope).increment(removed as u64);
}

// =============================================================================
// Circuit breaker
// =============================================================================

/// 0 = closed, 1 = open, 2 = half-open.
pub fn set_breaker_state(tier: &str, state: u8) {
    gauge!(names::BREAKER_STATE, "tier" => tier.to_string()).set(f64::from(state));
}

pub fn record_breaker_trip(tier: &str) {
    counter!(names::BREAKER_TRIPS_TOTAL, "tier" => tier.to_string()).increment(1);
}

// =============================================================================
// Monitor
// =============================================================================

pub fn record_dropped_sample() {
    counter!(names::MONITOR_DROPPED_SAMPLES_TOTAL).increment(1);
}

/// 0 = healthy, 1 = degraded.
pub fn set_alert_state(degraded: bool) {
    gauge!(names::MONITOR_ALERT_STATE).set(if degraded { 1.0 } else { 0.0 });
}

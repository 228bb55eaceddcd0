//! Performance monitor.
//!
//! Collects per-operation latency and tier outcomes, keeps aggregate
//! statistics, and raises alerts when the hit rate or p95 latency degrade.
//!
//! `record` never blocks and never fails: counters are atomics, latency
//! samples go into a ring buffer behind `try_lock`, and a contended sample
//! is dropped and counted.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::metrics;
use crate::tier::Tier;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Windowed cache hit rate below this is degraded.
    #[serde(default = "default_hit_rate_floor")]
    pub alert_hit_rate_floor: f64,

    /// p95 authorize latency above this is degraded.
    #[serde(default = "default_p95_ceiling_ms")]
    pub alert_latency_p95_ceiling_ms: f64,

    /// Evaluate alerts every N records.
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval: u64,

    /// Minimum window size before any alert is raised.
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,

    /// Hit-rate drop between consecutive windows that is reported as a trend.
    #[serde(default = "default_trend_drop_threshold")]
    pub trend_drop_threshold: f64,

    /// Latency samples kept for percentiles.
    #[serde(default = "default_sample_capacity")]
    pub sample_capacity: usize,
}

fn default_hit_rate_floor() -> f64 {
    0.8
}

fn default_p95_ceiling_ms() -> f64 {
    10.0
}

fn default_evaluation_interval() -> u64 {
    1000
}

fn default_min_samples() -> u64 {
    100
}

fn default_trend_drop_threshold() -> f64 {
    0.2
}

fn default_sample_capacity() -> usize {
    4096
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            alert_hit_rate_floor: default_hit_rate_floor(),
            alert_latency_p95_ceiling_ms: default_p95_ceiling_ms(),
            evaluation_interval: default_evaluation_interval(),
            min_samples: default_min_samples(),
            trend_drop_threshold: default_trend_drop_threshold(),
            sample_capacity: default_sample_capacity(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.alert_hit_rate_floor) {
            return Err("alert_hit_rate_floor must be within 0.0..=1.0".into());
        }
        if self.alert_latency_p95_ceiling_ms <= 0.0 {
            return Err("alert_latency_p95_ceiling_ms must be positive".into());
        }
        if self.evaluation_interval == 0 {
            return Err("evaluation_interval must be greater than 0".into());
        }
        if !(0.0..=1.0).contains(&self.trend_drop_threshold) {
            return Err("trend_drop_threshold must be within 0.0..=1.0".into());
        }
        if self.sample_capacity == 0 {
            return Err("sample_capacity must be greater than 0".into());
        }
        Ok(())
    }
}

// =============================================================================
// Labels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// One full manager lookup.
    CacheGet,
    /// One tier probe inside a lookup.
    CacheProbe,
    CacheSet,
    CacheInvalidate,
    Authorize,
    /// Rule evaluation against the resource store.
    Evaluate,
    ViewRefresh,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheGet => "cache_get",
            Self::CacheProbe => "cache_probe",
            Self::CacheSet => "cache_set",
            Self::CacheInvalidate => "cache_invalidate",
            Self::Authorize => "authorize",
            Self::Evaluate => "evaluate",
            Self::ViewRefresh => "view_refresh",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierLabel {
    Local,
    Distributed,
    Materialized,
    Store,
    None,
}

impl TierLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Distributed => "distributed",
            Self::Materialized => "materialized",
            Self::Store => "store",
            Self::None => "none",
        }
    }

    fn tier(&self) -> Option<Tier> {
        match self {
            Self::Local => Some(Tier::Local),
            Self::Distributed => Some(Tier::Distributed),
            Self::Materialized => Some(Tier::Materialized),
            Self::Store | Self::None => None,
        }
    }
}

impl From<Tier> for TierLabel {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Local => Self::Local,
            Tier::Distributed => Self::Distributed,
            Tier::Materialized => Self::Materialized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Hit,
    Miss,
    Ok,
    Error,
    Skipped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

// =============================================================================
// Alerts
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    #[default]
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertReason {
    HitRateBelowFloor { hit_rate: f64, floor: f64 },
    LatencyAboveCeiling { p95_ms: f64, ceiling_ms: f64 },
    HitRateTrend { previous: f64, current: f64 },
}

impl fmt::Display for AlertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HitRateBelowFloor { hit_rate, floor } => {
                write!(f, "hit rate {hit_rate:.3} below floor {floor:.3}")
            }
            Self::LatencyAboveCeiling { p95_ms, ceiling_ms } => {
                write!(f, "p95 {p95_ms:.2}ms above ceiling {ceiling_ms:.2}ms")
            }
            Self::HitRateTrend { previous, current } => {
                write!(f, "hit rate fell from {previous:.3} to {current:.3}")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub state: AlertState,
    pub reasons: Vec<AlertReason>,
    #[serde(with = "time::serde::rfc3339")]
    pub raised_at: OffsetDateTime,
}

/// Callback invoked on every Healthy/Degraded transition and on trends.
pub type AlertSink = Arc<dyn Fn(&Alert) + Send + Sync>;

// =============================================================================
// Snapshot
// =============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub skipped: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub hit_rate_by_tier: BTreeMap<&'static str, TierStats>,
    pub overall_hit_rate: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub latency_by_operation: BTreeMap<&'static str, LatencySummary>,
    pub total_records: u64,
    pub dropped_samples: u64,
    pub alert_state: AlertState,
    pub alert_reasons: Vec<AlertReason>,
    pub recommendations: Vec<String>,
}

// =============================================================================
// Monitor
// =============================================================================

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    skipped: AtomicU64,
}

impl TierCounters {
    fn bump(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Hit => &self.hits,
            Outcome::Miss => &self.misses,
            Outcome::Error => &self.errors,
            Outcome::Skipped => &self.skipped,
            Outcome::Ok => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> TierStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        TierStats {
            hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            hit_rate: ratio(hits, hits + misses),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    operation: Operation,
    latency_ms: f64,
}

#[derive(Debug)]
struct SampleRing {
    samples: Vec<Sample>,
    next: usize,
    capacity: usize,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            next: 0,
            capacity,
        }
    }

    fn push(&mut self, sample: Sample) {
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    fn latencies(&self, operation: Operation) -> Vec<f64> {
        self.samples
            .iter()
            .filter(|s| s.operation == operation)
            .map(|s| s.latency_ms)
            .collect()
    }
}

#[derive(Debug, Default)]
struct AlertTracker {
    state: AlertState,
    reasons: Vec<AlertReason>,
    previous_window_hit_rate: Option<f64>,
}

pub struct PerformanceMonitor {
    config: MonitorConfig,
    local: TierCounters,
    distributed: TierCounters,
    materialized: TierCounters,
    /// Whole-lookup outcomes, for the overall hit rate.
    lookups: TierCounters,
    window_hits: AtomicU64,
    window_misses: AtomicU64,
    records: AtomicU64,
    dropped: AtomicU64,
    samples: Mutex<SampleRing>,
    alerts: Mutex<AlertTracker>,
    sink: Mutex<Option<AlertSink>>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let capacity = config.sample_capacity.max(1);
        Self {
            config,
            local: TierCounters::default(),
            distributed: TierCounters::default(),
            materialized: TierCounters::default(),
            lookups: TierCounters::default(),
            window_hits: AtomicU64::new(0),
            window_misses: AtomicU64::new(0),
            records: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            samples: Mutex::new(SampleRing::new(capacity)),
            alerts: Mutex::new(AlertTracker::default()),
            sink: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn set_alert_sink(&self, sink: AlertSink) {
        *self.sink.lock() = Some(sink);
    }

    pub fn alert_state(&self) -> AlertState {
        self.alerts.lock().state
    }

    pub fn record(&self, operation: Operation, tier: TierLabel, outcome: Outcome, latency: Duration) {
        metrics::record_outcome(operation.as_str(), tier.as_str(), outcome.as_str());
        metrics::record_latency(operation.as_str(), tier.as_str(), latency);

        match operation {
            Operation::CacheProbe => {
                if let Some(counters) = tier.tier().map(|t| self.tier_counters(t)) {
                    counters.bump(outcome);
                }
            }
            Operation::CacheGet => {
                self.lookups.bump(outcome);
                match outcome {
                    Outcome::Hit => self.window_hits.fetch_add(1, Ordering::Relaxed),
                    Outcome::Miss => self.window_misses.fetch_add(1, Ordering::Relaxed),
                    _ => 0,
                };
            }
            _ => {}
        }

        let sample = Sample {
            operation,
            latency_ms: latency.as_nanos() as f64 / 1_000_000.0,
        };
        match self.samples.try_lock() {
            Some(mut ring) => ring.push(sample),
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_dropped_sample();
            }
        }

        let n = self.records.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.config.evaluation_interval == 0 {
            self.evaluate(false);
        }
    }

    fn tier_counters(&self, tier: Tier) -> &TierCounters {
        match tier {
            Tier::Local => &self.local,
            Tier::Distributed => &self.distributed,
            Tier::Materialized => &self.materialized,
        }
    }

    /// Headline percentiles: the authorize path, or cache lookups when no
    /// authorize samples exist. `None` while a recorder holds the samples.
    fn headline_latency(&self) -> Option<LatencySummary> {
        let ring = self.samples.try_lock()?;
        let mut latencies = ring.latencies(Operation::Authorize);
        if latencies.is_empty() {
            latencies = ring.latencies(Operation::CacheGet);
        }
        drop(ring);
        Some(summarize_latencies(&mut latencies))
    }

    /// Compare the current window against the thresholds and fire the sink
    /// on transitions. `force` evaluates even a window below `min_samples`
    /// for latency, never for hit rate.
    fn evaluate(&self, force: bool) {
        let Some(mut tracker) = self.alerts.try_lock() else {
            return;
        };

        let hits = self.window_hits.load(Ordering::Relaxed);
        let misses = self.window_misses.load(Ordering::Relaxed);
        let window = hits + misses;

        let mut reasons = Vec::new();
        let mut trend = None;

        if window >= self.config.min_samples {
            self.window_hits.fetch_sub(hits, Ordering::Relaxed);
            self.window_misses.fetch_sub(misses, Ordering::Relaxed);

            let hit_rate = ratio(hits, window);
            if hit_rate < self.config.alert_hit_rate_floor {
                reasons.push(AlertReason::HitRateBelowFloor {
                    hit_rate,
                    floor: self.config.alert_hit_rate_floor,
                });
            }
            if let Some(previous) = tracker.previous_window_hit_rate {
                if previous - hit_rate > self.config.trend_drop_threshold {
                    trend = Some(AlertReason::HitRateTrend {
                        previous,
                        current: hit_rate,
                    });
                }
            }
            tracker.previous_window_hit_rate = Some(hit_rate);
        } else if !force {
            return;
        } else {
            // Too few lookups to judge the hit rate; keep the previous verdict on it.
            reasons.extend(
                tracker
                    .reasons
                    .iter()
                    .filter(|r| matches!(r, AlertReason::HitRateBelowFloor { .. }))
                    .cloned(),
            );
        }

        match self.headline_latency() {
            Some(latency) => {
                if latency.count as u64 >= self.config.min_samples
                    && latency.p95_ms > self.config.alert_latency_p95_ceiling_ms
                {
                    reasons.push(AlertReason::LatencyAboveCeiling {
                        p95_ms: latency.p95_ms,
                        ceiling_ms: self.config.alert_latency_p95_ceiling_ms,
                    });
                }
            }
            // Samples busy; keep the previous verdict on latency.
            None => reasons.extend(
                tracker
                    .reasons
                    .iter()
                    .filter(|r| matches!(r, AlertReason::LatencyAboveCeiling { .. }))
                    .cloned(),
            ),
        }

        let state = if reasons.is_empty() {
            AlertState::Healthy
        } else {
            AlertState::Degraded
        };
        let transitioned = state != tracker.state;
        tracker.state = state;
        tracker.reasons = reasons.clone();
        drop(tracker);

        metrics::set_alert_state(state == AlertState::Degraded);

        if transitioned {
            match state {
                AlertState::Degraded => {
                    let summary: Vec<String> = reasons.iter().map(ToString::to_string).collect();
                    tracing::warn!(reasons = ?summary, "authorization cache degraded");
                }
                AlertState::Healthy => tracing::info!("authorization cache recovered"),
            }
            self.fire(Alert {
                state,
                reasons,
                raised_at: OffsetDateTime::now_utc(),
            });
        }

        if let Some(trend) = trend {
            tracing::warn!(trend = %trend, "cache hit rate trending down");
            self.fire(Alert {
                state,
                reasons: vec![trend],
                raised_at: OffsetDateTime::now_utc(),
            });
        }
    }

    fn fire(&self, alert: Alert) {
        let Some(sink) = self.sink.lock().clone() else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| sink(&alert))).is_err() {
            tracing::error!(state = ?alert.state, "alert sink panicked");
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.evaluate(true);

        let mut hit_rate_by_tier = BTreeMap::new();
        for tier in Tier::ALL {
            hit_rate_by_tier.insert(tier.as_str(), self.tier_counters(tier).stats());
        }

        let mut latency_by_operation = BTreeMap::new();
        let all_samples = self
            .samples
            .try_lock()
            .map(|ring| ring.samples.clone())
            .unwrap_or_default();
        let mut grouped: BTreeMap<&'static str, Vec<f64>> = BTreeMap::new();
        for sample in &all_samples {
            grouped
                .entry(sample.operation.as_str())
                .or_default()
                .push(sample.latency_ms);
        }
        for (operation, mut latencies) in grouped {
            latency_by_operation.insert(operation, summarize_latencies(&mut latencies));
        }

        let headline = self.headline_latency().unwrap_or_default();
        let (alert_state, alert_reasons) = {
            let tracker = self.alerts.lock();
            (tracker.state, tracker.reasons.clone())
        };

        let mut snapshot = MonitorSnapshot {
            hit_rate_by_tier,
            overall_hit_rate: self.lookups.stats().hit_rate,
            p50_ms: headline.p50_ms,
            p95_ms: headline.p95_ms,
            p99_ms: headline.p99_ms,
            latency_by_operation,
            total_records: self.records.load(Ordering::Relaxed),
            dropped_samples: self.dropped.load(Ordering::Relaxed),
            alert_state,
            alert_reasons,
            recommendations: Vec::new(),
        };
        snapshot.recommendations = self.recommendations(&snapshot);
        snapshot
    }

    fn recommendations(&self, snapshot: &MonitorSnapshot) -> Vec<String> {
        let mut out = Vec::new();
        let floor = self.config.alert_hit_rate_floor;

        if let Some(local) = snapshot.hit_rate_by_tier.get(Tier::Local.as_str()) {
            if local.hits + local.misses >= self.config.min_samples && local.hit_rate < floor {
                out.push(format!(
                    "in-process hit rate {:.2} is below {floor:.2}; consider raising l1_max_entries or l1_default_ttl_seconds",
                    local.hit_rate
                ));
            }
        }

        if let Some(distributed) = snapshot.hit_rate_by_tier.get(Tier::Distributed.as_str()) {
            let attempts = distributed.hits + distributed.misses + distributed.errors;
            if attempts > 0 && ratio(distributed.errors, attempts) > 0.1 {
                out.push(format!(
                    "distributed tier failed {} of {attempts} probes; check l2_endpoint health",
                    distributed.errors
                ));
            }
        }

        if let Some(materialized) = snapshot.hit_rate_by_tier.get(Tier::Materialized.as_str()) {
            if materialized.hits + materialized.misses >= self.config.min_samples
                && materialized.hit_rate < 0.5
            {
                out.push(
                    "materialized view rarely answers; consider a shorter l3_refresh_interval_seconds"
                        .to_string(),
                );
            }
        }

        if snapshot.p95_ms > self.config.alert_latency_p95_ceiling_ms {
            out.push(format!(
                "p95 latency {:.2}ms exceeds {:.2}ms",
                snapshot.p95_ms, self.config.alert_latency_p95_ceiling_ms
            ));
        }

        if snapshot.dropped_samples > 0 {
            out.push(format!(
                "{} latency samples dropped under contention; percentiles are approximate",
                snapshot.dropped_samples
            ));
        }
        out
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("records", &self.records.load(Ordering::Relaxed))
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .field("alert_state", &self.alert_state())
            .finish()
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Nearest-rank percentiles.
fn summarize_latencies(latencies: &mut [f64]) -> LatencySummary {
    if latencies.is_empty() {
        return LatencySummary::default();
    }
    latencies.sort_by(f64::total_cmp);
    let pick = |p: f64| {
        let rank = ((p * latencies.len() as f64).ceil() as usize).clamp(1, latencies.len());
        latencies[rank - 1]
    };
    LatencySummary {
        count: latencies.len(),
        p50_ms: pick(0.50),
        p95_ms: pick(0.95),
        p99_ms: pick(0.99),
    }
}

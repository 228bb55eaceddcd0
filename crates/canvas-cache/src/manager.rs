//! Tiered cache manager.
//!
//! ```text
//! get:  local ──miss──▶ distributed (breaker + timeout) ──miss──▶ view (timeout)
//!         ▲                   │ hit                                 │ hit
//!         └──── promote ──────┘◀──────────── promote ───────────────┘
//! ```
//!
//! Invalidation removes matching keys from the local tier synchronously and
//! from the distributed and view tiers in background tasks. Until those
//! deletes are confirmed, a fence makes any matching slower-tier hit count as
//! a miss, so a process never reads back a value it has already invalidated.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use canvas_core::{CacheKey, ResourceRef, pattern_matches, subject_pattern};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::breaker::{
    BreakerError, BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState,
};
use crate::config::CacheConfig;
use crate::distributed::redis::create_pool;
use crate::distributed::{
    DistributedTier, InMemoryDistributedTier, InvalidationListener, RedisDistributedTier,
};
use crate::error::{TierError, TierResult, with_timeout};
use crate::eviction::EvictionPolicy;
use crate::local::{InsertOptions, LocalTier, LocalTierStats};
use crate::metrics;
use crate::monitor::{MonitorSnapshot, Operation, Outcome, PerformanceMonitor, TierLabel};
use crate::tier::Tier;
use crate::view::{InMemoryView, MaterializedView, RedisView, ViewRow};

/// Smallest pool timeout used when connecting; per-call timeouts still apply.
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// A value found in one of the tiers.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub value: Arc<Vec<u8>>,
    pub tier: Tier,
    /// Lifetime left in the tier that answered.
    pub remaining: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub local: LocalTierStats,
    pub distributed_backend: &'static str,
    pub view_backend: &'static str,
    pub breakers: Vec<CircuitBreakerState>,
    pub pending_fences: usize,
    pub closed: bool,
    pub monitor: MonitorSnapshot,
    #[serde(with = "time::serde::rfc3339")]
    pub taken_at: OffsetDateTime,
}

// =============================================================================
// Invalidation fences
// =============================================================================

#[derive(Debug, Clone)]
enum Selector {
    Pattern(String),
    Tag(String),
}

impl Selector {
    fn matches(&self, key: &str, tag: &str, related_tags: &[String]) -> bool {
        match self {
            Self::Pattern(pattern) => pattern_matches(pattern, key),
            Self::Tag(t) => t == tag || related_tags.contains(t),
        }
    }
}

#[derive(Debug)]
struct Fence {
    id: u64,
    selector: Selector,
    until: Instant,
}

#[derive(Debug, Default)]
struct Fences {
    next_id: AtomicU64,
    active: RwLock<Vec<Fence>>,
}

impl Fences {
    fn raise(&self, selector: Selector, lifetime: Duration) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut active = self.active.write();
        active.retain(|f| f.until > now);
        active.push(Fence {
            id,
            selector,
            until: now + lifetime,
        });
        id
    }

    fn lower(&self, id: u64) {
        self.active.write().retain(|f| f.id != id);
    }

    fn blocks(&self, key: &str, tag: &str, related_tags: &[String]) -> bool {
        let now = Instant::now();
        self.active
            .read()
            .iter()
            .any(|f| f.until > now && f.selector.matches(key, tag, related_tags))
    }

    fn len(&self) -> usize {
        let now = Instant::now();
        self.active.read().iter().filter(|f| f.until > now).count()
    }
}

// =============================================================================
// Background tasks
// =============================================================================

#[derive(Debug, Default)]
struct InFlightIds {
    next: u64,
    running: BTreeSet<u64>,
}

/// Slow-tier promotions and invalidation deletes.
///
/// Every task gets a sequence number, so a waiter can wait for exactly the
/// tasks started before it without closing the tracker.
#[derive(Debug, Default)]
struct Background {
    tracker: TaskTracker,
    ids: Mutex<InFlightIds>,
    finished: Notify,
}

/// Marks a task finished when dropped, including on cancellation.
struct InFlight {
    background: Arc<Background>,
    id: u64,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.background.ids.lock().running.remove(&self.id);
        self.background.finished.notify_waiters();
    }
}

impl Background {
    fn spawn<F>(self: &Arc<Self>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = {
            let mut ids = self.ids.lock();
            let id = ids.next;
            ids.next += 1;
            ids.running.insert(id);
            id
        };
        let in_flight = InFlight {
            background: Arc::clone(self),
            id,
        };
        self.tracker.spawn(async move {
            let _in_flight = in_flight;
            task.await;
        });
    }

    /// Resolves once every task spawned before this call has finished.
    fn settle(&self) -> impl Future<Output = ()> + '_ {
        let horizon = self.ids.lock().next;
        async move {
            loop {
                // Registered before the check so a completion in between is not missed.
                let finished = self.finished.notified();
                if self.ids.lock().running.range(..horizon).next().is_none() {
                    return;
                }
                finished.await;
            }
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

pub struct TieredCacheManager {
    config: CacheConfig,
    local: Arc<LocalTier>,
    distributed: Arc<dyn DistributedTier>,
    breaker: Arc<CircuitBreaker>,
    view: Arc<dyn MaterializedView>,
    monitor: Arc<PerformanceMonitor>,
    fences: Arc<Fences>,
    background: Arc<Background>,
    closed: AtomicBool,
    /// Set when the distributed tier is Redis; other instances' deletes
    /// arrive on its invalidation channel.
    listener_url: Option<String>,
}

pub struct TieredCacheManagerBuilder {
    config: CacheConfig,
    distributed: Option<Arc<dyn DistributedTier>>,
    view: Option<Arc<dyn MaterializedView>>,
    monitor: Option<Arc<PerformanceMonitor>>,
    listener_url: Option<String>,
}

impl TieredCacheManagerBuilder {
    pub fn distributed(mut self, tier: Arc<dyn DistributedTier>) -> Self {
        self.distributed = Some(tier);
        self
    }

    pub fn view(mut self, view: Arc<dyn MaterializedView>) -> Self {
        self.view = Some(view);
        self
    }

    pub fn monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn build(self) -> TieredCacheManager {
        let config = self.config;
        let policy = EvictionPolicy::from_config(config.l1_eviction_policy, config.l1_hybrid_weights);
        let breaker = CircuitBreaker::new(
            Tier::Distributed.as_str(),
            CircuitBreakerConfig {
                failure_threshold: config.l2_failure_threshold,
                open_duration: config.l2_open_duration(),
            },
        );
        TieredCacheManager {
            local: Arc::new(LocalTier::new(config.l1_max_entries, policy)),
            distributed: self
                .distributed
                .unwrap_or_else(|| Arc::new(InMemoryDistributedTier::new())),
            breaker: Arc::new(breaker),
            view: self.view.unwrap_or_else(|| Arc::new(InMemoryView::new())),
            monitor: self.monitor.unwrap_or_default(),
            fences: Arc::new(Fences::default()),
            background: Arc::new(Background::default()),
            closed: AtomicBool::new(false),
            listener_url: self.listener_url,
            config,
        }
    }
}

impl TieredCacheManager {
    pub fn builder(config: CacheConfig) -> TieredCacheManagerBuilder {
        TieredCacheManagerBuilder {
            config,
            distributed: None,
            view: None,
            monitor: None,
            listener_url: None,
        }
    }

    /// Build a manager from configuration, connecting to Redis for the tiers
    /// that have an endpoint. A tier that cannot connect falls back to its
    /// in-process stand-in.
    pub async fn connect(config: CacheConfig, monitor: Arc<PerformanceMonitor>) -> Self {
        let mut builder = Self::builder(config.clone()).monitor(monitor);

        if let Some(url) = &config.l2_endpoint {
            tracing::info!(url = %url, "Connecting distributed tier to Redis");
            let timeout = config.l2_timeout().max(MIN_CONNECT_TIMEOUT);
            match create_pool(Tier::Distributed, url, config.l2_pool_size, timeout).await {
                Ok(pool) => {
                    tracing::info!("Distributed tier connected");
                    builder = builder.distributed(Arc::new(RedisDistributedTier::new(
                        pool,
                        config.slow_tier_max_ttl(),
                    )));
                    builder.listener_url = Some(url.clone());
                }
                Err(e) => tracing::warn!(
                    error = %e,
                    "Failed to connect distributed tier. Falling back to in-process stand-in."
                ),
            }
        } else {
            tracing::info!("No l2_endpoint configured, distributed tier is in-process");
        }

        if let Some(url) = &config.l3_endpoint {
            tracing::info!(url = %url, "Connecting materialized view to Redis");
            let timeout = config.l3_timeout().max(MIN_CONNECT_TIMEOUT);
            match create_pool(Tier::Materialized, url, config.l2_pool_size, timeout).await {
                Ok(pool) => {
                    tracing::info!("Materialized view connected");
                    builder = builder.view(Arc::new(RedisView::new(
                        pool,
                        config.l3_default_ttl().max(config.l3_staleness_bound()),
                    )));
                }
                Err(e) => tracing::warn!(
                    error = %e,
                    "Failed to connect materialized view. Falling back to in-process view."
                ),
            }
        }

        builder.build()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn local(&self) -> &Arc<LocalTier> {
        &self.local
    }

    pub fn distributed(&self) -> &Arc<dyn DistributedTier> {
        &self.distributed
    }

    pub fn view(&self) -> &Arc<dyn MaterializedView> {
        &self.view
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Listener that applies other instances' invalidations to this
    /// instance's local tier. `None` unless the distributed tier is Redis.
    pub fn invalidation_listener(&self) -> Option<InvalidationListener> {
        self.listener_url
            .as_ref()
            .map(|url| InvalidationListener::new(url.clone(), Arc::clone(&self.local)))
    }

    fn record(&self, operation: Operation, tier: impl Into<TierLabel>, outcome: Outcome, since: Instant) {
        self.monitor
            .record(operation, tier.into(), outcome, since.elapsed());
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub async fn get(&self, key: &CacheKey) -> Option<CacheHit> {
        let started = Instant::now();
        if self.is_closed() {
            return None;
        }

        let hit = self.lookup(key).await;
        match &hit {
            Some(hit) => self.record(Operation::CacheGet, hit.tier, Outcome::Hit, started),
            None => self.record(Operation::CacheGet, TierLabel::None, Outcome::Miss, started),
        }
        hit
    }

    async fn lookup(&self, key: &CacheKey) -> Option<CacheHit> {
        let tag = key.tag();

        // Tier 1
        let probe = Instant::now();
        if let Some(hit) = self.local.get(key.as_str()) {
            self.record(Operation::CacheProbe, Tier::Local, Outcome::Hit, probe);
            tracing::debug!(key = %key, origin = %hit.origin, "cache hit (L1)");
            return Some(CacheHit {
                value: hit.value,
                tier: Tier::Local,
                remaining: hit.remaining,
            });
        }
        self.record(Operation::CacheProbe, Tier::Local, Outcome::Miss, probe);

        // Tier 2
        let probe = Instant::now();
        let result = guarded(
            &self.breaker,
            self.config.l2_timeout(),
            self.distributed.get(key.as_str()),
        )
        .await;
        match result {
            Ok(Some(found)) if !self.fences.blocks(key.as_str(), &tag, &found.related_tags) => {
                self.record(Operation::CacheProbe, Tier::Distributed, Outcome::Hit, probe);
                tracing::debug!(key = %key, "cache hit (L2)");
                if self.config.promotion_enabled {
                    let ttl = found.remaining.min(self.config.l1_default_ttl());
                    self.local.insert(
                        key.as_str(),
                        Arc::clone(&found.value),
                        ttl,
                        InsertOptions::new(tag.clone())
                            .related(&found.related_tags)
                            .origin(Tier::Distributed),
                    );
                }
                return Some(CacheHit {
                    value: found.value,
                    tier: Tier::Distributed,
                    remaining: found.remaining,
                });
            }
            Ok(Some(_)) => {
                tracing::debug!(key = %key, "L2 value fenced by pending invalidation");
                self.record(Operation::CacheProbe, Tier::Distributed, Outcome::Miss, probe);
            }
            Ok(None) => {
                self.record(Operation::CacheProbe, Tier::Distributed, Outcome::Miss, probe);
            }
            Err(BreakerError::Open) => {
                self.record(Operation::CacheProbe, Tier::Distributed, Outcome::Skipped, probe);
            }
            Err(BreakerError::Inner(e)) => {
                tracing::warn!(key = %key, error = %e, "L2 read failed");
                self.record(Operation::CacheProbe, Tier::Distributed, Outcome::Error, probe);
            }
        }

        // Tier 3
        let probe = Instant::now();
        let result = with_timeout(
            Tier::Materialized,
            self.config.l3_timeout(),
            self.view.get(key.subject_id(), key.as_str()),
        )
        .await;
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "L3 read failed");
                self.record(Operation::CacheProbe, Tier::Materialized, Outcome::Error, probe);
                return None;
            }
        };

        let now = OffsetDateTime::now_utc();
        let staleness = self.config.l3_staleness_bound();
        let usable = row.filter(|row| {
            row.is_usable_at(now, staleness)
                && !self.fences.blocks(key.as_str(), &tag, &row.related_tags)
        });
        let Some(row) = usable else {
            self.record(Operation::CacheProbe, Tier::Materialized, Outcome::Miss, probe);
            return None;
        };
        let remaining = row.remaining_at(now, staleness);
        if remaining.is_zero() {
            self.record(Operation::CacheProbe, Tier::Materialized, Outcome::Miss, probe);
            return None;
        }

        self.record(Operation::CacheProbe, Tier::Materialized, Outcome::Hit, probe);
        tracing::debug!(key = %key, "cache hit (L3)");
        let value = Arc::new(row.value);

        if self.config.promotion_enabled {
            self.local.insert(
                key.as_str(),
                Arc::clone(&value),
                remaining.min(self.config.l1_default_ttl()),
                InsertOptions::new(tag.clone())
                    .related(&row.related_tags)
                    .origin(Tier::Materialized),
            );
            self.spawn_l2_promotion(key, Arc::clone(&value), remaining, tag, row.related_tags);
        }

        Some(CacheHit {
            value,
            tier: Tier::Materialized,
            remaining,
        })
    }

    fn spawn_l2_promotion(
        &self,
        key: &CacheKey,
        value: Arc<Vec<u8>>,
        remaining: Duration,
        tag: String,
        related_tags: Vec<String>,
    ) {
        if self.breaker.state() == BreakerState::Open {
            return;
        }
        let ttl = remaining.min(self.config.l2_default_ttl());
        let timeout = self.config.l2_timeout();
        let breaker = Arc::clone(&self.breaker);
        let distributed = Arc::clone(&self.distributed);
        let key = key.as_str().to_string();
        self.background.spawn(async move {
            let write = distributed.set(&key, value, ttl, &tag, &related_tags);
            if let Err(BreakerError::Inner(e)) = guarded(&breaker, timeout, write).await {
                tracing::warn!(key = %key, error = %e, "L2 promotion failed");
            }
        });
    }

    // =========================================================================
    // Write
    // =========================================================================

    pub async fn set(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration) {
        self.set_with_priority(key, value, ttl, 0.0).await;
    }

    /// Write through every tier. `priority` feeds Hybrid eviction.
    pub async fn set_with_priority(&self, key: &CacheKey, value: Vec<u8>, ttl: Duration, priority: f64) {
        self.write(key, value, ttl, priority, Vec::new()).await;
    }

    /// Like [`set`](Self::set) for a value derived from other resources as
    /// well as the key's own. Invalidating any of `related` drops it.
    pub async fn set_with_related(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        ttl: Duration,
        related: &[ResourceRef],
    ) {
        let own = key.tag();
        let mut related_tags: Vec<String> = Vec::with_capacity(related.len());
        for tag in related.iter().map(ResourceRef::tag) {
            if tag != own && !related_tags.contains(&tag) {
                related_tags.push(tag);
            }
        }
        self.write(key, value, ttl, 0.0, related_tags).await;
    }

    async fn write(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        ttl: Duration,
        priority: f64,
        related_tags: Vec<String>,
    ) {
        if self.is_closed() || ttl.is_zero() {
            return;
        }
        let tag = key.tag();
        let value = Arc::new(value);

        let started = Instant::now();
        self.local.insert(
            key.as_str(),
            Arc::clone(&value),
            ttl.min(self.config.l1_default_ttl()),
            InsertOptions::new(tag.clone())
                .related(&related_tags)
                .priority(priority),
        );
        self.record(Operation::CacheSet, Tier::Local, Outcome::Ok, started);

        let l2 = async {
            let started = Instant::now();
            let result = guarded(
                &self.breaker,
                self.config.l2_timeout(),
                self.distributed.set(
                    key.as_str(),
                    Arc::clone(&value),
                    ttl.min(self.config.l2_default_ttl()),
                    &tag,
                    &related_tags,
                ),
            )
            .await;
            match result {
                Ok(()) => self.record(Operation::CacheSet, Tier::Distributed, Outcome::Ok, started),
                Err(BreakerError::Open) => {
                    self.record(Operation::CacheSet, Tier::Distributed, Outcome::Skipped, started);
                }
                Err(BreakerError::Inner(e)) => {
                    tracing::warn!(key = %key, error = %e, "L2 write failed");
                    self.record(Operation::CacheSet, Tier::Distributed, Outcome::Error, started);
                }
            }
        };

        let l3 = async {
            let started = Instant::now();
            let now = OffsetDateTime::now_utc();
            let lifetime = ttl.min(self.config.l3_default_ttl());
            let row = ViewRow {
                key: key.as_str().to_string(),
                subject_id: key.subject_id().to_string(),
                tag: tag.clone(),
                related_tags: related_tags.clone(),
                value: value.to_vec(),
                computed_at: now,
                expires_at: now
                    .checked_add(time::Duration::try_from(lifetime).unwrap_or(time::Duration::ZERO))
                    .unwrap_or(now),
            };
            match with_timeout(Tier::Materialized, self.config.l3_timeout(), self.view.upsert(row)).await
            {
                Ok(()) => self.record(Operation::CacheSet, Tier::Materialized, Outcome::Ok, started),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "L3 write failed");
                    self.record(Operation::CacheSet, Tier::Materialized, Outcome::Error, started);
                }
            }
        };

        tokio::join!(l2, l3);
    }

    // =========================================================================
    // Invalidation
    // =========================================================================

    /// Remove every key matching a `*` glob. Returns how many local entries
    /// were removed; slower tiers are cleared in the background.
    pub fn invalidate(&self, pattern: &str) -> usize {
        self.invalidate_selector(Selector::Pattern(pattern.to_string()), "pattern")
    }

    pub fn invalidate_for_subject(&self, subject_id: &str) -> usize {
        self.invalidate_selector(Selector::Pattern(subject_pattern(subject_id)), "subject")
    }

    /// Remove every cached verdict about `resource`, for any subject.
    pub fn invalidate_resource(&self, resource: &ResourceRef) -> usize {
        self.invalidate_selector(Selector::Tag(resource.tag()), "resource")
    }

    fn invalidate_selector(&self, selector: Selector, scope: &'static str) -> usize {
        let started = Instant::now();
        if self.is_closed() {
            return 0;
        }

        let removed = match &selector {
            Selector::Pattern(pattern) => self.local.remove_matching(pattern),
            Selector::Tag(tag) => self.local.remove_tag(tag),
        };
        metrics::record_invalidation(scope, removed);
        self.record(Operation::CacheInvalidate, Tier::Local, Outcome::Ok, started);
        tracing::debug!(scope, selector = ?selector, removed, "cache invalidated (L1)");

        let fence = self
            .fences
            .raise(selector.clone(), self.config.slow_tier_max_ttl());
        let fences = Arc::clone(&self.fences);
        let breaker = Arc::clone(&self.breaker);
        let distributed = Arc::clone(&self.distributed);
        let view = Arc::clone(&self.view);
        let monitor = Arc::clone(&self.monitor);
        let timeout = self.config.invalidation_timeout();

        self.background.spawn(async move {
            let started = Instant::now();
            let l2 = async {
                let fut = async {
                    match &selector {
                        Selector::Pattern(p) => distributed.delete_matching(p).await,
                        Selector::Tag(t) => distributed.delete_tag(t).await,
                    }
                };
                match guarded(&breaker, timeout, fut).await {
                    Ok(n) => {
                        monitor.record(Operation::CacheInvalidate, TierLabel::Distributed, Outcome::Ok, started.elapsed());
                        tracing::debug!(scope, deleted = n, "cache invalidated (L2)");
                        true
                    }
                    Err(BreakerError::Open) => {
                        monitor.record(Operation::CacheInvalidate, TierLabel::Distributed, Outcome::Skipped, started.elapsed());
                        tracing::warn!(scope, "L2 invalidation skipped, circuit open");
                        false
                    }
                    Err(BreakerError::Inner(e)) => {
                        monitor.record(Operation::CacheInvalidate, TierLabel::Distributed, Outcome::Error, started.elapsed());
                        tracing::warn!(scope, error = %e, "L2 invalidation failed");
                        false
                    }
                }
            };
            let l3 = async {
                let fut = async {
                    match &selector {
                        Selector::Pattern(p) => view.delete_matching(p).await,
                        Selector::Tag(t) => view.delete_tag(t).await,
                    }
                };
                match with_timeout(Tier::Materialized, timeout, fut).await {
                    Ok(n) => {
                        monitor.record(Operation::CacheInvalidate, TierLabel::Materialized, Outcome::Ok, started.elapsed());
                        tracing::debug!(scope, deleted = n, "cache invalidated (L3)");
                        true
                    }
                    Err(e) => {
                        monitor.record(Operation::CacheInvalidate, TierLabel::Materialized, Outcome::Error, started.elapsed());
                        tracing::warn!(scope, error = %e, "L3 invalidation failed");
                        false
                    }
                }
            };
            let (l2_done, l3_done) = tokio::join!(l2, l3);
            // An unconfirmed delete keeps the fence until the slow tiers' TTL runs out.
            if l2_done && l3_done {
                fences.lower(fence);
            }
        });

        removed
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Wait until every background invalidation and promotion spawned before
    /// this call has finished. Tasks started meanwhile are not waited for.
    pub async fn wait_for_background_tasks(&self) {
        self.background.settle().await;
    }

    /// Periodically drop expired local entries and publish tier gauges.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = manager.local.purge_expired();
                        metrics::set_cache_entries(Tier::Local.as_str(), manager.local.len());
                        if purged > 0 {
                            tracing::debug!(purged, "purged expired local entries");
                        }
                    }
                }
            }
        })
    }

    pub fn metrics_snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            local: self.local.stats(),
            distributed_backend: self.distributed.backend(),
            view_backend: self.view.backend(),
            breakers: vec![self.breaker.snapshot()],
            pending_fences: self.fences.len(),
            closed: self.is_closed(),
            monitor: self.monitor.snapshot(),
            taken_at: OffsetDateTime::now_utc(),
        }
    }

    /// Stop accepting work, let pending background deletes finish within the
    /// shutdown grace period, and release tier connections. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tracker = &self.background.tracker;
        tracker.close();
        if tokio::time::timeout(self.config.shutdown_grace(), tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                pending = tracker.len(),
                "background cache tasks still running at shutdown"
            );
        }
        self.distributed.close().await;
        self.view.close().await;
        self.local.clear();
        tracing::info!("Cache manager closed");
    }
}

impl std::fmt::Debug for TieredCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCacheManager")
            .field("local_len", &self.local.len())
            .field("distributed", &self.distributed.backend())
            .field("view", &self.view.backend())
            .field("breaker", &self.breaker)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A distributed-tier call through the breaker, bounded by `timeout`.
/// Timeouts count as breaker failures.
async fn guarded<T, F>(
    breaker: &CircuitBreaker,
    timeout: Duration,
    fut: F,
) -> Result<T, BreakerError<TierError>>
where
    F: Future<Output = TierResult<T>>,
{
    breaker
        .call(with_timeout(Tier::Distributed, timeout, fut))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_core::{Permission, ResourceRef};

    fn key(subject: &str, generation: &str) -> CacheKey {
        CacheKey::new(subject, &ResourceRef::generation(generation), Permission::Read).unwrap()
    }

    fn manager_with(
        config: CacheConfig,
    ) -> (TieredCacheManager, Arc<InMemoryDistributedTier>, Arc<InMemoryView>) {
        let l2 = Arc::new(InMemoryDistributedTier::new());
        let l3 = Arc::new(InMemoryView::new());
        let manager = TieredCacheManager::builder(config)
            .distributed(l2.clone())
            .view(l3.clone())
            .build();
        (manager, l2, l3)
    }

    #[tokio::test]
    async fn test_set_writes_every_tier() {
        let (manager, l2, l3) = manager_with(CacheConfig::default());
        let k = key("alice", "g1");
        manager.set(&k, vec![1, 2], Duration::from_secs(30)).await;

        assert_eq!(manager.local_len(), 1);
        assert!(l2.contains(k.as_str()));
        assert_eq!(l3.row_count(), 1);

        let hit = manager.get(&k).await.unwrap();
        assert_eq!(hit.tier, Tier::Local);
        assert_eq!(*hit.value, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_l2_hit_promotes_to_l1() {
        let (manager, l2, _l3) = manager_with(CacheConfig::default());
        let k = key("alice", "g1");
        l2.set(k.as_str(), Arc::new(vec![7]), Duration::from_secs(30), &k.tag(), &[])
            .await
            .unwrap();

        let hit = manager.get(&k).await.unwrap();
        assert_eq!(hit.tier, Tier::Distributed);
        assert_eq!(manager.local_len(), 1);
        assert_eq!(manager.get(&k).await.unwrap().tier, Tier::Local);
    }

    #[tokio::test]
    async fn test_promotion_disabled() {
        let (manager, l2, _l3) = manager_with(CacheConfig {
            promotion_enabled: false,
            ..CacheConfig::default()
        });
        let k = key("alice", "g1");
        l2.set(k.as_str(), Arc::new(vec![7]), Duration::from_secs(30), &k.tag(), &[])
            .await
            .unwrap();

        assert_eq!(manager.get(&k).await.unwrap().tier, Tier::Distributed);
        assert_eq!(manager.local_len(), 0);
    }

    #[tokio::test]
    async fn test_l3_hit_promotes_to_l1_and_l2() {
        let (manager, l2, l3) = manager_with(CacheConfig::default());
        let k = key("alice", "g1");
        let now = OffsetDateTime::now_utc();
        l3.upsert(ViewRow {
            key: k.as_str().to_string(),
            subject_id: "alice".into(),
            tag: k.tag(),
            related_tags: vec!["generation/g0".into()],
            value: vec![9],
            computed_at: now,
            expires_at: now + time::Duration::minutes(5),
        })
        .await
        .unwrap();

        let hit = manager.get(&k).await.unwrap();
        assert_eq!(hit.tier, Tier::Materialized);
        manager.wait_for_background_tasks().await;
        assert_eq!(manager.local_len(), 1);
        assert!(l2.contains(k.as_str()));

        // Promoted copies keep the parent tag.
        assert_eq!(manager.invalidate_resource(&ResourceRef::generation("g0")), 1);
        manager.wait_for_background_tasks().await;
        assert!(!l2.contains(k.as_str()));
        assert_eq!(l3.row_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_view_row_is_a_miss() {
        let (manager, _l2, l3) = manager_with(CacheConfig::default());
        let k = key("alice", "g1");
        let computed_at = OffsetDateTime::now_utc() - time::Duration::hours(1);
        l3.upsert(ViewRow {
            key: k.as_str().to_string(),
            subject_id: "alice".into(),
            tag: k.tag(),
            related_tags: Vec::new(),
            value: vec![9],
            computed_at,
            expires_at: computed_at + time::Duration::hours(2),
        })
        .await
        .unwrap();

        assert!(manager.get(&k).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_for_subject() {
        let (manager, l2, l3) = manager_with(CacheConfig::default());
        let ttl = Duration::from_secs(30);
        manager.set(&key("alice", "g1"), vec![1], ttl).await;
        manager.set(&key("alice", "g2"), vec![1], ttl).await;
        manager.set(&key("bob", "g1"), vec![1], ttl).await;

        assert_eq!(manager.invalidate_for_subject("alice"), 2);
        // Local tier is clean before the background deletes even run.
        assert!(manager.get(&key("alice", "g1")).await.is_none());
        assert!(manager.get(&key("bob", "g1")).await.is_some());

        manager.wait_for_background_tasks().await;
        assert_eq!(l2.len(), 1);
        assert_eq!(l3.row_count(), 1);
        assert_eq!(manager.metrics_snapshot().pending_fences, 0);
    }

    #[tokio::test]
    async fn test_invalidate_resource() {
        let (manager, l2, _l3) = manager_with(CacheConfig::default());
        let ttl = Duration::from_secs(30);
        manager.set(&key("alice", "g1"), vec![1], ttl).await;
        manager.set(&key("bob", "g1"), vec![1], ttl).await;
        manager.set(&key("bob", "g2"), vec![1], ttl).await;

        assert_eq!(manager.invalidate_resource(&ResourceRef::generation("g1")), 2);
        manager.wait_for_background_tasks().await;
        assert_eq!(l2.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_related_resource_reaches_every_tier() {
        let (manager, l2, l3) = manager_with(CacheConfig::default());
        let ttl = Duration::from_secs(30);
        let child = key("alice", "g2");
        let parent = ResourceRef::generation("g1");
        manager
            .set_with_related(&child, vec![1], ttl, &[parent.clone(), parent.clone()])
            .await;
        manager.set(&key("alice", "g3"), vec![1], ttl).await;

        assert_eq!(manager.invalidate_resource(&parent), 1);
        assert!(manager.get(&child).await.is_none());
        manager.wait_for_background_tasks().await;
        assert!(!l2.contains(child.as_str()));
        assert_eq!(l2.len(), 1);
        assert_eq!(l3.row_count(), 1);
        assert!(manager.get(&child).await.is_none());
    }

    #[tokio::test]
    async fn test_fence_covers_related_tags() {
        let (manager, l2, l3) = manager_with(CacheConfig::default());
        let child = key("alice", "g2");
        let parent = ResourceRef::generation("g1");
        manager
            .set_with_related(&child, vec![1], Duration::from_secs(30), &[parent.clone()])
            .await;

        l2.set_available(false);
        l3.set_available(false);
        manager.invalidate_resource(&parent);
        manager.wait_for_background_tasks().await;
        l2.set_available(true);
        l3.set_available(true);

        assert!(l2.contains(child.as_str()));
        assert!(manager.get(&child).await.is_none());
    }

    #[tokio::test]
    async fn test_background_wait_ignores_later_tasks() {
        let background = Arc::new(Background::default());
        let (release, released) = tokio::sync::oneshot::channel::<()>();
        background.spawn(async move {
            let _ = released.await;
        });

        let settle = background.settle();
        background.spawn(std::future::pending());
        release.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), settle)
            .await
            .expect("earlier task finished");
    }

    #[tokio::test]
    async fn test_background_wait_during_close() {
        let (manager, _l2, _l3) = manager_with(CacheConfig::default());
        manager.set(&key("alice", "g1"), vec![1], Duration::from_secs(30)).await;
        manager.invalidate_for_subject("alice");

        tokio::join!(manager.wait_for_background_tasks(), manager.close());
        assert!(manager.background.tracker.is_closed());
        assert!(manager.background.tracker.is_empty());
        manager.wait_for_background_tasks().await;
    }

    #[tokio::test]
    async fn test_fence_hides_undeleted_slow_tier_values() {
        let (manager, l2, l3) = manager_with(CacheConfig::default());
        let k = key("alice", "g1");
        manager.set(&k, vec![1], Duration::from_secs(30)).await;

        l2.set_available(false);
        l3.set_available(false);
        manager.invalidate_for_subject("alice");
        manager.wait_for_background_tasks().await;
        l2.set_available(true);
        l3.set_available(true);

        // Both slow tiers still hold the value, but the fence stands.
        assert!(l2.contains(k.as_str()));
        assert!(manager.get(&k).await.is_none());
        assert_eq!(manager.metrics_snapshot().pending_fences, 1);
    }

    #[tokio::test]
    async fn test_write_skipped_when_breaker_open() {
        let (manager, l2, l3) = manager_with(CacheConfig {
            l2_failure_threshold: 1,
            ..CacheConfig::default()
        });
        l2.set_available(false);
        manager.get(&key("alice", "g0")).await;
        assert_eq!(manager.breaker_state(), BreakerState::Open);

        let calls = l2.call_count();
        let k = key("alice", "g1");
        manager.set(&k, vec![1], Duration::from_secs(30)).await;
        assert_eq!(l2.call_count(), calls);
        // The other tiers are still written.
        assert_eq!(manager.local_len(), 1);
        assert_eq!(l3.row_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_manager_is_inert() {
        let (manager, _l2, _l3) = manager_with(CacheConfig::default());
        let k = key("alice", "g1");
        manager.set(&k, vec![1], Duration::from_secs(30)).await;
        manager.close().await;
        manager.close().await;

        assert!(manager.is_closed());
        assert!(manager.get(&k).await.is_none());
        manager.set(&k, vec![1], Duration::from_secs(30)).await;
        assert_eq!(manager.local_len(), 0);
        assert_eq!(manager.invalidate_for_subject("alice"), 0);
    }

    #[tokio::test]
    async fn test_snapshot_counts_tiers() {
        let (manager, _l2, _l3) = manager_with(CacheConfig::default());
        let k = key("alice", "g1");
        assert!(manager.get(&k).await.is_none());
        manager.set(&k, vec![1], Duration::from_secs(30)).await;
        assert!(manager.get(&k).await.is_some());

        let snapshot = manager.metrics_snapshot();
        assert_eq!(snapshot.distributed_backend, "memory");
        assert_eq!(snapshot.breakers[0].state, BreakerState::Closed);
        assert_eq!(snapshot.monitor.hit_rate_by_tier["local"].hits, 1);
        assert_eq!(snapshot.monitor.overall_hit_rate, 0.5);
    }
}

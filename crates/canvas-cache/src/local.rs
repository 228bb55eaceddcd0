//! In-process cache tier.
//!
//! A bounded `DashMap` with per-entry TTL and a pluggable eviction policy.
//! Reads and replacements of existing keys never take a global lock; only
//! admitting a new key at capacity does, which is what keeps the entry count
//! at or below `max_entries` under concurrent inserts.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use canvas_core::pattern_matches;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::eviction::{EntryView, EvictionPolicy, EvictionScore, Normalization};
use crate::metrics;
use crate::tier::Tier;

/// A cached value plus the bookkeeping eviction needs.
#[derive(Debug)]
pub struct CacheEntry {
    pub value: Arc<Vec<u8>>,
    /// Resource tag (`{type}/{id}`) for resource-scoped invalidation.
    pub tag: String,
    /// Tags of other resources the value was derived from.
    pub related_tags: Vec<String>,
    /// Tier the value was first read from or written to.
    pub origin: Tier,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub size_bytes: usize,
    priority: f64,
    seq: u64,
    last_access: AtomicU64,
    access_count: AtomicU64,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    /// Whether invalidating `tag` must drop this entry.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag == tag || self.related_tags.iter().any(|t| t == tag)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    fn view(&self, base: Instant) -> EntryView {
        EntryView {
            last_access: self.last_access.load(Ordering::Relaxed),
            access_count: self.access_count.load(Ordering::Relaxed),
            expires_at_ms: self.expires_at.saturating_duration_since(base).as_millis() as u64,
            priority: self.priority,
            seq: self.seq,
        }
    }
}

/// A successful in-process lookup.
#[derive(Debug, Clone)]
pub struct LocalHit {
    pub value: Arc<Vec<u8>>,
    pub remaining: Duration,
    pub origin: Tier,
}

/// Options for a single insert.
#[derive(Debug, Clone)]
pub struct InsertOptions {
    pub tag: String,
    pub related_tags: Vec<String>,
    pub priority: f64,
    pub origin: Tier,
}

impl InsertOptions {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            related_tags: Vec::new(),
            priority: 0.0,
            origin: Tier::Local,
        }
    }

    /// Also index the entry under `tags`.
    pub fn related(mut self, tags: &[String]) -> Self {
        for tag in tags {
            if *tag != self.tag && !self.related_tags.contains(tag) {
                self.related_tags.push(tag.clone());
            }
        }
        self
    }

    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn origin(mut self, origin: Tier) -> Self {
        self.origin = origin;
        self
    }
}

/// Counters for the in-process tier.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LocalTierStats {
    pub size: usize,
    pub max_entries: usize,
    pub policy: &'static str,
    pub hits: u64,
    pub misses: u64,
    /// Entries removed to make room.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
}

impl LocalTierStats {
    /// Hit rate in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct LocalTier {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
    policy: EvictionPolicy,
    /// Serializes admission of new keys.
    admission: Mutex<()>,
    base: Instant,
    clock: AtomicU64,
    seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl LocalTier {
    pub fn new(max_entries: usize, policy: EvictionPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            policy,
            admission: Mutex::new(()),
            base: Instant::now(),
            clock: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a live entry, recording the access.
    pub fn get(&self, key: &str) -> Option<LocalHit> {
        let now = Instant::now();

        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired_at(now) {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                entry.access_count.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(LocalHit {
                    value: Arc::clone(&entry.value),
                    remaining: entry.expires_at.saturating_duration_since(now),
                    origin: entry.origin,
                });
            }
            drop(entry);
            // A concurrent writer may have replaced it with a fresh entry.
            if self
                .entries
                .remove_if(key, |_, e| e.is_expired_at(now))
                .is_some()
            {
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace `key`. A zero TTL is a no-op.
    pub fn insert(&self, key: &str, value: Arc<Vec<u8>>, ttl: Duration, opts: InsertOptions) {
        if ttl.is_zero() || self.max_entries == 0 {
            return;
        }
        let now = Instant::now();
        let entry = CacheEntry {
            size_bytes: value.len(),
            value,
            tag: opts.tag,
            related_tags: opts.related_tags,
            origin: opts.origin,
            created_at: now,
            expires_at: now + ttl,
            priority: opts.priority,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            last_access: AtomicU64::new(self.tick()),
            access_count: AtomicU64::new(0),
        };

        if let Some(mut existing) = self.entries.get_mut(key) {
            *existing = entry;
            return;
        }

        let _admission = self.admission.lock();
        if !self.entries.contains_key(key) {
            self.make_room();
        }
        self.entries.insert(key.to_string(), entry);
    }

    /// Evict until one more entry fits. Caller holds the admission lock.
    fn make_room(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        self.purge_expired();
        let len = self.entries.len();
        if len < self.max_entries {
            return;
        }
        let excess = len + 1 - self.max_entries;

        let views: Vec<(String, EntryView)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().view(self.base)))
            .collect();
        let norm = if self.policy.needs_normalization() {
            Normalization::from_entries(views.iter().map(|(_, v)| v))
        } else {
            Normalization::default()
        };

        let mut scored: Vec<(EvictionScore, String)> = views
            .into_iter()
            .map(|(key, view)| (self.policy.score_for_eviction(&view, &norm), key))
            .collect();
        if excess < scored.len() {
            scored.select_nth_unstable(excess - 1);
            scored.truncate(excess);
        }

        let mut evicted = 0u64;
        for (_, key) in scored {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        metrics::record_evictions(evicted);
        tracing::trace!(evicted, policy = self.policy.name(), "local tier eviction");
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every key matching a `*` glob. Returns how many were removed.
    pub fn remove_matching(&self, pattern: &str) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, _| {
            if pattern_matches(pattern, key) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove every entry indexed under `tag`, as its own resource or a
    /// related one.
    pub fn remove_tag(&self, tag: &str) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if entry.has_tag(tag) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            if entry.is_expired_at(now) {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        }
        removed
    }

    pub fn clear(&self) -> usize {
        let size = self.entries.len();
        self.entries.clear();
        size
    }

    pub fn stats(&self) -> LocalTierStats {
        LocalTierStats {
            size: self.entries.len(),
            max_entries: self.max_entries,
            policy: self.policy.name(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::HybridWeights;

    fn value(n: u8) -> Arc<Vec<u8>> {
        Arc::new(vec![n])
    }

    fn opts() -> InsertOptions {
        InsertOptions::new("generation/g1")
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_get_and_stats() {
        let tier = LocalTier::new(10, EvictionPolicy::Lru);
        tier.insert("a", value(1), TTL, opts());
        let hit = tier.get("a").unwrap();
        assert_eq!(*hit.value, vec![1]);
        assert_eq!(hit.origin, Tier::Local);
        assert!(tier.get("b").is_none());

        let stats = tier.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_absent() {
        let tier = LocalTier::new(10, EvictionPolicy::Lru);
        tier.insert("a", value(1), Duration::from_millis(100), opts());
        assert!(tier.get("a").is_some());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(tier.get("a").is_none());
        assert_eq!(tier.len(), 0);
        assert_eq!(tier.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_ttl_shrinks() {
        let tier = LocalTier::new(10, EvictionPolicy::Lru);
        tier.insert("a", value(1), Duration::from_secs(10), opts());
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(tier.get("a").unwrap().remaining, Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recent() {
        let tier = LocalTier::new(3, EvictionPolicy::Lru);
        tier.insert("a", value(1), TTL, opts());
        tier.insert("b", value(2), TTL, opts());
        tier.insert("c", value(3), TTL, opts());
        tier.get("a");
        tier.insert("d", value(4), TTL, opts());

        assert_eq!(tier.len(), 3);
        assert!(tier.get("b").is_none());
        assert!(tier.get("a").is_some());
        assert_eq!(tier.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_lfu_evicts_least_frequent() {
        let tier = LocalTier::new(3, EvictionPolicy::Lfu);
        for key in ["a", "b", "c"] {
            tier.insert(key, value(0), TTL, opts());
        }
        tier.get("a");
        tier.get("a");
        tier.get("b");
        tier.get("c");
        tier.get("c");
        tier.insert("d", value(4), TTL, opts());
        assert!(tier.get("b").is_none());
    }

    #[tokio::test]
    async fn test_ttl_policy_evicts_soonest_expiry() {
        let tier = LocalTier::new(2, EvictionPolicy::Ttl);
        tier.insert("long", value(1), Duration::from_secs(600), opts());
        tier.insert("short", value(2), Duration::from_secs(5), opts());
        tier.get("short");
        tier.insert("new", value(3), TTL, opts());
        assert!(tier.get("short").is_none());
        assert!(tier.get("long").is_some());
    }

    #[tokio::test]
    async fn test_hybrid_priority_protects_entry() {
        let weights = HybridWeights {
            recency: 0.5,
            frequency: 0.0,
            priority: 1.0,
        };
        let tier = LocalTier::new(2, EvictionPolicy::Hybrid(weights));
        tier.insert("pinned", value(1), TTL, opts().priority(1.0));
        tier.insert("plain", value(2), TTL, opts());
        tier.insert("new", value(3), TTL, opts());
        assert!(tier.get("pinned").is_some());
        assert!(tier.get("plain").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_purged_before_eviction() {
        let tier = LocalTier::new(2, EvictionPolicy::Lru);
        tier.insert("stale", value(1), Duration::from_secs(1), opts());
        tier.insert("fresh", value(2), TTL, opts());
        tokio::time::advance(Duration::from_secs(2)).await;
        tier.insert("new", value(3), TTL, opts());

        assert!(tier.get("fresh").is_some());
        let stats = tier.stats();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test]
    async fn test_replace_does_not_evict() {
        let tier = LocalTier::new(2, EvictionPolicy::Lru);
        tier.insert("a", value(1), TTL, opts());
        tier.insert("b", value(2), TTL, opts());
        tier.insert("a", value(9), TTL, opts());
        assert_eq!(tier.len(), 2);
        assert_eq!(*tier.get("a").unwrap().value, vec![9]);
        assert!(tier.get("b").is_some());
    }

    #[tokio::test]
    async fn test_remove_matching_and_tag() {
        let tier = LocalTier::new(10, EvictionPolicy::Lru);
        tier.insert("authz:alice:1", value(1), TTL, InsertOptions::new("generation/g1"));
        tier.insert("authz:alice:2", value(2), TTL, InsertOptions::new("file/f1"));
        tier.insert("authz:bob:1", value(3), TTL, InsertOptions::new("generation/g1"));

        assert_eq!(tier.remove_matching("authz:alice:*"), 2);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.remove_tag("generation/g1"), 1);
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_remove_tag_matches_related_tags() {
        let tier = LocalTier::new(10, EvictionPolicy::Lru);
        let parents = vec!["generation/g1".to_string(), "generation/g0".to_string()];
        tier.insert(
            "authz:alice:child",
            value(1),
            TTL,
            InsertOptions::new("generation/g2").related(&parents),
        );
        tier.insert("authz:alice:other", value(2), TTL, InsertOptions::new("generation/g3"));

        assert_eq!(tier.remove_tag("generation/g0"), 1);
        assert!(tier.get("authz:alice:child").is_none());
        assert!(tier.get("authz:alice:other").is_some());
    }

    #[test]
    fn test_related_skips_own_and_duplicate_tags() {
        let tags = vec!["file/f1".to_string(), "file/f2".to_string(), "file/f2".to_string()];
        let opts = InsertOptions::new("file/f1").related(&tags);
        assert_eq!(opts.related_tags, vec!["file/f2".to_string()]);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_noop() {
        let tier = LocalTier::new(10, EvictionPolicy::Lru);
        tier.insert("a", value(1), Duration::ZERO, opts());
        assert!(tier.is_empty());
    }
}

//! In-process stand-in for the distributed tier.
//!
//! Used when no `l2_endpoint` is configured, and by tests, which can make it
//! fail or stall to drive the circuit breaker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use canvas_core::pattern_matches;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{DistributedTier, TierValue};
use crate::error::{TierError, TierResult};
use crate::tier::Tier;

#[derive(Debug)]
struct StoredValue {
    value: Arc<Vec<u8>>,
    tag: String,
    related_tags: Vec<String>,
    expires_at: Instant,
}

impl StoredValue {
    fn has_tag(&self, tag: &str) -> bool {
        self.tag == tag || self.related_tags.iter().any(|t| t == tag)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDistributedTier {
    entries: DashMap<String, StoredValue>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    calls: AtomicU64,
}

impl InMemoryDistributedTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the network were down.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of calls that reached this tier.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries.get(key).is_some_and(|e| e.expires_at > now)
    }

    async fn enter(&self) -> TierResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TierError::unavailable(Tier::Distributed, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl DistributedTier for InMemoryDistributedTier {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> TierResult<Option<TierValue>> {
        self.enter().await?;
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| TierValue {
                value: Arc::clone(&e.value),
                remaining: e.expires_at.saturating_duration_since(now),
                related_tags: e.related_tags.clone(),
            }))
    }

    async fn set(
        &self,
        key: &str,
        value: Arc<Vec<u8>>,
        ttl: Duration,
        tag: &str,
        related_tags: &[String],
    ) -> TierResult<()> {
        self.enter().await?;
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                tag: tag.to_string(),
                related_tags: related_tags.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> TierResult<u64> {
        self.enter().await?;
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let hit = pattern_matches(pattern, key);
            removed += u64::from(hit);
            !hit
        });
        Ok(removed)
    }

    async fn delete_tag(&self, tag: &str) -> TierResult<u64> {
        self.enter().await?;
        let mut removed = 0;
        self.entries.retain(|_, stored| {
            let hit = stored.has_tag(tag);
            removed += u64::from(hit);
            !hit
        });
        Ok(removed)
    }

    async fn ping(&self) -> TierResult<()> {
        self.enter().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_get_expire() {
        let tier = InMemoryDistributedTier::new();
        tier.set("k", Arc::new(vec![1]), Duration::from_secs(10), "file/f1", &[])
            .await
            .unwrap();
        let hit = tier.get("k").await.unwrap().unwrap();
        assert_eq!(*hit.value, vec![1]);
        assert_eq!(hit.remaining, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(tier.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deletes() {
        let tier = InMemoryDistributedTier::new();
        let ttl = Duration::from_secs(60);
        let parent = vec!["generation/g0".to_string()];
        tier.set("authz:a:1", Arc::new(vec![1]), ttl, "file/f1", &[]).await.unwrap();
        tier.set("authz:a:2", Arc::new(vec![2]), ttl, "file/f2", &[]).await.unwrap();
        tier.set("authz:b:1", Arc::new(vec![3]), ttl, "file/f1", &[]).await.unwrap();
        tier.set("authz:b:2", Arc::new(vec![4]), ttl, "generation/g1", &parent)
            .await
            .unwrap();

        assert_eq!(tier.get("authz:b:2").await.unwrap().unwrap().related_tags, parent);
        assert_eq!(tier.delete_tag("generation/g0").await.unwrap(), 1);
        assert_eq!(tier.delete_tag("file/f1").await.unwrap(), 2);
        assert_eq!(tier.delete_matching("authz:a:*").await.unwrap(), 1);
        assert!(tier.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let tier = InMemoryDistributedTier::new();
        tier.set_available(false);
        assert!(matches!(
            tier.get("k").await,
            Err(TierError::Unavailable { tier: Tier::Distributed, .. })
        ));
        assert_eq!(tier.call_count(), 1);
    }
}

//! Cross-tier behaviour of the cache manager with in-process backends.

use std::sync::Arc;
use std::time::Duration;

use canvas_cache::{
    BreakerState, CacheConfig, DistributedTier, EvictionPolicy, EvictionPolicyKind,
    InMemoryDistributedTier, InMemoryView, LocalTier, Tier, TieredCacheManager,
};
use canvas_cache::local::InsertOptions;
use canvas_core::{CacheKey, Permission, ResourceRef};

fn key(subject: &str, n: usize) -> CacheKey {
    CacheKey::new(subject, &ResourceRef::file(format!("f{n}")), Permission::Read).unwrap()
}

fn manager(config: CacheConfig) -> (TieredCacheManager, Arc<InMemoryDistributedTier>) {
    let l2 = Arc::new(InMemoryDistributedTier::new());
    let manager = TieredCacheManager::builder(config)
        .distributed(l2.clone())
        .view(Arc::new(InMemoryView::new()))
        .build();
    (manager, l2)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_tier_stays_bounded_under_concurrent_inserts() {
    for policy in [
        EvictionPolicyKind::Lru,
        EvictionPolicyKind::Lfu,
        EvictionPolicyKind::Ttl,
        EvictionPolicyKind::Hybrid,
    ] {
        let tier = Arc::new(LocalTier::new(
            100,
            EvictionPolicy::from_config(policy, Default::default()),
        ));

        let mut handles = Vec::new();
        for worker in 0..8 {
            let tier = Arc::clone(&tier);
            handles.push(tokio::spawn(async move {
                for i in 0..500 {
                    let key = format!("authz:w{worker}:{i}");
                    tier.insert(
                        &key,
                        Arc::new(vec![0u8; 8]),
                        Duration::from_secs(60),
                        InsertOptions::new("file/f1"),
                    );
                    tier.get(&format!("authz:w{worker}:{}", i / 2));
                    assert!(tier.len() <= 100, "{policy:?} exceeded bound");
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(tier.len() <= 100);
        assert!(tier.stats().evictions >= 3900);
    }
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_fails_fast() {
    let (manager, l2) = manager(CacheConfig {
        l2_failure_threshold: 3,
        l2_open_duration_seconds: 30,
        ..CacheConfig::default()
    });
    l2.set_available(false);

    for n in 0..3 {
        assert!(manager.get(&key("alice", n)).await.is_none());
    }
    assert_eq!(manager.breaker_state(), BreakerState::Open);
    assert_eq!(l2.call_count(), 3);

    // Open: the tier is not touched at all.
    let started = tokio::time::Instant::now();
    assert!(manager.get(&key("alice", 3)).await.is_none());
    assert_eq!(l2.call_count(), 3);
    assert!(started.elapsed() < Duration::from_millis(1));

    // After the cool-down, exactly one trial goes through and closes it.
    tokio::time::advance(Duration::from_secs(30)).await;
    l2.set_available(true);
    assert!(manager.get(&key("alice", 4)).await.is_none());
    assert_eq!(l2.call_count(), 4);
    assert_eq!(manager.breaker_state(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_tier_times_out_and_opens_breaker() {
    let (manager, l2) = manager(CacheConfig {
        l2_failure_threshold: 2,
        l2_timeout_ms: 50,
        ..CacheConfig::default()
    });
    l2.set_latency(Duration::from_secs(5));

    for n in 0..2 {
        let started = tokio::time::Instant::now();
        assert!(manager.get(&key("alice", n)).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
    assert_eq!(manager.breaker_state(), BreakerState::Open);

    let snapshot = manager.metrics_snapshot();
    assert_eq!(snapshot.monitor.hit_rate_by_tier["distributed"].errors, 2);
    assert_eq!(snapshot.breakers[0].consecutive_failures, 2);
}

#[tokio::test(start_paused = true)]
async fn test_promoted_ttl_is_capped_by_local_default() {
    let (manager, l2) = manager(CacheConfig {
        l1_default_ttl_seconds: 10,
        ..CacheConfig::default()
    });
    let k = key("alice", 1);
    l2.set(k.as_str(), Arc::new(vec![1]), Duration::from_secs(200), &k.tag(), &[])
        .await
        .unwrap();

    assert_eq!(manager.get(&k).await.unwrap().tier, Tier::Distributed);
    assert_eq!(manager.get(&k).await.unwrap().tier, Tier::Local);

    tokio::time::advance(Duration::from_secs(11)).await;
    // Local copy expired; the distributed tier still answers.
    assert_eq!(manager.get(&k).await.unwrap().tier, Tier::Distributed);
}

#[tokio::test(start_paused = true)]
async fn test_requested_ttl_bounds_every_tier() {
    let (manager, l2) = manager(CacheConfig::default());
    let k = key("alice", 1);
    manager.set(&k, vec![1], Duration::from_secs(5)).await;

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(!l2.contains(k.as_str()));
    assert!(manager.local().get(k.as_str()).is_none());
}

#[tokio::test]
async fn test_hybrid_priority_protects_entries() {
    let (manager, _l2) = manager(CacheConfig {
        l1_max_entries: 2,
        l1_eviction_policy: EvictionPolicyKind::Hybrid,
        l1_hybrid_weights: canvas_cache::HybridWeights {
            recency: 0.0,
            frequency: 0.0,
            priority: 1.0,
        },
        ..CacheConfig::default()
    });
    let ttl = Duration::from_secs(60);
    manager.set_with_priority(&key("alice", 1), vec![1], ttl, 1.0).await;
    manager.set_with_priority(&key("alice", 2), vec![2], ttl, 0.0).await;
    manager.set_with_priority(&key("alice", 3), vec![3], ttl, 0.5).await;

    assert_eq!(manager.local_len(), 2);
    assert!(manager.local().get(key("alice", 1).as_str()).is_some());
    assert!(manager.local().get(key("alice", 2).as_str()).is_none());
}

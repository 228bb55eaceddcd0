//! # canvas-cache
//!
//! Three-tier cache for authorization verdicts:
//!
//! | Tier | Module | Backends |
//! |------|--------|----------|
//! | in-process | [`local`] | bounded `DashMap`, LRU/LFU/TTL/Hybrid eviction |
//! | distributed | [`distributed`] | Redis, in-process stand-in |
//! | materialized view | [`view`] | Redis hashes, in-process snapshots |
//!
//! [`TieredCacheManager`] orchestrates lookups, write-through, promotion and
//! invalidation across them. The distributed tier sits behind a
//! [`CircuitBreaker`]; every step is reported to the [`PerformanceMonitor`].

pub mod breaker;
pub mod config;
pub mod distributed;
pub mod error;
pub mod eviction;
pub mod local;
pub mod manager;
pub mod metrics;
pub mod monitor;
pub mod tier;
pub mod view;

pub use breaker::{BreakerError, BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState};
pub use config::CacheConfig;
pub use distributed::{DistributedTier, InMemoryDistributedTier, InvalidationListener, RedisDistributedTier};
pub use error::{TierError, TierResult};
pub use eviction::{EvictionPolicy, EvictionPolicyKind, HybridWeights};
pub use local::{LocalTier, LocalTierStats};
pub use manager::{CacheHit, CacheSnapshot, TieredCacheManager, TieredCacheManagerBuilder};
pub use monitor::{
    Alert, AlertReason, AlertSink, AlertState, MonitorConfig, MonitorSnapshot, Operation, Outcome,
    PerformanceMonitor, TierLabel,
};
pub use tier::Tier;
pub use view::{InMemoryView, MaterializedView, RedisView, ViewRow};

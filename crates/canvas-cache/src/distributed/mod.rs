//! Distributed (tier 2) cache.
//!
//! A store shared by every process instance. It sits behind the circuit
//! breaker in [`crate::manager`]; implementations just report failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TierResult;

pub mod memory;
pub mod pubsub;
pub mod redis;

pub use memory::InMemoryDistributedTier;
pub use pubsub::{INVALIDATION_CHANNEL, InvalidationListener, InvalidationMessage};
pub use redis::RedisDistributedTier;

/// A value read from a slower tier together with its remaining lifetime.
#[derive(Debug, Clone)]
pub struct TierValue {
    pub value: Arc<Vec<u8>>,
    pub remaining: Duration,
    /// Tags of other resources the value was derived from.
    pub related_tags: Vec<String>,
}

#[async_trait]
pub trait DistributedTier: Send + Sync {
    /// Backend name for logs and snapshots.
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> TierResult<Option<TierValue>>;

    /// Store `value` under `key` for `ttl`, indexed by resource `tag` and
    /// every one of `related_tags`.
    async fn set(
        &self,
        key: &str,
        value: Arc<Vec<u8>>,
        ttl: Duration,
        tag: &str,
        related_tags: &[String],
    ) -> TierResult<()>;

    /// Delete every key matching a `*` glob. Returns how many were deleted.
    async fn delete_matching(&self, pattern: &str) -> TierResult<u64>;

    /// Delete every key indexed under `tag`, as its own or a related tag.
    async fn delete_tag(&self, tag: &str) -> TierResult<u64>;

    async fn ping(&self) -> TierResult<()>;

    /// Release connections. Later calls may fail.
    async fn close(&self) {}
}

//! Redis-backed distributed tier.
//!
//! Layout:
//! - `authz:{subject}:{digest}`: MessagePack [`StoredEntry`], `SET .. PX ttl`
//! - `authzidx:{type}/{id}`: set of keys cached for, or derived from, one
//!   resource
//!
//! Index sets live outside the `authz:` namespace so that no subject id can
//! make a key pattern match them.
//!
//! Deletes are announced on [`INVALIDATION_CHANNEL`] so other instances can
//! drop the same keys from their in-process tier.

use std::sync::Arc;
use std::time::Duration;

use ::redis::AsyncCommands;
use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use serde::{Deserialize, Serialize};

use super::pubsub::{INVALIDATION_CHANNEL, InvalidationMessage};
use super::{DistributedTier, TierValue};
use crate::error::{TierError, TierResult};
use crate::tier::Tier;

const INDEX_PREFIX: &str = "authzidx:";
const SCAN_COUNT: usize = 500;

/// What a verdict key holds.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    value: Vec<u8>,
    #[serde(default)]
    related_tags: Vec<String>,
}

fn encode_entry(entry: &StoredEntry) -> TierResult<Vec<u8>> {
    rmp_serde::to_vec_named(entry).map_err(|e| TierError::codec(Tier::Distributed, e.to_string()))
}

fn decode_entry(bytes: &[u8]) -> TierResult<StoredEntry> {
    rmp_serde::from_slice(bytes).map_err(|e| TierError::codec(Tier::Distributed, e.to_string()))
}

/// Build a connection pool and check that Redis answers.
pub async fn create_pool(
    tier: Tier,
    url: &str,
    pool_size: usize,
    timeout: Duration,
) -> TierResult<Pool> {
    let mut redis_config = deadpool_redis::Config::from_url(url);
    let pool_config = redis_config.pool.get_or_insert_with(Default::default);
    pool_config.max_size = pool_size;
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);

    let pool = redis_config
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| TierError::unavailable(tier, format!("failed to create pool: {e}")))?;

    pool.get().await.map_err(|e| TierError::pool(tier, e))?;
    Ok(pool)
}

pub struct RedisDistributedTier {
    pool: Pool,
    /// Lifetime of resource index sets; at least the longest entry TTL.
    index_ttl: Duration,
}

impl RedisDistributedTier {
    pub fn new(pool: Pool, index_ttl: Duration) -> Self {
        Self { pool, index_ttl }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn index_key(tag: &str) -> String {
        format!("{INDEX_PREFIX}{tag}")
    }

    async fn conn(&self) -> TierResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| TierError::pool(Tier::Distributed, e))
    }

    async fn publish(conn: &mut Connection, message: InvalidationMessage) {
        let payload = message.encode();
        if let Err(e) = conn
            .publish::<_, _, ()>(INVALIDATION_CHANNEL, &payload)
            .await
        {
            tracing::warn!(payload = %payload, error = %e, "Redis PUBLISH error");
        }
    }
}

fn redis_err(e: ::redis::RedisError) -> TierError {
    TierError::redis(Tier::Distributed, e)
}

#[async_trait]
impl DistributedTier for RedisDistributedTier {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> TierResult<Option<TierValue>> {
        let mut conn = self.conn().await?;
        let (value, pttl): (Option<Vec<u8>>, i64) = ::redis::pipe()
            .get(key)
            .pttl(key)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let Some(bytes) = value else {
            return Ok(None);
        };
        let entry = decode_entry(&bytes)?;
        // -1: no expiry set. Treat as living as long as the index does.
        let remaining = if pttl > 0 {
            Duration::from_millis(pttl as u64)
        } else {
            self.index_ttl
        };
        Ok(Some(TierValue {
            value: Arc::new(entry.value),
            remaining,
            related_tags: entry.related_tags,
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
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let index_ttl_ms = self.index_ttl.as_millis() as i64;
        let bytes = encode_entry(&StoredEntry {
            value: value.to_vec(),
            related_tags: related_tags.to_vec(),
        })?;

        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(key)
            .arg(bytes)
            .arg("PX")
            .arg(ttl_ms)
            .ignore();
        for index in std::iter::once(tag).chain(related_tags.iter().map(String::as_str)) {
            let index = Self::index_key(index);
            pipe.sadd(&index, key)
                .ignore()
                .pexpire(&index, index_ttl_ms)
                .ignore();
        }
        let mut conn = self.conn().await?;
        let _: () = pipe.query_async(&mut conn).await.map_err(redis_err)?;
        tracing::debug!(key = %key, ttl_ms, "cache set (L2)");
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> TierResult<u64> {
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;
            // A catch-all pattern also matches index sets; they expire on
            // their own.
            let keys: Vec<String> = keys
                .into_iter()
                .filter(|k| !k.starts_with(INDEX_PREFIX))
                .collect();
            if !keys.is_empty() {
                let n: u64 = conn.del(&keys).await.map_err(redis_err)?;
                deleted += n;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Self::publish(&mut conn, InvalidationMessage::Pattern(pattern.to_string())).await;
        tracing::debug!(pattern = %pattern, deleted, "cache invalidated (L2 pattern)");
        Ok(deleted)
    }

    async fn delete_tag(&self, tag: &str) -> TierResult<u64> {
        let index = Self::index_key(tag);
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn.smembers(&index).await.map_err(redis_err)?;
        let mut deleted = 0;
        if !keys.is_empty() {
            deleted = conn.del(&keys).await.map_err(redis_err)?;
        }
        let _: u64 = conn.del(&index).await.map_err(redis_err)?;
        Self::publish(&mut conn, InvalidationMessage::Tag(tag.to_string())).await;
        tracing::debug!(tag = %tag, deleted, "cache invalidated (L2 tag)");
        Ok(deleted)
    }

    async fn ping(&self) -> TierResult<()> {
        let mut conn = self.conn().await?;
        let _: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }
}

//! Redis-backed materialized view.
//!
//! Layout:
//! - `authzview:{subject}`: hash of cache key -> MessagePack [`ViewRow`]
//! - `authzview:idx:{type}/{id}`: set of cache keys per resource, own or
//!   related
//!
//! A subject refresh writes a staging hash and `RENAME`s it over the live
//! one inside a `MULTI`, so readers never observe a half-written subject.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ::redis::AsyncCommands;
use async_trait::async_trait;
use canvas_core::pattern_matches;
use deadpool_redis::{Connection, Pool};

use super::{MaterializedView, ViewRow, subject_of_key, subject_of_pattern};
use crate::error::{TierError, TierResult};
use crate::tier::Tier;

const VIEW_PREFIX: &str = "authzview:";
const INDEX_PREFIX: &str = "authzview:idx:";
const SCAN_COUNT: usize = 500;

pub struct RedisView {
    pool: Pool,
    /// Lifetime of subject hashes and index sets.
    key_ttl: Duration,
    staging_seq: AtomicU64,
}

impl RedisView {
    pub fn new(pool: Pool, key_ttl: Duration) -> Self {
        Self {
            pool,
            key_ttl,
            staging_seq: AtomicU64::new(0),
        }
    }

    fn subject_key(subject_id: &str) -> String {
        format!("{VIEW_PREFIX}{subject_id}")
    }

    fn index_key(tag: &str) -> String {
        format!("{INDEX_PREFIX}{tag}")
    }

    async fn conn(&self) -> TierResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| TierError::pool(Tier::Materialized, e))
    }

    /// HDEL the fields of `hash` matching `pattern`.
    async fn prune_hash(conn: &mut Connection, hash: &str, pattern: &str) -> TierResult<u64> {
        let fields: Vec<String> = conn.hkeys(hash).await.map_err(redis_err)?;
        let doomed: Vec<String> = fields
            .into_iter()
            .filter(|f| pattern_matches(pattern, f))
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        conn.hdel(hash, &doomed).await.map_err(redis_err)
    }
}

fn redis_err(e: ::redis::RedisError) -> TierError {
    TierError::redis(Tier::Materialized, e)
}

fn encode_row(row: &ViewRow) -> TierResult<Vec<u8>> {
    rmp_serde::to_vec_named(row).map_err(|e| TierError::codec(Tier::Materialized, e.to_string()))
}

fn decode_row(bytes: &[u8]) -> TierResult<ViewRow> {
    rmp_serde::from_slice(bytes).map_err(|e| TierError::codec(Tier::Materialized, e.to_string()))
}

#[async_trait]
impl MaterializedView for RedisView {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, subject_id: &str, key: &str) -> TierResult<Option<ViewRow>> {
        let mut conn = self.conn().await?;
        let bytes: Option<Vec<u8>> = conn
            .hget(Self::subject_key(subject_id), key)
            .await
            .map_err(redis_err)?;
        bytes.map(|b| decode_row(&b)).transpose()
    }

    async fn upsert(&self, row: ViewRow) -> TierResult<()> {
        let bytes = encode_row(&row)?;
        let hash = Self::subject_key(&row.subject_id);
        let ttl_ms = self.key_ttl.as_millis() as i64;
        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .hset(&hash, &row.key, bytes)
            .ignore()
            .pexpire(&hash, ttl_ms)
            .ignore();
        for tag in row.tags() {
            let index = Self::index_key(tag);
            pipe.sadd(&index, &row.key)
                .ignore()
                .pexpire(&index, ttl_ms)
                .ignore();
        }
        let mut conn = self.conn().await?;
        let _: () = pipe.query_async(&mut conn).await.map_err(redis_err)?;
        Ok(())
    }

    async fn replace_subject(&self, subject_id: &str, rows: Vec<ViewRow>) -> TierResult<()> {
        let live = Self::subject_key(subject_id);
        let mut conn = self.conn().await?;

        if rows.is_empty() {
            let _: u64 = conn.del(&live).await.map_err(redis_err)?;
            return Ok(());
        }

        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        let staging = format!("{live}:staging:{}:{seq}", std::process::id());
        let ttl_ms = self.key_ttl.as_millis() as i64;

        let mut fields = Vec::with_capacity(rows.len());
        let mut by_tag: HashMap<String, Vec<String>> = HashMap::new();
        for row in &rows {
            fields.push((row.key.clone(), encode_row(row)?));
            for tag in row.tags() {
                by_tag
                    .entry(Self::index_key(tag))
                    .or_default()
                    .push(row.key.clone());
            }
        }

        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .del(&staging)
            .ignore()
            .hset_multiple(&staging, &fields)
            .ignore()
            .rename(&staging, &live)
            .ignore()
            .pexpire(&live, ttl_ms)
            .ignore();
        for (index, keys) in &by_tag {
            pipe.sadd(index, keys).ignore().pexpire(index, ttl_ms).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(redis_err)?;

        tracing::debug!(subject_id = %subject_id, rows = rows.len(), "view subject replaced");
        Ok(())
    }

    async fn subject_rows(&self, subject_id: &str) -> TierResult<Vec<ViewRow>> {
        let mut conn = self.conn().await?;
        let values: Vec<Vec<u8>> = conn
            .hvals(Self::subject_key(subject_id))
            .await
            .map_err(redis_err)?;
        values.iter().map(|b| decode_row(b)).collect()
    }

    async fn delete_matching(&self, pattern: &str) -> TierResult<u64> {
        let mut conn = self.conn().await?;

        if let Some(subject) = subject_of_pattern(pattern) {
            return Self::prune_hash(&mut conn, &Self::subject_key(subject), pattern).await;
        }

        let mut hashes = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{VIEW_PREFIX}*"))
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;
            hashes.extend(
                keys.into_iter()
                    .filter(|k| !k.starts_with(INDEX_PREFIX) && !k.contains(":staging:")),
            );
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let mut deleted = 0;
        for hash in &hashes {
            deleted += Self::prune_hash(&mut conn, hash, pattern).await?;
        }
        tracing::debug!(pattern = %pattern, deleted, "cache invalidated (L3 pattern)");
        Ok(deleted)
    }

    async fn delete_tag(&self, tag: &str) -> TierResult<u64> {
        let index = Self::index_key(tag);
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn.smembers(&index).await.map_err(redis_err)?;

        let mut by_subject: HashMap<&str, Vec<&str>> = HashMap::new();
        for key in &keys {
            if let Some(subject) = subject_of_key(key) {
                by_subject.entry(subject).or_default().push(key);
            }
        }

        let mut deleted = 0;
        for (subject, fields) in by_subject {
            let n: u64 = conn
                .hdel(Self::subject_key(subject), fields)
                .await
                .map_err(redis_err)?;
            deleted += n;
        }
        let _: u64 = conn.del(&index).await.map_err(redis_err)?;
        tracing::debug!(tag = %tag, deleted, "cache invalidated (L3 tag)");
        Ok(deleted)
    }

    async fn close(&self) {
        self.pool.close();
    }
}

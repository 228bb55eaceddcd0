//! Materialized-view (tier 3) cache.
//!
//! Precomputed verdict rows grouped per subject. The refresher replaces a
//! subject's rows as one snapshot; the manager reads single rows and writes
//! through on `set`.

use std::time::Duration;

use async_trait::async_trait;
use canvas_core::KEY_PREFIX;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::TierResult;

pub mod memory;
pub mod redis;

pub use memory::InMemoryView;
pub use redis::RedisView;

/// One precomputed verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewRow {
    pub key: String,
    pub subject_id: String,
    /// Resource tag (`{type}/{id}`).
    pub tag: String,
    /// Tags of other resources the verdict was derived from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_tags: Vec<String>,
    /// Encoded verdict.
    pub value: Vec<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl ViewRow {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tag == tag || self.related_tags.iter().any(|t| t == tag)
    }

    /// Own tag followed by the related ones.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.tag.as_str()).chain(self.related_tags.iter().map(String::as_str))
    }

    /// A row is usable while unexpired and younger than `staleness_bound`.
    pub fn is_usable_at(&self, now: OffsetDateTime, staleness_bound: Duration) -> bool {
        if self.expires_at <= now {
            return false;
        }
        let age = now - self.computed_at;
        age <= time::Duration::try_from(staleness_bound).unwrap_or(time::Duration::MAX)
    }

    /// Lifetime left, bounded by both expiry and staleness.
    pub fn remaining_at(&self, now: OffsetDateTime, staleness_bound: Duration) -> Duration {
        let stale_at = self
            .computed_at
            .checked_add(time::Duration::try_from(staleness_bound).unwrap_or(time::Duration::MAX))
            .unwrap_or(self.expires_at);
        let end = self.expires_at.min(stale_at);
        Duration::try_from(end - now).unwrap_or(Duration::ZERO)
    }
}

/// Subject segment of a cache key (`authz:{subject}:{digest}`).
pub fn subject_of_key(key: &str) -> Option<&str> {
    key.strip_prefix(KEY_PREFIX)?
        .strip_prefix(':')?
        .split_once(':')
        .map(|(subject, _)| subject)
}

/// Subject a pattern is confined to, if its subject segment is literal.
pub fn subject_of_pattern(pattern: &str) -> Option<&str> {
    subject_of_key(pattern).filter(|s| !s.contains('*'))
}

#[async_trait]
pub trait MaterializedView: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn get(&self, subject_id: &str, key: &str) -> TierResult<Option<ViewRow>>;

    /// Insert or replace a single row.
    async fn upsert(&self, row: ViewRow) -> TierResult<()>;

    /// Atomically replace every row of `subject_id`. Readers see either the
    /// old snapshot or the new one, never a mix.
    async fn replace_subject(&self, subject_id: &str, rows: Vec<ViewRow>) -> TierResult<()>;

    async fn subject_rows(&self, subject_id: &str) -> TierResult<Vec<ViewRow>>;

    async fn delete_matching(&self, pattern: &str) -> TierResult<u64>;

    async fn delete_tag(&self, tag: &str) -> TierResult<u64>;

    async fn close(&self) {}
}

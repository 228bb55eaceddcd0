//! In-process materialized view.
//!
//! Each subject maps to an immutable `Arc` snapshot. Writers build a new
//! snapshot and swap it in with a single map insert.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use canvas_core::pattern_matches;
use dashmap::DashMap;

use super::{MaterializedView, ViewRow, subject_of_pattern};
use crate::error::{TierError, TierResult};
use crate::tier::Tier;

type Snapshot = Arc<HashMap<String, ViewRow>>;

#[derive(Debug, Default)]
pub struct InMemoryView {
    subjects: DashMap<String, Snapshot>,
    unavailable: AtomicBool,
}

impl InMemoryView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Total rows across all subjects.
    pub fn row_count(&self) -> usize {
        self.subjects.iter().map(|s| s.len()).sum()
    }

    fn check(&self) -> TierResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TierError::unavailable(Tier::Materialized, "view store unavailable"));
        }
        Ok(())
    }

    /// Remove rows matching `predicate` from one subject's snapshot.
    fn prune_subject(&self, subject_id: &str, predicate: impl Fn(&ViewRow) -> bool) -> u64 {
        let Some(mut snapshot) = self.subjects.get_mut(subject_id) else {
            return 0;
        };
        let before = snapshot.len();
        if !snapshot.values().any(&predicate) {
            return 0;
        }
        let kept: HashMap<String, ViewRow> = snapshot
            .iter()
            .filter(|(_, row)| !predicate(row))
            .map(|(k, row)| (k.clone(), row.clone()))
            .collect();
        let removed = (before - kept.len()) as u64;
        *snapshot = Arc::new(kept);
        removed
    }
}

#[async_trait]
impl MaterializedView for InMemoryView {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, subject_id: &str, key: &str) -> TierResult<Option<ViewRow>> {
        self.check()?;
        let snapshot = self.subjects.get(subject_id).map(|s| Arc::clone(s.value()));
        Ok(snapshot.and_then(|s| s.get(key).cloned()))
    }

    async fn upsert(&self, row: ViewRow) -> TierResult<()> {
        self.check()?;
        let mut snapshot = self.subjects.entry(row.subject_id.clone()).or_default();
        Arc::make_mut(snapshot.value_mut()).insert(row.key.clone(), row);
        Ok(())
    }

    async fn replace_subject(&self, subject_id: &str, rows: Vec<ViewRow>) -> TierResult<()> {
        self.check()?;
        if rows.is_empty() {
            self.subjects.remove(subject_id);
            return Ok(());
        }
        let snapshot: HashMap<String, ViewRow> =
            rows.into_iter().map(|row| (row.key.clone(), row)).collect();
        self.subjects
            .insert(subject_id.to_string(), Arc::new(snapshot));
        Ok(())
    }

    async fn subject_rows(&self, subject_id: &str) -> TierResult<Vec<ViewRow>> {
        self.check()?;
        let snapshot = self.subjects.get(subject_id).map(|s| Arc::clone(s.value()));
        Ok(snapshot
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_matching(&self, pattern: &str) -> TierResult<u64> {
        self.check()?;
        let subjects: Vec<String> = match subject_of_pattern(pattern) {
            Some(subject) => vec![subject.to_string()],
            None => self.subjects.iter().map(|s| s.key().clone()).collect(),
        };
        Ok(subjects
            .iter()
            .map(|subject| self.prune_subject(subject, |row| pattern_matches(pattern, &row.key)))
            .sum())
    }

    async fn delete_tag(&self, tag: &str) -> TierResult<u64> {
        self.check()?;
        let subjects: Vec<String> = self.subjects.iter().map(|s| s.key().clone()).collect();
        Ok(subjects
            .iter()
            .map(|subject| self.prune_subject(subject, |row| row.has_tag(tag)))
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn row(subject: &str, n: u8, tag: &str) -> ViewRow {
        let now = OffsetDateTime::now_utc();
        ViewRow {
            key: format!("authz:{subject}:{n}"),
            subject_id: subject.into(),
            tag: tag.into(),
            related_tags: Vec::new(),
            value: vec![n],
            computed_at: now,
            expires_at: now + time::Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn test_replace_is_whole_snapshot() {
        let view = InMemoryView::new();
        view.upsert(row("alice", 1, "file/f1")).await.unwrap();
        view.upsert(row("alice", 2, "file/f2")).await.unwrap();
        assert_eq!(view.subject_rows("alice").await.unwrap().len(), 2);

        view.replace_subject("alice", vec![row("alice", 3, "file/f3")])
            .await
            .unwrap();
        assert!(view.get("alice", "authz:alice:1").await.unwrap().is_none());
        assert!(view.get("alice", "authz:alice:3").await.unwrap().is_some());
        assert_eq!(view.row_count(), 1);
    }

    #[tokio::test]
    async fn test_readers_keep_old_snapshot() {
        let view = InMemoryView::new();
        view.upsert(row("alice", 1, "file/f1")).await.unwrap();
        let held = view.subjects.get("alice").map(|s| Arc::clone(s.value())).unwrap();
        view.replace_subject("alice", vec![row("alice", 2, "file/f2")])
            .await
            .unwrap();
        assert!(held.contains_key("authz:alice:1"));
        assert!(!held.contains_key("authz:alice:2"));
    }

    #[tokio::test]
    async fn test_deletes() {
        let view = InMemoryView::new();
        view.upsert(row("alice", 1, "file/f1")).await.unwrap();
        view.upsert(row("alice", 2, "file/f2")).await.unwrap();
        view.upsert(row("bob", 1, "file/f1")).await.unwrap();

        assert_eq!(view.delete_tag("file/f1").await.unwrap(), 2);
        assert_eq!(view.delete_matching("authz:alice:*").await.unwrap(), 1);
        assert_eq!(view.row_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_tag_matches_related_tags() {
        let view = InMemoryView::new();
        let mut child = row("alice", 1, "generation/g2");
        child.related_tags = vec!["generation/g1".into()];
        view.upsert(child).await.unwrap();
        view.upsert(row("alice", 2, "generation/g3")).await.unwrap();

        assert_eq!(view.delete_tag("generation/g1").await.unwrap(), 1);
        assert!(view.get("alice", "authz:alice:1").await.unwrap().is_none());
        assert_eq!(view.row_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let view = InMemoryView::new();
        view.set_available(false);
        assert!(view.get("alice", "k").await.is_err());
    }
}

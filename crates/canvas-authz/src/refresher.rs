//! Materialized-view refresher.
//!
//! Recomputes each active user's allow verdicts (owned resources, and
//! resources in projects of teams where their role suffices) and swaps them
//! into the view tier as one snapshot per subject.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use canvas_cache::error::with_timeout;
use canvas_cache::{
    MaterializedView, Operation, Outcome, Tier, TierError, TierLabel, TieredCacheManager, ViewRow,
};
use canvas_core::{AuthorizationVerdict, CacheKey, CoreError, GrantPath, Permission, ResourceRef};
use canvas_store::{DynResourceStore, StoreError, StoreResult};
use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::AuthzConfig;

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    View(#[from] TierError),

    #[error("Failed to build view row: {0}")]
    Row(#[from] CoreError),

    #[error("Refresh cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshSummary {
    pub subjects: usize,
    pub rows_updated: usize,
    pub failures: usize,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefresherStats {
    pub cycles: u64,
    pub failures: u64,
    pub last_summary: Option<RefreshSummary>,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

pub struct ViewRefresher {
    store: DynResourceStore,
    cache: Arc<TieredCacheManager>,
    config: AuthzConfig,
    stats: Mutex<RefresherStats>,
}

impl ViewRefresher {
    pub fn new(store: DynResourceStore, cache: Arc<TieredCacheManager>, config: AuthzConfig) -> Self {
        Self {
            store,
            cache,
            config,
            stats: Mutex::new(RefresherStats::default()),
        }
    }

    fn view(&self) -> &Arc<dyn MaterializedView> {
        self.cache.view()
    }

    pub fn stats(&self) -> RefresherStats {
        self.stats.lock().clone()
    }

    /// Rebuild one subject's rows. Returns how many rows changed outcome.
    pub async fn refresh_for_subject(&self, subject_id: &str) -> Result<usize, RefreshError> {
        let started = Instant::now();
        let result = self.rebuild_subject(subject_id).await;
        let outcome = match &result {
            Ok(_) => Outcome::Ok,
            Err(_) => Outcome::Error,
        };
        self.cache.monitor().record(
            Operation::ViewRefresh,
            TierLabel::Materialized,
            outcome,
            started.elapsed(),
        );
        result
    }

    async fn rebuild_subject(&self, subject_id: &str) -> Result<usize, RefreshError> {
        let now = OffsetDateTime::now_utc();
        let rows = self.compute_rows(subject_id, now).await?;

        let l3_timeout = self.cache.config().l3_timeout();
        let previous = match with_timeout(
            Tier::Materialized,
            l3_timeout,
            self.view().subject_rows(subject_id),
        )
        .await
        {
            Ok(previous) => previous,
            Err(e) => {
                tracing::debug!(subject_id = %subject_id, error = %e, "could not read previous view rows");
                Vec::new()
            }
        };
        let changed = count_changed(&previous, &rows);
        let row_count = rows.len();

        with_timeout(
            Tier::Materialized,
            l3_timeout,
            self.view().replace_subject(subject_id, rows),
        )
        .await?;

        tracing::debug!(subject_id = %subject_id, rows = row_count, changed, "view rows refreshed");
        Ok(changed)
    }

    async fn compute_rows(
        &self,
        subject_id: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<ViewRow>, RefreshError> {
        let lifetime = self.cache.config().l3_default_ttl();
        let mut verdicts: HashMap<CacheKey, AuthorizationVerdict> = HashMap::new();
        let mut push = |resource: &ResourceRef, permission: Permission, path: GrantPath| -> Result<(), CoreError> {
            let key = CacheKey::new(subject_id, resource, permission)?;
            verdicts.entry(key).or_insert_with(|| {
                AuthorizationVerdict::allow(subject_id, resource, permission, path, lifetime.as_secs())
                    .with_resolved_at(now)
            });
            Ok(())
        };

        // Ownership first: it takes precedence over any team grant.
        let owned = self
            .bounded("list_resources_owned_by", self.store.list_resources_owned_by(subject_id))
            .await?;
        for record in &owned {
            for permission in Permission::ALL {
                push(&record.resource, permission, GrantPath::DirectOwner)?;
            }
        }

        let memberships = self
            .bounded(
                "list_memberships_for_user",
                self.store.list_memberships_for_user(subject_id),
            )
            .await?;
        for membership in memberships {
            let Some(role) = membership.effective_role() else {
                continue;
            };
            let projects = self
                .bounded(
                    "list_projects_for_team",
                    self.store.list_projects_for_team(&membership.team_id),
                )
                .await?;
            for project in projects {
                let resources = self
                    .bounded(
                        "list_resources_in_project",
                        self.store.list_resources_in_project(&project.id),
                    )
                    .await?;
                for record in &resources {
                    for permission in self.config.policy.permissions_for(role) {
                        push(&record.resource, permission, GrantPath::TeamRole)?;
                    }
                }
            }
        }

        let expires_at = now
            .checked_add(time::Duration::try_from(lifetime).unwrap_or(time::Duration::ZERO))
            .unwrap_or(now);
        verdicts
            .into_iter()
            .map(|(key, verdict)| {
                Ok(ViewRow {
                    key: key.as_str().to_string(),
                    subject_id: subject_id.to_string(),
                    tag: key.tag(),
                    related_tags: Vec::new(),
                    value: verdict.encode()?,
                    computed_at: now,
                    expires_at,
                })
            })
            .collect()
    }

    /// Refresh every active user once.
    pub async fn refresh_all(&self) -> RefreshSummary {
        self.run_cycle(None).await
    }

    async fn run_cycle(&self, token: Option<&CancellationToken>) -> RefreshSummary {
        let started = Instant::now();
        let mut summary = RefreshSummary::default();

        if self.cache.is_closed() {
            summary.cancelled = true;
            return summary;
        }

        let subjects = match self
            .bounded("list_active_users", self.store.list_active_users())
            .await
        {
            Ok(subjects) => subjects,
            Err(e) => {
                tracing::warn!(error = %e, "view refresh could not list active users");
                summary.failures = 1;
                summary.duration = started.elapsed();
                self.finish_cycle(&summary);
                return summary;
            }
        };

        for subject_id in &subjects {
            if token.is_some_and(CancellationToken::is_cancelled) {
                summary.cancelled = true;
                break;
            }
            match self.refresh_for_subject(subject_id).await {
                Ok(changed) => {
                    summary.subjects += 1;
                    summary.rows_updated += changed;
                }
                Err(e) => {
                    tracing::warn!(subject_id = %subject_id, error = %e, "view refresh failed for subject");
                    summary.failures += 1;
                }
            }
        }

        summary.duration = started.elapsed();
        self.finish_cycle(&summary);
        summary
    }

    fn finish_cycle(&self, summary: &RefreshSummary) {
        {
            let mut stats = self.stats.lock();
            stats.cycles += 1;
            stats.failures += summary.failures as u64;
            stats.last_summary = Some(summary.clone());
        }
        tracing::info!(
            subjects = summary.subjects,
            rows_updated = summary.rows_updated,
            failures = summary.failures,
            duration_ms = summary.duration.as_millis() as u64,
            cancelled = summary.cancelled,
            "view refresh cycle finished"
        );
    }

    /// Refresh on `l3_refresh_interval_seconds` until `token` is cancelled.
    /// The first cycle starts immediately.
    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let refresher = Arc::clone(self);
        let interval = self.cache.config().l3_refresh_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        refresher.run_cycle(Some(&token)).await;
                    }
                }
            }
            tracing::info!("View refresher stopped");
        })
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl std::future::Future<Output = StoreResult<T>>,
    ) -> Result<T, RefreshError> {
        let timeout = self.config.store_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::timeout(operation, timeout.as_millis() as u64).into()),
        }
    }
}

impl std::fmt::Debug for ViewRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewRefresher")
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

/// Rows added, removed, or whose decision or grant path differs.
fn count_changed(previous: &[ViewRow], current: &[ViewRow]) -> usize {
    let decode = |row: &ViewRow| AuthorizationVerdict::decode(&row.value).ok();
    let before: HashMap<&str, _> = previous
        .iter()
        .map(|row| (row.key.as_str(), decode(row)))
        .collect();
    let after: HashMap<&str, _> = current
        .iter()
        .map(|row| (row.key.as_str(), decode(row)))
        .collect();

    // Rows that fail to decode always count as changed.
    let changed = after
        .iter()
        .filter(|(key, verdict)| match (before.get(*key), verdict) {
            (Some(Some(old)), Some(new)) => !old.same_outcome(new),
            _ => true,
        })
        .count();
    let removed = before.keys().filter(|key| !after.contains_key(*key)).count();
    changed + removed
}

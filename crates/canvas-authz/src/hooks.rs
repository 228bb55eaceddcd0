//! Resource Store change hooks.
//!
//! Maps each [`StoreChange`] onto cache invalidations for the affected
//! subjects or resources, then asks the refresher to rebuild the view rows
//! of subjects whose grants moved. A resource invalidation also reaches
//! verdicts inherited from that resource.

use std::sync::Arc;

use canvas_cache::TieredCacheManager;
use canvas_core::{KEY_PREFIX, ResourceRef};
use canvas_store::{DynResourceStore, StoreChange};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::refresher::ViewRefresher;

pub struct InvalidationHooks {
    store: DynResourceStore,
    cache: Arc<TieredCacheManager>,
    refresher: Option<Arc<ViewRefresher>>,
}

impl InvalidationHooks {
    pub fn new(store: DynResourceStore, cache: Arc<TieredCacheManager>) -> Self {
        Self {
            store,
            cache,
            refresher: None,
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<ViewRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Apply one change. Local-tier entries are gone when this returns.
    pub async fn apply(&self, change: &StoreChange) {
        tracing::debug!(kind = change.kind(), "applying store change");
        match change {
            StoreChange::MembershipAdded { user_id, .. }
            | StoreChange::RoleChanged { user_id, .. }
            | StoreChange::MembershipRemoved { user_id, .. } => {
                self.cache.invalidate_for_subject(user_id);
            }
            StoreChange::ProjectVisibilityChanged { project_id, .. } => {
                self.invalidate_project(project_id).await;
            }
            StoreChange::OwnershipTransferred { resource, .. }
            | StoreChange::ResourceDeleted { resource, .. } => {
                self.cache.invalidate_resource(resource);
            }
        }
        for subject_id in change.affected_subjects() {
            self.refresh(subject_id).await;
        }
    }

    async fn invalidate_project(&self, project_id: &str) {
        self.cache.invalidate_resource(&ResourceRef::project(project_id));
        match self.store.list_resources_in_project(project_id).await {
            Ok(resources) => {
                for record in &resources {
                    self.cache.invalidate_resource(&record.resource);
                }
                tracing::debug!(
                    project_id = %project_id,
                    resources = resources.len(),
                    "project visibility change invalidated"
                );
            }
            Err(e) => {
                tracing::warn!(
                    project_id = %project_id,
                    error = %e,
                    "could not list project resources, flushing all verdicts"
                );
                self.flush_all();
            }
        }
    }

    async fn refresh(&self, subject_id: &str) {
        let Some(refresher) = &self.refresher else {
            return;
        };
        // Pending slow-tier deletes for this subject must land before the
        // new rows are written, or they would remove them.
        self.cache.wait_for_background_tasks().await;
        if let Err(e) = refresher.refresh_for_subject(subject_id).await {
            tracing::warn!(subject_id = %subject_id, error = %e, "on-demand view refresh failed");
        }
    }

    fn flush_all(&self) -> usize {
        self.cache.invalidate(&format!("{KEY_PREFIX}:*"))
    }

    /// Consume store changes until `token` is cancelled or the store goes away.
    pub async fn run(&self, token: CancellationToken) {
        self.consume(self.store.subscribe(), token).await;
    }

    /// Subscribe now and run in the background.
    ///
    /// The subscription is taken before this returns, so no change made
    /// afterwards is missed.
    pub fn spawn(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let hooks = Arc::clone(self);
        let changes = self.store.subscribe();
        tokio::spawn(async move { hooks.consume(changes, token).await })
    }

    async fn consume(&self, mut changes: broadcast::Receiver<StoreChange>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = changes.recv() => match received {
                    Ok(change) => self.apply(&change).await,
                    Err(RecvError::Lagged(missed)) => {
                        let flushed = self.flush_all();
                        tracing::warn!(missed, flushed, "store change stream lagged, flushed all verdicts");
                    }
                    Err(RecvError::Closed) => {
                        tracing::info!("Store change stream closed");
                        break;
                    }
                },
            }
        }
        tracing::info!("Invalidation hooks stopped");
    }
}

impl std::fmt::Debug for InvalidationHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationHooks")
            .field("refresher", &self.refresher.is_some())
            .finish()
    }
}

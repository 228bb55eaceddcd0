//! Process-wide wiring of the authorization stack.
//!
//! One [`AuthzRuntime`] is built at startup and handed to everything that
//! needs to authorize. It owns the background tasks (view refresher, store
//! change hooks, cross-instance invalidation listener, local-tier
//! maintenance) and tears them down in [`AuthzRuntime::close`].

use std::sync::Arc;

use canvas_authz::{AuthorizationEvaluator, InvalidationHooks, ViewRefresher};
use canvas_cache::{Alert, AlertSink, AlertState, PerformanceMonitor, TieredCacheManager};
use canvas_store::DynResourceStore;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;

pub struct AuthzRuntime {
    store: DynResourceStore,
    cache: Arc<TieredCacheManager>,
    evaluator: Arc<AuthorizationEvaluator>,
    refresher: Arc<ViewRefresher>,
    hooks: Arc<InvalidationHooks>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AuthzRuntime {
    /// Build the stack against `store` and start its background tasks.
    ///
    /// A configured but unreachable Redis endpoint degrades to in-process
    /// tiers instead of failing startup.
    pub async fn start(cfg: &AppConfig, store: DynResourceStore) -> Self {
        let monitor = Arc::new(PerformanceMonitor::new(cfg.monitor.clone()));
        monitor.set_alert_sink(log_alerts());

        let cache = Arc::new(TieredCacheManager::connect(cfg.cache.clone(), monitor).await);
        let evaluator = Arc::new(AuthorizationEvaluator::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            cfg.authz.clone(),
        ));
        let refresher = Arc::new(ViewRefresher::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            cfg.authz.clone(),
        ));
        let hooks = Arc::new(
            InvalidationHooks::new(Arc::clone(&store), Arc::clone(&cache))
                .with_refresher(Arc::clone(&refresher)),
        );

        let token = CancellationToken::new();
        let mut tasks = vec![
            hooks.spawn(token.child_token()),
            refresher.spawn(token.child_token()),
            cache.spawn_maintenance(cfg.maintenance_interval(), token.child_token()),
        ];
        if let Some(listener) = cache.invalidation_listener() {
            tasks.push(listener.spawn(token.child_token()));
        }

        tracing::info!(
            distributed = cache.distributed().backend(),
            view = cache.view().backend(),
            background_tasks = tasks.len(),
            "Authorization runtime started"
        );

        Self {
            store,
            cache,
            evaluator,
            refresher,
            hooks,
            token,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn store(&self) -> &DynResourceStore {
        &self.store
    }

    pub fn cache(&self) -> &Arc<TieredCacheManager> {
        &self.cache
    }

    pub fn evaluator(&self) -> &Arc<AuthorizationEvaluator> {
        &self.evaluator
    }

    pub fn refresher(&self) -> &Arc<ViewRefresher> {
        &self.refresher
    }

    pub fn hooks(&self) -> &Arc<InvalidationHooks> {
        &self.hooks
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop background tasks, then close the cache. In-flight refresh writes
    /// finish before the tiers are released. Idempotent.
    pub async fn close(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
        self.cache.close().await;
        tracing::info!("Authorization runtime closed");
    }
}

impl std::fmt::Debug for AuthzRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthzRuntime")
            .field("cache", &self.cache)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn log_alerts() -> AlertSink {
    Arc::new(|alert: &Alert| match alert.state {
        AlertState::Degraded => {
            tracing::warn!(reasons = ?alert.reasons, "authorization cache degraded");
        }
        AlertState::Healthy => {
            tracing::info!("authorization cache healthy again");
        }
    })
}

//! End-to-end authorization behaviour over in-process tiers and store.

use std::sync::Arc;
use std::time::Duration;

use canvas_authz::{AuthorizationEvaluator, AuthzConfig, AuthzError, InvalidationHooks, ViewRefresher};
use canvas_cache::{
    BreakerState, CacheConfig, DistributedTier, InMemoryDistributedTier, InMemoryView,
    MaterializedView, Tier, TieredCacheManager,
};
use canvas_core::{CacheKey, Decision, GrantPath, Permission, ProjectRecord, ResourceRecord, ResourceRef, Role, Visibility};
use canvas_store::{InMemoryResourceStore, ResourceStore};
use tokio::time::Instant;

struct Harness {
    store: Arc<InMemoryResourceStore>,
    l2: Arc<InMemoryDistributedTier>,
    view: Arc<InMemoryView>,
    cache: Arc<TieredCacheManager>,
    evaluator: AuthorizationEvaluator,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(CacheConfig::default(), AuthzConfig::default())
    }

    fn with_config(cache_config: CacheConfig, authz_config: AuthzConfig) -> Self {
        let store = Arc::new(InMemoryResourceStore::new());
        let l2 = Arc::new(InMemoryDistributedTier::new());
        let view = Arc::new(InMemoryView::new());
        let cache = Arc::new(
            TieredCacheManager::builder(cache_config)
                .distributed(l2.clone())
                .view(view.clone())
                .build(),
        );
        let evaluator = AuthorizationEvaluator::new(store.clone(), Arc::clone(&cache), authz_config);
        Self {
            store,
            l2,
            view,
            cache,
            evaluator,
        }
    }

    fn hooks(&self) -> InvalidationHooks {
        InvalidationHooks::new(self.store.clone(), Arc::clone(&self.cache))
    }

    fn refresher(&self) -> Arc<ViewRefresher> {
        Arc::new(ViewRefresher::new(
            self.store.clone(),
            Arc::clone(&self.cache),
            AuthzConfig::default(),
        ))
    }

    /// Team T owns project P, which contains generation G2. B is a viewer.
    fn seed_team(&self) {
        self.store
            .put_project(ProjectRecord::new("p", "owner").owned_by_team("t"));
        self.store.put_resource(
            ResourceRecord::new(ResourceRef::generation("g2"), "owner").in_project("p"),
        );
        self.store.add_membership("t", "user-b", Role::Viewer);
    }

    async fn cached_tier(&self, subject: &str, resource: &ResourceRef, permission: Permission) -> Option<Tier> {
        let key = CacheKey::new(subject, resource, permission).unwrap();
        self.cache.get(&key).await.map(|hit| hit.tier)
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_owner_reads_own_generation_on_miss_and_hit() {
    let h = Harness::new();
    h.store
        .put_resource(ResourceRecord::new(ResourceRef::generation("g"), "user-a"));

    let first = h
        .evaluator
        .authorize("user-a", "g", "generation", "read")
        .await
        .unwrap();
    assert_eq!(first.decision, Decision::Allow);
    assert_eq!(first.grant_path, GrantPath::DirectOwner);

    let reads = h.store.read_count();
    let second = h
        .evaluator
        .authorize("user-a", "g", "generation", "read")
        .await
        .unwrap();
    assert_eq!(second, first);
    assert_eq!(h.store.read_count(), reads, "second call must not reach the store");
}

#[tokio::test]
async fn test_viewer_cannot_delete_team_generation() {
    let h = Harness::new();
    h.seed_team();

    let verdict = h
        .evaluator
        .authorize("user-b", "g2", "generation", "delete")
        .await
        .unwrap();
    assert_eq!(verdict.decision, Decision::Deny);
    assert_eq!(verdict.grant_path, GrantPath::None);
}

#[tokio::test]
async fn test_upgrade_to_editor_allows_delete_after_invalidation() {
    let h = Harness::new();
    h.seed_team();
    let hooks = h.hooks();
    let mut changes = h.store.subscribe();

    let denied = h
        .evaluator
        .authorize("user-b", "g2", "generation", "delete")
        .await
        .unwrap();
    assert!(!denied.is_allowed());

    h.store.change_role("t", "user-b", Role::Editor).unwrap();
    hooks.apply(&changes.recv().await.unwrap()).await;

    let verdict = h
        .evaluator
        .authorize("user-b", "g2", "generation", "delete")
        .await
        .unwrap();
    assert_eq!(verdict.decision, Decision::Allow);
    assert_eq!(verdict.grant_path, GrantPath::TeamRole);
}

#[tokio::test]
async fn test_public_project_grants_read_only() {
    let h = Harness::new();
    h.store
        .put_project(ProjectRecord::new("p3", "owner").with_visibility(Visibility::Public));
    h.store.put_resource(
        ResourceRecord::new(ResourceRef::generation("g3"), "owner").in_project("p3"),
    );

    let read = h
        .evaluator
        .authorize("user-c", "g3", "generation", "read")
        .await
        .unwrap();
    assert_eq!(read.decision, Decision::Allow);
    assert_eq!(read.grant_path, GrantPath::ProjectVisibility);

    let delete = h
        .evaluator
        .authorize("user-c", "g3", "generation", "delete")
        .await
        .unwrap();
    assert_eq!(delete.decision, Decision::Deny);
    assert_eq!(delete.grant_path, GrantPath::None);
}

#[tokio::test]
async fn test_parent_ownership_is_inherited() {
    let h = Harness::with_config(
        CacheConfig::default(),
        AuthzConfig {
            max_inheritance_depth: 1,
            ..Default::default()
        },
    );
    h.store
        .put_resource(ResourceRecord::new(ResourceRef::generation("g3"), "user-d"));
    h.store.put_resource(
        ResourceRecord::new(ResourceRef::generation("g4"), "someone-else")
            .with_parent(ResourceRef::generation("g3")),
    );

    let verdict = h
        .evaluator
        .authorize("user-d", "g4", "generation", "read")
        .await
        .unwrap();
    assert_eq!(verdict.decision, Decision::Allow);
    assert_eq!(verdict.grant_path, GrantPath::Inherited);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_skips_distributed_tier() {
    let h = Harness::with_config(
        CacheConfig {
            l2_failure_threshold: 3,
            l2_timeout_ms: 50,
            ..CacheConfig::default()
        },
        AuthzConfig::default(),
    );
    h.store
        .put_resource(ResourceRecord::new(ResourceRef::generation("g"), "user-a"));
    h.l2.set_available(false);
    h.l2.set_latency(Duration::from_secs(10));

    for n in 0..3 {
        let key = CacheKey::new("user-x", &ResourceRef::file(format!("f{n}")), Permission::Read).unwrap();
        assert!(h.cache.get(&key).await.is_none());
    }
    assert_eq!(h.cache.breaker_state(), BreakerState::Open);
    let calls = h.l2.call_count();

    let started = Instant::now();
    let verdict = h
        .evaluator
        .authorize("user-a", "g", "generation", "read")
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(verdict.grant_path, GrantPath::DirectOwner);
    assert_eq!(h.l2.call_count(), calls, "open breaker must not touch the tier");
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_falls_back_to_view_tier() {
    let h = Harness::with_config(
        CacheConfig {
            l2_failure_threshold: 1,
            ..CacheConfig::default()
        },
        AuthzConfig::default(),
    );
    h.seed_team();
    h.refresher().refresh_for_subject("user-b").await.unwrap();

    h.l2.set_available(false);
    let probe = CacheKey::new("probe", &ResourceRef::file("x"), Permission::Read).unwrap();
    assert!(h.cache.get(&probe).await.is_none());
    assert_eq!(h.cache.breaker_state(), BreakerState::Open);

    // The store is gone too; only the view tier can answer.
    h.store.set_available(false);
    let verdict = h
        .evaluator
        .authorize("user-b", "g2", "generation", "read")
        .await
        .unwrap();
    assert_eq!(verdict.grant_path, GrantPath::TeamRole);
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn test_unreachable_store_never_allows() {
    let h = Harness::new();
    h.seed_team();
    h.store
        .put_resource(ResourceRecord::new(ResourceRef::generation("g"), "user-a"));
    h.store.set_available(false);

    for (subject, resource) in [("user-a", "g"), ("user-b", "g2"), ("user-c", "g2")] {
        for permission in Permission::ALL {
            let result = h
                .evaluator
                .authorize(subject, resource, "generation", permission.as_str())
                .await;
            let err = result.expect_err("store outage must not produce a verdict");
            assert!(err.is_indeterminate());
            assert!(err.is_denial_equivalent());
        }
    }
}

#[tokio::test]
async fn test_downgrade_never_serves_old_allow() {
    let h = Harness::new();
    h.seed_team();
    h.store.change_role("t", "user-b", Role::Editor).unwrap();
    let hooks = h.hooks();
    let mut changes = h.store.subscribe();

    let allowed = h
        .evaluator
        .authorize("user-b", "g2", "generation", "delete")
        .await
        .unwrap();
    assert!(allowed.is_allowed());

    h.store.change_role("t", "user-b", Role::Viewer).unwrap();
    hooks.apply(&changes.recv().await.unwrap()).await;

    let verdict = h
        .evaluator
        .authorize("user-b", "g2", "generation", "delete")
        .await
        .unwrap();
    assert_eq!(verdict.decision, Decision::Deny);

    // Once the background deletes land, no slower tier still holds the allow.
    h.cache.wait_for_background_tasks().await;
    h.cache.local().clear();
    let verdict = h
        .evaluator
        .authorize("user-b", "g2", "generation", "delete")
        .await
        .unwrap();
    assert_eq!(verdict.decision, Decision::Deny);
}

#[tokio::test]
async fn test_same_verdict_from_every_tier() {
    let h = Harness::new();
    h.store
        .put_resource(ResourceRecord::new(ResourceRef::file("f"), "user-a"));
    let resource = ResourceRef::file("f");

    let computed = h
        .evaluator
        .authorize("user-a", "f", "file", "share")
        .await
        .unwrap();

    assert_eq!(h.cached_tier("user-a", &resource, Permission::Share).await, Some(Tier::Local));
    let from_local = h.evaluator.authorize("user-a", "f", "file", "share").await.unwrap();

    h.cache.local().clear();
    assert_eq!(
        h.cached_tier("user-a", &resource, Permission::Share).await,
        Some(Tier::Distributed)
    );
    h.cache.local().clear();
    let from_distributed = h.evaluator.authorize("user-a", "f", "file", "share").await.unwrap();

    h.cache.local().clear();
    h.l2.delete_matching("authz:*").await.unwrap();
    assert_eq!(
        h.cached_tier("user-a", &resource, Permission::Share).await,
        Some(Tier::Materialized)
    );
    h.cache.local().clear();
    h.cache.wait_for_background_tasks().await;
    h.l2.delete_matching("authz:*").await.unwrap();
    let from_view = h.evaluator.authorize("user-a", "f", "file", "share").await.unwrap();

    assert_eq!(from_local, computed);
    assert_eq!(from_distributed, computed);
    assert_eq!(from_view, computed);
}

#[tokio::test]
async fn test_owner_precedence_over_team_denial() {
    let h = Harness::new();
    h.seed_team();
    h.store.put_resource(
        ResourceRecord::new(ResourceRef::generation("own"), "user-b").in_project("p"),
    );

    let verdict = h
        .evaluator
        .authorize("user-b", "own", "generation", "manage")
        .await
        .unwrap();
    assert_eq!(verdict.grant_path, GrantPath::DirectOwner);
}

#[tokio::test]
async fn test_membership_hook_refreshes_view() {
    let h = Harness::new();
    h.seed_team();
    let hooks = h.hooks().with_refresher(h.refresher());
    let mut changes = h.store.subscribe();

    h.store.add_membership("t", "user-e", Role::Contributor);
    hooks.apply(&changes.recv().await.unwrap()).await;

    let key = CacheKey::new("user-e", &ResourceRef::generation("g2"), Permission::Write).unwrap();
    let row = h.view.get("user-e", key.as_str()).await.unwrap();
    assert!(row.is_some());
}

#[tokio::test]
async fn test_transfer_moves_ownership_grant() {
    let h = Harness::new();
    h.store
        .put_resource(ResourceRecord::new(ResourceRef::file("f"), "user-a"));
    let hooks = h.hooks();
    let mut changes = h.store.subscribe();

    assert!(h.evaluator.authorize("user-a", "f", "file", "manage").await.unwrap().is_allowed());
    assert!(!h.evaluator.authorize("user-c", "f", "file", "manage").await.unwrap().is_allowed());

    h.store
        .transfer_ownership(&ResourceRef::file("f"), "user-c")
        .unwrap();
    hooks.apply(&changes.recv().await.unwrap()).await;

    assert!(!h.evaluator.authorize("user-a", "f", "file", "manage").await.unwrap().is_allowed());
    assert!(h.evaluator.authorize("user-c", "f", "file", "manage").await.unwrap().is_allowed());
}

// =============================================================================
// Inherited verdicts follow their ancestors
// =============================================================================

/// D owns G3; G4 sits under G3 and is owned by someone else.
fn seed_inherited(h: &Harness) {
    h.store
        .put_resource(ResourceRecord::new(ResourceRef::generation("g3"), "user-d"));
    h.store.put_resource(
        ResourceRecord::new(ResourceRef::generation("g4"), "someone-else")
            .with_parent(ResourceRef::generation("g3")),
    );
}

#[tokio::test]
async fn test_parent_transfer_revokes_inherited_allow() {
    let h = Harness::new();
    seed_inherited(&h);
    let hooks = h.hooks();
    let mut changes = h.store.subscribe();

    let before = h.evaluator.authorize("user-d", "g4", "generation", "read").await.unwrap();
    assert_eq!(before.grant_path, GrantPath::Inherited);
    assert_eq!(
        h.cached_tier("user-d", &ResourceRef::generation("g4"), Permission::Read).await,
        Some(Tier::Local)
    );

    h.store
        .transfer_ownership(&ResourceRef::generation("g3"), "user-e")
        .unwrap();
    hooks.apply(&changes.recv().await.unwrap()).await;
    h.cache.wait_for_background_tasks().await;

    assert_eq!(
        h.cached_tier("user-d", &ResourceRef::generation("g4"), Permission::Read).await,
        None
    );
    let after = h.evaluator.authorize("user-d", "g4", "generation", "read").await.unwrap();
    assert_eq!(after.decision, Decision::Deny);
    assert_eq!(after.grant_path, GrantPath::None);

    let inherited = h.evaluator.authorize("user-e", "g4", "generation", "read").await.unwrap();
    assert_eq!(inherited.grant_path, GrantPath::Inherited);
}

#[tokio::test]
async fn test_parent_visibility_change_revokes_inherited_read() {
    let h = Harness::new();
    h.store
        .put_project(ProjectRecord::new("p", "owner").with_visibility(Visibility::Public));
    h.store.put_resource(
        ResourceRecord::new(ResourceRef::generation("parent"), "owner").in_project("p"),
    );
    h.store.put_resource(
        ResourceRecord::new(ResourceRef::generation("child"), "owner")
            .with_parent(ResourceRef::generation("parent")),
    );
    let hooks = h.hooks();
    let mut changes = h.store.subscribe();

    let before = h.evaluator.authorize("user-c", "child", "generation", "read").await.unwrap();
    assert_eq!(before.grant_path, GrantPath::Inherited);

    h.store.set_project_visibility("p", Visibility::Private).unwrap();
    hooks.apply(&changes.recv().await.unwrap()).await;
    h.cache.wait_for_background_tasks().await;

    let key = CacheKey::new("user-c", &ResourceRef::generation("child"), Permission::Read).unwrap();
    assert!(!h.l2.contains(key.as_str()));
    let after = h.evaluator.authorize("user-c", "child", "generation", "read").await.unwrap();
    assert_eq!(after.decision, Decision::Deny);
}

#[tokio::test]
async fn test_parent_deletion_recomputes_child_verdict() {
    let h = Harness::new();
    seed_inherited(&h);
    let hooks = h.hooks();
    let mut changes = h.store.subscribe();

    assert!(h.evaluator.authorize("user-d", "g4", "generation", "read").await.unwrap().is_allowed());
    assert!(h.evaluator.authorize("user-d", "g3", "generation", "read").await.unwrap().is_allowed());

    h.store.delete_resource(&ResourceRef::generation("g3")).unwrap();
    hooks.apply(&changes.recv().await.unwrap()).await;
    h.cache.wait_for_background_tasks().await;

    assert_eq!(h.view.row_count(), 0);
    let child = h.evaluator.authorize("user-d", "g4", "generation", "read").await.unwrap();
    assert_eq!(child.decision, Decision::Deny);
    let err = h
        .evaluator
        .authorize("user-d", "g3", "generation", "read")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthzError::ResourceNotFound { .. }));
}

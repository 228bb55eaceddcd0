//! Authorization decision evaluator.
//!
//! Every check asks the tiered cache first. On a miss the rules run against
//! the Resource Store in fixed order, first match wins:
//!
//! 1. direct ownership
//! 2. team role meets the permission's minimum
//! 3. public project and read-only permission
//! 4. the same rules on the parent chain, up to `max_inheritance_depth`
//! 5. deny
//!
//! The verdict is written through the cache before it is returned, tagged
//! with every ancestor the chain walk read so that a change to any of them
//! drops it.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use canvas_cache::{Operation, Outcome, PerformanceMonitor, TierLabel, TieredCacheManager};
use canvas_core::{
    AuthorizationVerdict, CacheKey, GrantPath, Permission, ResourceRecord, ResourceRef, Visibility,
};
use canvas_store::{DynResourceStore, StoreError, StoreResult};
use futures_util::future::join_all;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::config::AuthzConfig;
use crate::error::{AuthzError, AuthzResult};
use crate::policy::PermissionPolicy;

pub struct AuthorizationEvaluator {
    store: DynResourceStore,
    cache: Arc<TieredCacheManager>,
    config: AuthzConfig,
}

impl AuthorizationEvaluator {
    pub fn new(store: DynResourceStore, cache: Arc<TieredCacheManager>, config: AuthzConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &AuthzConfig {
        &self.config
    }

    pub fn policy(&self) -> &PermissionPolicy {
        &self.config.policy
    }

    pub fn cache(&self) -> &Arc<TieredCacheManager> {
        &self.cache
    }

    fn monitor(&self) -> &Arc<PerformanceMonitor> {
        self.cache.monitor()
    }

    /// Check `permission` on a resource named by its string type.
    ///
    /// Denial is an `Ok` verdict. Errors are malformed input or an
    /// unreachable store with nothing cached; both mean "denied".
    pub async fn authorize(
        &self,
        subject_id: &str,
        resource_id: &str,
        resource_type: &str,
        permission: &str,
    ) -> AuthzResult<AuthorizationVerdict> {
        let resource = ResourceRef::parse(resource_type, resource_id)?;
        let permission: Permission = permission.parse()?;
        self.authorize_ref(subject_id, &resource, permission).await
    }

    pub async fn authorize_ref(
        &self,
        subject_id: &str,
        resource: &ResourceRef,
        permission: Permission,
    ) -> AuthzResult<AuthorizationVerdict> {
        let started = Instant::now();
        let key = CacheKey::new(subject_id, resource, permission)?;

        if let Some(hit) = self.cache.get(&key).await {
            match AuthorizationVerdict::decode(&hit.value) {
                Ok(verdict) if self.answers(&verdict, &key) => {
                    self.monitor().record(
                        Operation::Authorize,
                        hit.tier.into(),
                        Outcome::Hit,
                        started.elapsed(),
                    );
                    return Ok(verdict);
                }
                Ok(_) => {
                    tracing::debug!(key = %key, tier = %hit.tier, "cached verdict unusable, recomputing");
                }
                Err(e) => {
                    tracing::warn!(key = %key, tier = %hit.tier, error = %e, "cached verdict failed to decode");
                }
            }
        }

        let result = self.evaluate(subject_id, resource, permission).await;
        let (verdict, ancestors) = match result {
            Ok(evaluated) => evaluated,
            Err(e) => {
                self.monitor().record(
                    Operation::Authorize,
                    TierLabel::Store,
                    Outcome::Error,
                    started.elapsed(),
                );
                if e.is_indeterminate() {
                    tracing::warn!(
                        subject_id = %subject_id,
                        resource = %resource,
                        permission = %permission,
                        error = %e,
                        "authorization indeterminate"
                    );
                }
                return Err(e);
            }
        };

        match verdict.encode() {
            Ok(bytes) => {
                let ttl = Duration::from_secs(verdict.ttl_seconds);
                self.cache.set_with_related(&key, bytes, ttl, &ancestors).await;
            }
            Err(e) => tracing::warn!(key = %key, error = %e, "failed to encode verdict"),
        }

        self.monitor().record(
            Operation::Authorize,
            TierLabel::Store,
            Outcome::Miss,
            started.elapsed(),
        );
        tracing::debug!(
            subject_id = %subject_id,
            resource = %resource,
            permission = %permission,
            decision = ?verdict.decision,
            grant_path = %verdict.grant_path,
            "authorization computed"
        );
        Ok(verdict)
    }

    /// Check one permission on many resources concurrently, results in input
    /// order.
    pub async fn authorize_all(
        &self,
        subject_id: &str,
        resources: &[ResourceRef],
        permission: Permission,
    ) -> Vec<AuthzResult<AuthorizationVerdict>> {
        join_all(
            resources
                .iter()
                .map(|resource| self.authorize_ref(subject_id, resource, permission)),
        )
        .await
    }

    /// Drop everything cached for `subject_id`, for account-management flows.
    pub fn invalidate_for_subject(&self, subject_id: &str) -> usize {
        self.cache.invalidate_for_subject(subject_id)
    }

    /// A cached verdict is only served for the exact question and while live.
    fn answers(&self, verdict: &AuthorizationVerdict, key: &CacheKey) -> bool {
        verdict.subject_id == key.subject_id()
            && verdict.resource() == *key.resource()
            && verdict.permission == key.permission()
            && !verdict.is_expired_at(OffsetDateTime::now_utc())
    }

    // =========================================================================
    // Rules
    // =========================================================================

    /// Run the rules against the store, bypassing the cache.
    pub async fn evaluate_uncached(
        &self,
        subject_id: &str,
        resource: &ResourceRef,
        permission: Permission,
    ) -> AuthzResult<AuthorizationVerdict> {
        let (verdict, _) = self.evaluate(subject_id, resource, permission).await?;
        Ok(verdict)
    }

    /// The verdict plus the ancestors it was derived from.
    async fn evaluate(
        &self,
        subject_id: &str,
        resource: &ResourceRef,
        permission: Permission,
    ) -> AuthzResult<(AuthorizationVerdict, Vec<ResourceRef>)> {
        let started = Instant::now();
        let mut ancestors = Vec::new();
        let result = self
            .evaluate_chain(subject_id, resource, permission, &mut ancestors)
            .await;
        let outcome = if result.is_ok() {
            Outcome::Ok
        } else {
            Outcome::Error
        };
        self.monitor()
            .record(Operation::Evaluate, TierLabel::Store, outcome, started.elapsed());

        let path = result?;
        let verdict = match path {
            GrantPath::None => {
                AuthorizationVerdict::deny(subject_id, resource, permission, self.config.deny_ttl_seconds)
            }
            path => AuthorizationVerdict::allow(
                subject_id,
                resource,
                permission,
                path,
                self.config.allow_ttl_seconds,
            ),
        };
        Ok((verdict, ancestors))
    }

    /// The grant path that applies, `GrantPath::None` for a deny. Every parent
    /// looked up is pushed onto `ancestors`, found or not.
    async fn evaluate_chain(
        &self,
        subject_id: &str,
        resource: &ResourceRef,
        permission: Permission,
        ancestors: &mut Vec<ResourceRef>,
    ) -> AuthzResult<GrantPath> {
        let mut record = self
            .bounded("get_resource", self.store.get_resource(resource))
            .await?
            .ok_or_else(|| AuthzError::resource_not_found(resource.clone()))?;

        let mut visited = HashSet::new();
        visited.insert(resource.clone());
        let mut depth = 0u32;

        loop {
            if let Some(path) = self.direct_rules(subject_id, &record, permission).await? {
                return Ok(if depth == 0 { path } else { GrantPath::Inherited });
            }

            let Some(parent) = record.parent.clone() else {
                return Ok(GrantPath::None);
            };
            if depth >= self.config.max_inheritance_depth {
                tracing::debug!(resource = %resource, depth, "inheritance depth limit reached");
                return Ok(GrantPath::None);
            }
            if !visited.insert(parent.clone()) {
                tracing::warn!(resource = %resource, parent = %parent, "inheritance cycle");
                return Ok(GrantPath::None);
            }
            ancestors.push(parent.clone());
            match self
                .bounded("get_resource", self.store.get_resource(&parent))
                .await?
            {
                Some(next) => record = next,
                None => {
                    tracing::debug!(resource = %resource, parent = %parent, "parent record missing");
                    return Ok(GrantPath::None);
                }
            }
            depth += 1;
        }
    }

    /// Rules 1 to 3 on a single record.
    async fn direct_rules(
        &self,
        subject_id: &str,
        record: &ResourceRecord,
        permission: Permission,
    ) -> AuthzResult<Option<GrantPath>> {
        if record.owner_id == subject_id {
            return Ok(Some(GrantPath::DirectOwner));
        }

        let Some(project_id) = record.project_id.as_deref() else {
            return Ok(None);
        };
        let Some(project) = self
            .bounded("get_project", self.store.get_project(project_id))
            .await?
        else {
            return Ok(None);
        };

        if let Some(team_id) = project.team_id.as_deref() {
            let membership = self
                .bounded(
                    "get_team_membership",
                    self.store.get_team_membership(subject_id, team_id),
                )
                .await?;
            let role = membership.and_then(|m| m.effective_role());
            if let Some(role) = role {
                if self.config.policy.allows(role, permission) {
                    return Ok(Some(GrantPath::TeamRole));
                }
            }
        }

        if project.visibility == Visibility::Public && permission.is_read_only() {
            return Ok(Some(GrantPath::ProjectVisibility));
        }
        Ok(None)
    }

    /// A store call bounded by `store_timeout_ms`.
    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> AuthzResult<T> {
        let timeout = self.config.store_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::timeout(operation, timeout.as_millis() as u64).into()),
        }
    }
}

impl std::fmt::Debug for AuthorizationEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationEvaluator")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_cache::CacheConfig;
    use canvas_core::{Decision, ProjectRecord, Role};
    use canvas_store::InMemoryResourceStore;

    fn setup(config: AuthzConfig) -> (AuthorizationEvaluator, Arc<InMemoryResourceStore>) {
        let store = Arc::new(InMemoryResourceStore::new());
        let cache = Arc::new(TieredCacheManager::builder(CacheConfig::default()).build());
        let evaluator = AuthorizationEvaluator::new(store.clone(), cache, config);
        (evaluator, store)
    }

    #[tokio::test]
    async fn test_malformed_input() {
        let (evaluator, _) = setup(AuthzConfig::default());
        let err = evaluator
            .authorize("alice", "g1", "folder", "read")
            .await
            .unwrap_err();
        assert!(err.is_validation_error());

        let err = evaluator
            .authorize("alice", "g1", "generation", "admin")
            .await
            .unwrap_err();
        assert!(err.is_validation_error());

        let err = evaluator
            .authorize("", "g1", "generation", "read")
            .await
            .unwrap_err();
        assert!(err.is_validation_error());
    }

    #[tokio::test]
    async fn test_unknown_resource_is_not_found() {
        let (evaluator, _) = setup(AuthzConfig::default());
        let err = evaluator
            .authorize("alice", "missing", "generation", "read")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::ResourceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_owner_wins_over_team_role() {
        let (evaluator, store) = setup(AuthzConfig::default());
        store.put_project(ProjectRecord::new("p1", "bob").owned_by_team("t1"));
        store.put_resource(ResourceRecord::new(ResourceRef::generation("g1"), "alice").in_project("p1"));
        store.add_membership("t1", "alice", Role::Owner);

        let verdict = evaluator
            .evaluate_uncached("alice", &ResourceRef::generation("g1"), Permission::Manage)
            .await
            .unwrap();
        assert_eq!(verdict.grant_path, GrantPath::DirectOwner);
    }

    #[tokio::test]
    async fn test_inactive_membership_grants_nothing() {
        let (evaluator, store) = setup(AuthzConfig::default());
        store.put_project(ProjectRecord::new("p1", "bob").owned_by_team("t1"));
        store.put_resource(ResourceRecord::new(ResourceRef::generation("g1"), "bob").in_project("p1"));
        store.add_membership("t1", "carol", Role::Admin);
        store.remove_membership("t1", "carol").unwrap();

        let verdict = evaluator
            .evaluate_uncached("carol", &ResourceRef::generation("g1"), Permission::Read)
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Deny);
        assert_eq!(verdict.grant_path, GrantPath::None);
    }

    #[tokio::test]
    async fn test_inheritance_depth_limit() {
        let config = AuthzConfig {
            max_inheritance_depth: 1,
            ..Default::default()
        };
        let (evaluator, store) = setup(config);
        store.put_resource(ResourceRecord::new(ResourceRef::generation("root"), "dave"));
        store.put_resource(
            ResourceRecord::new(ResourceRef::generation("mid"), "x")
                .with_parent(ResourceRef::generation("root")),
        );
        store.put_resource(
            ResourceRecord::new(ResourceRef::generation("leaf"), "x")
                .with_parent(ResourceRef::generation("mid")),
        );

        let mid = evaluator
            .evaluate_uncached("dave", &ResourceRef::generation("mid"), Permission::Read)
            .await
            .unwrap();
        assert_eq!(mid.grant_path, GrantPath::Inherited);

        let leaf = evaluator
            .evaluate_uncached("dave", &ResourceRef::generation("leaf"), Permission::Read)
            .await
            .unwrap();
        assert_eq!(leaf.decision, Decision::Deny);
    }

    #[tokio::test]
    async fn test_inheritance_cycle_ends_in_deny() {
        let (evaluator, store) = setup(AuthzConfig::default());
        store.put_resource(
            ResourceRecord::new(ResourceRef::generation("a"), "x").with_parent(ResourceRef::generation("b")),
        );
        store.put_resource(
            ResourceRecord::new(ResourceRef::generation("b"), "y").with_parent(ResourceRef::generation("a")),
        );

        let verdict = evaluator
            .evaluate_uncached("dave", &ResourceRef::generation("a"), Permission::Read)
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Deny);
    }

    #[tokio::test]
    async fn test_inherited_verdict_is_tagged_with_ancestors() {
        let (evaluator, store) = setup(AuthzConfig::default());
        store.put_resource(ResourceRecord::new(ResourceRef::generation("root"), "dave"));
        store.put_resource(
            ResourceRecord::new(ResourceRef::generation("mid"), "x")
                .with_parent(ResourceRef::generation("root")),
        );
        store.put_resource(
            ResourceRecord::new(ResourceRef::generation("leaf"), "x")
                .with_parent(ResourceRef::generation("mid")),
        );
        let leaf = ResourceRef::generation("leaf");

        let verdict = evaluator
            .authorize_ref("dave", &leaf, Permission::Read)
            .await
            .unwrap();
        assert_eq!(verdict.grant_path, GrantPath::Inherited);
        assert_eq!(
            evaluator.cache().invalidate_resource(&ResourceRef::generation("root")),
            1
        );

        evaluator
            .authorize_ref("erin", &leaf, Permission::Read)
            .await
            .unwrap();
        assert_eq!(
            evaluator.cache().invalidate_resource(&ResourceRef::generation("mid")),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_parent_is_a_miss() {
        let (evaluator, store) = setup(AuthzConfig::default());
        store.put_resource(
            ResourceRecord::new(ResourceRef::generation("orphan"), "x")
                .with_parent(ResourceRef::generation("gone")),
        );
        let verdict = evaluator
            .evaluate_uncached("dave", &ResourceRef::generation("orphan"), Permission::Read)
            .await
            .unwrap();
        assert_eq!(verdict.decision, Decision::Deny);
    }

    #[tokio::test]
    async fn test_verdict_ttls() {
        let (evaluator, store) = setup(AuthzConfig::default());
        store.put_resource(ResourceRecord::new(ResourceRef::file("f1"), "alice"));

        let allow = evaluator
            .authorize("alice", "f1", "file", "write")
            .await
            .unwrap();
        let deny = evaluator.authorize("bob", "f1", "file", "write").await.unwrap();
        assert_eq!(allow.ttl_seconds, 60);
        assert_eq!(deny.ttl_seconds, 120);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_is_indeterminate() {
        let config = AuthzConfig {
            store_timeout_ms: 100,
            ..Default::default()
        };
        let (evaluator, store) = setup(config);
        store.put_resource(ResourceRecord::new(ResourceRef::file("f1"), "alice"));
        store.set_read_delay(Duration::from_secs(5));

        let err = evaluator
            .authorize("alice", "f1", "file", "read")
            .await
            .unwrap_err();
        assert!(err.is_indeterminate());
        assert!(err.to_string().contains("get_resource"));
    }

    #[tokio::test]
    async fn test_authorize_all_keeps_order() {
        let (evaluator, store) = setup(AuthzConfig::default());
        store.put_resource(ResourceRecord::new(ResourceRef::file("mine"), "alice"));
        store.put_resource(ResourceRecord::new(ResourceRef::file("theirs"), "bob"));

        let results = evaluator
            .authorize_all(
                "alice",
                &[
                    ResourceRef::file("mine"),
                    ResourceRef::file("theirs"),
                    ResourceRef::file("nope"),
                ],
                Permission::Read,
            )
            .await;
        assert!(results[0].as_ref().unwrap().is_allowed());
        assert!(!results[1].as_ref().unwrap().is_allowed());
        assert!(matches!(results[2], Err(AuthzError::ResourceNotFound { .. })));
    }
}

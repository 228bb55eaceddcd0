//! In-memory Resource Store.
//!
//! Backs local mode and tests. Mutations publish [`StoreChange`] events after
//! they are applied, and reads can be made to fail or stall to exercise the
//! fail-closed paths of the evaluator.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use canvas_core::{
    ProjectRecord, ResourceRecord, ResourceRef, Role, TeamMembership, Visibility,
};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::events::{ChangeNotifier, StoreChange};
use crate::traits::ResourceStore;

type MembershipKey = (String, String);

/// Thread-safe in-memory store built on `DashMap`.
#[derive(Debug, Default)]
pub struct InMemoryResourceStore {
    resources: DashMap<ResourceRef, ResourceRecord>,
    projects: DashMap<String, ProjectRecord>,
    /// Keyed by (team_id, user_id).
    memberships: DashMap<MembershipKey, TeamMembership>,
    notifier: ChangeNotifier,
    unavailable: AtomicBool,
    read_delay_ms: AtomicU64,
    reads: AtomicU64,
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Fault injection ====================

    /// Make every read fail with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay every read by `delay` before answering.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of read queries served so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    async fn before_read(&self) -> StoreResult<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("in-memory store marked unavailable"));
        }
        Ok(())
    }

    // ==================== Mutations ====================

    /// Insert or replace a resource. Replacing with a new owner announces a
    /// transfer.
    pub fn put_resource(&self, record: ResourceRecord) {
        let previous = self.resources.insert(record.resource.clone(), record.clone());
        if let Some(previous) = previous
            && previous.owner_id != record.owner_id
        {
            self.notifier.publish(StoreChange::OwnershipTransferred {
                resource: record.resource,
                from: previous.owner_id,
                to: record.owner_id,
            });
        }
    }

    /// Insert or replace a project and its own resource record.
    pub fn put_project(&self, project: ProjectRecord) {
        let mut resource = project.as_resource();
        if let Some(existing) = self.resources.get(&resource.resource) {
            resource.parent = existing.parent.clone();
        }
        self.put_resource(resource);

        let previous = self.projects.insert(project.id.clone(), project.clone());
        if let Some(previous) = previous
            && previous.visibility != project.visibility
        {
            self.notifier.publish(StoreChange::ProjectVisibilityChanged {
                project_id: project.id,
                visibility: project.visibility,
            });
        }
    }

    pub fn set_project_visibility(&self, project_id: &str, visibility: Visibility) -> StoreResult<()> {
        {
            let mut project = self
                .projects
                .get_mut(project_id)
                .ok_or_else(|| StoreError::not_found("project", project_id))?;
            if project.visibility == visibility {
                return Ok(());
            }
            project.visibility = visibility;
        }
        self.notifier.publish(StoreChange::ProjectVisibilityChanged {
            project_id: project_id.to_string(),
            visibility,
        });
        Ok(())
    }

    pub fn transfer_ownership(&self, resource: &ResourceRef, new_owner: &str) -> StoreResult<()> {
        let from = {
            let mut record = self
                .resources
                .get_mut(resource)
                .ok_or_else(|| StoreError::not_found("resource", resource.to_string()))?;
            if record.owner_id == new_owner {
                return Ok(());
            }
            std::mem::replace(&mut record.owner_id, new_owner.to_string())
        };
        if let Some(mut project) = self.projects.get_mut(&resource.id)
            && resource.resource_type == canvas_core::ResourceType::Project
        {
            project.owner_id = new_owner.to_string();
        }
        self.notifier.publish(StoreChange::OwnershipTransferred {
            resource: resource.clone(),
            from,
            to: new_owner.to_string(),
        });
        Ok(())
    }

    pub fn delete_resource(&self, resource: &ResourceRef) -> StoreResult<()> {
        let (_, record) = self
            .resources
            .remove(resource)
            .ok_or_else(|| StoreError::not_found("resource", resource.to_string()))?;
        if resource.resource_type == canvas_core::ResourceType::Project {
            self.projects.remove(&resource.id);
        }
        self.notifier.publish(StoreChange::ResourceDeleted {
            resource: resource.clone(),
            owner_id: record.owner_id,
        });
        Ok(())
    }

    /// Add a member, or reactivate a removed one with a new role.
    pub fn add_membership(&self, team_id: &str, user_id: &str, role: Role) {
        let key = (team_id.to_string(), user_id.to_string());
        self.memberships
            .insert(key, TeamMembership::new(team_id, user_id, role));
        self.notifier.publish(StoreChange::MembershipAdded {
            team_id: team_id.to_string(),
            user_id: user_id.to_string(),
            role,
        });
    }

    pub fn change_role(&self, team_id: &str, user_id: &str, new_role: Role) -> StoreResult<()> {
        let old_role = {
            let key = (team_id.to_string(), user_id.to_string());
            let mut membership = self
                .memberships
                .get_mut(&key)
                .filter(|m| m.is_active)
                .ok_or_else(|| StoreError::not_found("membership", format!("{team_id}/{user_id}")))?;
            if membership.role == new_role {
                return Ok(());
            }
            std::mem::replace(&mut membership.role, new_role)
        };
        debug!(team_id, user_id, %old_role, %new_role, "Role changed");
        self.notifier.publish(StoreChange::RoleChanged {
            team_id: team_id.to_string(),
            user_id: user_id.to_string(),
            old_role,
            new_role,
        });
        Ok(())
    }

    /// Soft-delete a membership.
    pub fn remove_membership(&self, team_id: &str, user_id: &str) -> StoreResult<()> {
        {
            let key = (team_id.to_string(), user_id.to_string());
            let mut membership = self
                .memberships
                .get_mut(&key)
                .ok_or_else(|| StoreError::not_found("membership", format!("{team_id}/{user_id}")))?;
            if !membership.is_active {
                return Ok(());
            }
            membership.is_active = false;
        }
        self.notifier.publish(StoreChange::MembershipRemoved {
            team_id: team_id.to_string(),
            user_id: user_id.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn get_resource(&self, resource: &ResourceRef) -> StoreResult<Option<ResourceRecord>> {
        self.before_read().await?;
        Ok(self.resources.get(resource).map(|r| r.clone()))
    }

    async fn get_project(&self, project_id: &str) -> StoreResult<Option<ProjectRecord>> {
        self.before_read().await?;
        Ok(self.projects.get(project_id).map(|p| p.clone()))
    }

    async fn get_team_membership(
        &self,
        user_id: &str,
        team_id: &str,
    ) -> StoreResult<Option<TeamMembership>> {
        self.before_read().await?;
        let key = (team_id.to_string(), user_id.to_string());
        Ok(self.memberships.get(&key).map(|m| m.clone()))
    }

    async fn list_active_users(&self) -> StoreResult<Vec<String>> {
        self.before_read().await?;
        let mut users: BTreeSet<String> = self
            .resources
            .iter()
            .map(|r| r.owner_id.clone())
            .collect();
        users.extend(
            self.memberships
                .iter()
                .filter(|m| m.is_active)
                .map(|m| m.user_id.clone()),
        );
        Ok(users.into_iter().collect())
    }

    async fn list_memberships_for_user(&self, user_id: &str) -> StoreResult<Vec<TeamMembership>> {
        self.before_read().await?;
        let mut memberships: Vec<_> = self
            .memberships
            .iter()
            .filter(|m| m.is_active && m.user_id == user_id)
            .map(|m| m.clone())
            .collect();
        memberships.sort_by(|a, b| a.team_id.cmp(&b.team_id));
        Ok(memberships)
    }

    async fn list_team_members(&self, team_id: &str) -> StoreResult<Vec<TeamMembership>> {
        self.before_read().await?;
        let mut members: Vec<_> = self
            .memberships
            .iter()
            .filter(|m| m.is_active && m.team_id == team_id)
            .map(|m| m.clone())
            .collect();
        members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(members)
    }

    async fn list_projects_for_team(&self, team_id: &str) -> StoreResult<Vec<ProjectRecord>> {
        self.before_read().await?;
        let mut projects: Vec<_> = self
            .projects
            .iter()
            .filter(|p| p.team_id.as_deref() == Some(team_id))
            .map(|p| p.clone())
            .collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(projects)
    }

    async fn list_resources_in_project(
        &self,
        project_id: &str,
    ) -> StoreResult<Vec<ResourceRecord>> {
        self.before_read().await?;
        let mut resources: Vec<_> = self
            .resources
            .iter()
            .filter(|r| r.project_id.as_deref() == Some(project_id))
            .map(|r| r.clone())
            .collect();
        resources.sort_by(|a, b| a.resource.cmp(&b.resource));
        Ok(resources)
    }

    async fn list_resources_owned_by(&self, user_id: &str) -> StoreResult<Vec<ResourceRecord>> {
        self.before_read().await?;
        let mut resources: Vec<_> = self
            .resources
            .iter()
            .filter(|r| r.owner_id == user_id)
            .map(|r| r.clone())
            .collect();
        resources.sort_by(|a, b| a.resource.cmp(&b.resource));
        Ok(resources)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.notifier.subscribe()
    }
}

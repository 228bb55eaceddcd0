//! The Resource Store contract.
//!
//! The store is the system of record for ownership, projects, teams and
//! memberships. Authorization only ever reads from it.

use async_trait::async_trait;
use canvas_core::{ProjectRecord, ResourceRecord, ResourceRef, TeamMembership, Visibility};
use tokio::sync::broadcast;

use crate::error::StoreResult;
use crate::events::StoreChange;

/// Read access to the system of record plus a change subscription.
///
/// Lookups return `Ok(None)` for records that do not exist. Errors are
/// reserved for infrastructure problems.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    // ==================== Resources ====================

    /// Fetches a resource's ownership and placement record.
    async fn get_resource(&self, resource: &ResourceRef) -> StoreResult<Option<ResourceRecord>>;

    /// Owner of a resource.
    async fn get_resource_owner(&self, resource: &ResourceRef) -> StoreResult<Option<String>> {
        Ok(self.get_resource(resource).await?.map(|r| r.owner_id))
    }

    /// Parent a resource was derived from, if any.
    async fn get_parent_resource(
        &self,
        resource: &ResourceRef,
    ) -> StoreResult<Option<ResourceRef>> {
        Ok(self.get_resource(resource).await?.and_then(|r| r.parent))
    }

    // ==================== Projects ====================

    async fn get_project(&self, project_id: &str) -> StoreResult<Option<ProjectRecord>>;

    async fn get_project_visibility(&self, project_id: &str) -> StoreResult<Option<Visibility>> {
        Ok(self.get_project(project_id).await?.map(|p| p.visibility))
    }

    // ==================== Teams ====================

    /// Membership of `user_id` in `team_id`, including soft-deleted records.
    async fn get_team_membership(
        &self,
        user_id: &str,
        team_id: &str,
    ) -> StoreResult<Option<TeamMembership>>;

    // ==================== Enumeration ====================

    /// Users who own a resource or hold an active membership.
    async fn list_active_users(&self) -> StoreResult<Vec<String>>;

    /// Active memberships of one user.
    async fn list_memberships_for_user(&self, user_id: &str) -> StoreResult<Vec<TeamMembership>>;

    /// Active members of one team.
    async fn list_team_members(&self, team_id: &str) -> StoreResult<Vec<TeamMembership>>;

    async fn list_projects_for_team(&self, team_id: &str) -> StoreResult<Vec<ProjectRecord>>;

    /// Resources placed in a project, the project's own record included.
    async fn list_resources_in_project(&self, project_id: &str)
    -> StoreResult<Vec<ResourceRecord>>;

    async fn list_resources_owned_by(&self, user_id: &str) -> StoreResult<Vec<ResourceRecord>>;

    // ==================== Notifications ====================

    /// Subscribe to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

//! Resources, projects, teams and the role/permission vocabulary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::id::validate_id;

// =============================================================================
// Resource Types
// =============================================================================

/// Kinds of resources that can be authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Generation,
    Project,
    File,
}

impl ResourceType {
    pub const ALL: [ResourceType; 3] = [Self::Generation, Self::Project, Self::File];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Project => "project",
            Self::File => "file",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "generation" => Ok(Self::Generation),
            "project" => Ok(Self::Project),
            "file" => Ok(Self::File),
            other => Err(CoreError::unknown_resource_type(other)),
        }
    }
}

/// A typed reference to a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_type: ResourceType,
    pub id: String,
}

impl ResourceRef {
    pub fn new(resource_type: ResourceType, id: impl Into<String>) -> Self {
        Self {
            resource_type,
            id: id.into(),
        }
    }

    /// Parse and validate a reference from untrusted caller input.
    pub fn parse(resource_type: &str, id: &str) -> Result<Self> {
        let resource_type = resource_type.parse::<ResourceType>()?;
        validate_id("resource", id)?;
        Ok(Self::new(resource_type, id))
    }

    pub fn generation(id: impl Into<String>) -> Self {
        Self::new(ResourceType::Generation, id)
    }

    pub fn project(id: impl Into<String>) -> Self {
        Self::new(ResourceType::Project, id)
    }

    pub fn file(id: impl Into<String>) -> Self {
        Self::new(ResourceType::File, id)
    }

    /// Tag used to index cache entries by resource: `{type}/{id}`.
    pub fn tag(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

// =============================================================================
// Permissions and Roles
// =============================================================================

/// Operations a subject may ask to perform on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Delete,
    Share,
    Manage,
}

impl Permission {
    pub const ALL: [Permission; 5] = [
        Self::Read,
        Self::Write,
        Self::Delete,
        Self::Share,
        Self::Manage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Share => "share",
            Self::Manage => "manage",
        }
    }

    /// Read-only permissions are the only ones public visibility can grant.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Read)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "delete" => Ok(Self::Delete),
            "share" => Ok(Self::Share),
            "manage" => Ok(Self::Manage),
            other => Err(CoreError::unknown_permission(other)),
        }
    }
}

/// Team roles, ordered from least to most privileged.
///
/// The derived `Ord` follows declaration order, so `Role::Viewer < Role::Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Contributor,
    Editor,
    Admin,
    Owner,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Self::Viewer,
        Self::Contributor,
        Self::Editor,
        Self::Admin,
        Self::Owner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Contributor => "contributor",
            Self::Editor => "editor",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }

    /// Returns `true` if this role meets or exceeds `required`.
    pub fn satisfies(&self, required: Role) -> bool {
        *self >= required
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "viewer" => Ok(Self::Viewer),
            "contributor" => Ok(Self::Contributor),
            "editor" => Ok(Self::Editor),
            "admin" => Ok(Self::Admin),
            "owner" => Ok(Self::Owner),
            other => Err(CoreError::UnknownRole(other.to_string())),
        }
    }
}

/// Project visibility setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Private,
    Team,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Team => "team",
            Self::Public => "public",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(Self::Private),
            "team" => Ok(Self::Team),
            "public" => Ok(Self::Public),
            other => Err(CoreError::UnknownVisibility(other.to_string())),
        }
    }
}

// =============================================================================
// Records owned by the Resource Store
// =============================================================================

/// A user's membership in a team.
///
/// Removal is a soft delete: the record stays with `is_active = false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMembership {
    pub team_id: String,
    pub user_id: String,
    pub role: Role,
    pub is_active: bool,
}

impl TeamMembership {
    pub fn new(team_id: impl Into<String>, user_id: impl Into<String>, role: Role) -> Self {
        Self {
            team_id: team_id.into(),
            user_id: user_id.into(),
            role,
            is_active: true,
        }
    }

    /// The role this membership currently grants, if it is active.
    pub fn effective_role(&self) -> Option<Role> {
        self.is_active.then_some(self.role)
    }
}

/// Ownership and placement of a single resource.
///
/// A project's own record points at itself through `project_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource: ResourceRef,
    pub owner_id: String,
    pub project_id: Option<String>,
    pub parent: Option<ResourceRef>,
}

impl ResourceRecord {
    pub fn new(resource: ResourceRef, owner_id: impl Into<String>) -> Self {
        Self {
            resource,
            owner_id: owner_id.into(),
            project_id: None,
            parent: None,
        }
    }

    pub fn in_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_parent(mut self, parent: ResourceRef) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// A project and the team it is associated with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub owner_id: String,
    pub team_id: Option<String>,
    pub visibility: Visibility,
}

impl ProjectRecord {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            team_id: None,
            visibility: Visibility::Private,
        }
    }

    pub fn owned_by_team(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// The resource record describing the project itself.
    pub fn as_resource(&self) -> ResourceRecord {
        ResourceRecord::new(ResourceRef::project(&self.id), &self.owner_id).in_project(&self.id)
    }
}

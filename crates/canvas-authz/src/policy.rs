//! Minimum team role required for each permission.

use canvas_core::{Permission, Role};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPolicy {
    #[serde(default = "default_read")]
    pub read: Role,
    #[serde(default = "default_write")]
    pub write: Role,
    #[serde(default = "default_delete")]
    pub delete: Role,
    #[serde(default = "default_share")]
    pub share: Role,
    #[serde(default = "default_manage")]
    pub manage: Role,
}

fn default_read() -> Role {
    Role::Viewer
}

fn default_write() -> Role {
    Role::Contributor
}

fn default_delete() -> Role {
    Role::Editor
}

fn default_share() -> Role {
    Role::Editor
}

fn default_manage() -> Role {
    Role::Admin
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            read: default_read(),
            write: default_write(),
            delete: default_delete(),
            share: default_share(),
            manage: default_manage(),
        }
    }
}

impl PermissionPolicy {
    pub fn min_role(&self, permission: Permission) -> Role {
        match permission {
            Permission::Read => self.read,
            Permission::Write => self.write,
            Permission::Delete => self.delete,
            Permission::Share => self.share,
            Permission::Manage => self.manage,
        }
    }

    /// Whether a member holding `role` may exercise `permission`.
    pub fn allows(&self, role: Role, permission: Permission) -> bool {
        role.satisfies(self.min_role(permission))
    }

    /// Every permission `role` grants.
    pub fn permissions_for(&self, role: Role) -> impl Iterator<Item = Permission> + '_ {
        Permission::ALL
            .into_iter()
            .filter(move |p| self.allows(role, *p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_minimums() {
        let policy = PermissionPolicy::default();
        assert!(policy.allows(Role::Viewer, Permission::Read));
        assert!(!policy.allows(Role::Viewer, Permission::Delete));
        assert!(policy.allows(Role::Editor, Permission::Delete));
        assert!(!policy.allows(Role::Editor, Permission::Manage));
        assert!(policy.allows(Role::Owner, Permission::Manage));
    }

    #[test]
    fn test_permissions_for_role() {
        let policy = PermissionPolicy::default();
        let granted: Vec<_> = policy.permissions_for(Role::Contributor).collect();
        assert_eq!(granted, vec![Permission::Read, Permission::Write]);
        assert_eq!(policy.permissions_for(Role::Owner).count(), 5);
    }
}

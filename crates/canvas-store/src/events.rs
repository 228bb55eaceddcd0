//! Change notifications emitted by the Resource Store.
//!
//! Every mutation that can change an authorization outcome is announced on a
//! broadcast channel after it has been applied.

use std::sync::Arc;

use canvas_core::{ResourceRef, Role, Visibility};
use tokio::sync::broadcast;
use tracing::debug;

/// Default buffer size for the change channel.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// A mutation relevant to authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    MembershipAdded {
        team_id: String,
        user_id: String,
        role: Role,
    },
    RoleChanged {
        team_id: String,
        user_id: String,
        old_role: Role,
        new_role: Role,
    },
    /// Soft delete: the membership record stays with `is_active = false`.
    MembershipRemoved { team_id: String, user_id: String },
    ProjectVisibilityChanged {
        project_id: String,
        visibility: Visibility,
    },
    OwnershipTransferred {
        resource: ResourceRef,
        from: String,
        to: String,
    },
    ResourceDeleted {
        resource: ResourceRef,
        owner_id: String,
    },
}

impl StoreChange {
    /// Short name used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MembershipAdded { .. } => "membership_added",
            Self::RoleChanged { .. } => "role_changed",
            Self::MembershipRemoved { .. } => "membership_removed",
            Self::ProjectVisibilityChanged { .. } => "project_visibility_changed",
            Self::OwnershipTransferred { .. } => "ownership_transferred",
            Self::ResourceDeleted { .. } => "resource_deleted",
        }
    }

    /// Subjects whose cached verdicts are known to be affected.
    ///
    /// Visibility changes affect an open-ended set of subjects and return
    /// nothing here; they are handled per resource instead.
    pub fn affected_subjects(&self) -> Vec<&str> {
        match self {
            Self::MembershipAdded { user_id, .. }
            | Self::RoleChanged { user_id, .. }
            | Self::MembershipRemoved { user_id, .. } => vec![user_id.as_str()],
            Self::OwnershipTransferred { from, to, .. } => vec![from.as_str(), to.as_str()],
            Self::ResourceDeleted { owner_id, .. } => vec![owner_id.as_str()],
            Self::ProjectVisibilityChanged { .. } => Vec::new(),
        }
    }
}

/// Fan-out of [`StoreChange`] events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    sender: broadcast::Sender<StoreChange>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Publish a change. Returns the number of subscribers that received it.
    pub fn publish(&self, change: StoreChange) -> usize {
        if self.sender.receiver_count() == 0 {
            return 0;
        }
        let kind = change.kind();
        let count = self.sender.send(change).unwrap_or_default();
        debug!(change = kind, subscribers = count, "Published store change");
        count
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

//! Errors surfaced by `authorize`.
//!
//! Denial is never an error. What remains is either the caller's fault
//! (malformed input, unknown resource) or the store's (indeterminate), and
//! callers must treat every one of them as "permission denied".

use canvas_core::{CoreError, ResourceRef};
use canvas_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AuthzError {
    #[error("Malformed authorization request: {0}")]
    Malformed(#[from] CoreError),

    #[error("Resource not found: {resource}")]
    ResourceNotFound { resource: ResourceRef },

    /// The store could not be consulted and nothing was cached.
    #[error("Authorization indeterminate: {reason}")]
    Indeterminate { reason: String },
}

impl AuthzError {
    #[must_use]
    pub fn resource_not_found(resource: ResourceRef) -> Self {
        Self::ResourceNotFound { resource }
    }

    #[must_use]
    pub fn indeterminate(reason: impl Into<String>) -> Self {
        Self::Indeterminate {
            reason: reason.into(),
        }
    }

    /// Caller input can never be authorized; retrying is pointless.
    pub fn is_validation_error(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::ResourceNotFound { .. })
    }

    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Self::Indeterminate { .. })
    }

    /// Every authorization error is equivalent to a denial for the caller.
    pub fn is_denial_equivalent(&self) -> bool {
        true
    }
}

impl From<StoreError> for AuthzError {
    fn from(err: StoreError) -> Self {
        Self::indeterminate(err.to_string())
    }
}

pub type AuthzResult<T> = Result<T, AuthzError>;

use thiserror::Error;

/// Core error types for Canvas authorization inputs.
///
/// Every variant is a validation failure: the caller sent something that can
/// never be authorized, so retrying is pointless.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Unknown resource type: {0}")]
    UnknownResourceType(String),

    #[error("Unknown permission: {0}")]
    UnknownPermission(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Unknown visibility: {0}")]
    UnknownVisibility(String),

    #[error("Invalid {kind} identifier '{value}': {reason}")]
    InvalidId {
        kind: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Verdict encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Verdict decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Inconsistent verdict: {0}")]
    InconsistentVerdict(String),
}

impl CoreError {
    /// Create a new UnknownResourceType error
    pub fn unknown_resource_type(value: impl Into<String>) -> Self {
        Self::UnknownResourceType(value.into())
    }

    /// Create a new UnknownPermission error
    pub fn unknown_permission(value: impl Into<String>) -> Self {
        Self::UnknownPermission(value.into())
    }

    /// Create a new InvalidId error
    pub fn invalid_id(kind: &'static str, value: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidId {
            kind,
            value: value.into(),
            reason,
        }
    }

    /// Check if this error was caused by caller input (as opposed to a
    /// corrupted cache payload).
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownResourceType(_)
                | Self::UnknownPermission(_)
                | Self::UnknownRole(_)
                | Self::UnknownVisibility(_)
                | Self::InvalidId { .. }
        )
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

//! Resource Store error types.

/// Errors a Resource Store backend can report.
///
/// A missing record is not an error; lookups return `Ok(None)` for that.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store cannot be reached.
    #[error("Resource store unavailable: {message}")]
    Unavailable {
        /// Description of the connectivity failure.
        message: String,
    },

    /// A query did not complete in time.
    #[error("Resource store query timed out after {elapsed_ms}ms: {operation}")]
    Timeout {
        /// The query that timed out.
        operation: &'static str,
        /// How long the caller waited.
        elapsed_ms: u64,
    },

    /// A mutation referenced a record that does not exist.
    #[error("Record not found: {kind} {id}")]
    NotFound { kind: &'static str, id: String },

    /// An internal store error occurred.
    #[error("Internal store error: {message}")]
    Internal { message: String },
}

impl StoreError {
    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout(operation: &'static str, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation,
            elapsed_ms,
        }
    }

    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if retrying later could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::unavailable("connection refused").is_transient());
        assert!(StoreError::timeout("get_resource", 250).is_transient());
        assert!(!StoreError::not_found("resource", "g1").is_transient());
        assert!(!StoreError::internal("boom").is_transient());
    }

    #[test]
    fn test_display() {
        let err = StoreError::timeout("get_team_membership", 250);
        assert_eq!(
            err.to_string(),
            "Resource store query timed out after 250ms: get_team_membership"
        );
    }
}

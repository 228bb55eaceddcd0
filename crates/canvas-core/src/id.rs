//! Identifier validation.
//!
//! Identifiers end up embedded in cache keys and glob patterns, so characters
//! with meaning in either are rejected up front.

use crate::error::{CoreError, Result};

/// Maximum accepted identifier length in bytes.
pub const MAX_ID_LEN: usize = 256;

const FORBIDDEN: &[char] = &[':', '*', '?', '[', ']', '\\'];

/// Validate an identifier of the given kind (`"subject"`, `"resource"`, ...).
pub fn validate_id(kind: &'static str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(CoreError::invalid_id(kind, id, "must not be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(CoreError::invalid_id(kind, id, "exceeds 256 bytes"));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(CoreError::invalid_id(kind, id, "contains whitespace"));
    }
    if id.contains(FORBIDDEN) {
        return Err(CoreError::invalid_id(
            kind,
            id,
            "contains a reserved character (: * ? [ ] \\)",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        assert!(validate_id("subject", "user-42").is_ok());
        assert!(validate_id("resource", "0b6c1f0e-5a7e-4f43-9a9e-2b0c6d1c7f11").is_ok());
    }

    #[test]
    fn test_rejects_reserved_characters() {
        for bad in ["a:b", "a*", "a?b", "[x]", "a b", "", "tab\there"] {
            assert!(validate_id("subject", bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_rejects_oversized() {
        let long = "x".repeat(MAX_ID_LEN + 1);
        assert!(validate_id("subject", &long).is_err());
        assert!(validate_id("subject", &long[..MAX_ID_LEN]).is_ok());
    }
}

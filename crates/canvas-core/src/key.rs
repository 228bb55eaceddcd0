//! Cache key derivation.
//!
//! Keys look like `authz:{subject_id}:{digest}` where `digest` is the
//! SHA-256 of the length-prefixed question. The subject id stays readable so
//! that everything cached for one subject is matched by `authz:{subject_id}:*`.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::id::validate_id;
use crate::model::{Permission, ResourceRef};

/// Namespace shared by every authorization cache key.
pub const KEY_PREFIX: &str = "authz";

/// A deterministic cache key for one (subject, resource, permission) question.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key: String,
    subject_id: String,
    resource: ResourceRef,
    permission: Permission,
}

impl CacheKey {
    /// Derive a key, validating both identifiers.
    pub fn new(subject_id: &str, resource: &ResourceRef, permission: Permission) -> Result<Self> {
        validate_id("subject", subject_id)?;
        validate_id("resource", &resource.id)?;

        let mut hasher = Sha256::new();
        for part in [
            subject_id,
            resource.resource_type.as_str(),
            resource.id.as_str(),
            permission.as_str(),
        ] {
            // Length prefix keeps ("ab","c") and ("a","bc") apart.
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        let digest = hex::encode(hasher.finalize());

        Ok(Self {
            key: format!("{KEY_PREFIX}:{subject_id}:{digest}"),
            subject_id: subject_id.to_string(),
            resource: resource.clone(),
            permission,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    /// Resource tag used for resource-scoped invalidation.
    pub fn tag(&self) -> String {
        self.resource.tag()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.key
    }
}

/// Pattern matching every key cached for `subject_id`.
pub fn subject_pattern(subject_id: &str) -> String {
    format!("{KEY_PREFIX}:{subject_id}:*")
}

/// Glob match supporting `*` only.
///
/// Identifiers never contain `*`, so a pattern built from them is unambiguous.
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };

    let segments: Vec<&str> = parts.collect();
    let Some((last, middle)) = segments.split_last() else {
        // No `*` in the pattern: exact match.
        return rest.is_empty();
    };

    for segment in middle {
        match rest.find(segment) {
            Some(pos) => rest = &rest[pos + segment.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

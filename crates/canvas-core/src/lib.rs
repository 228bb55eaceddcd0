//! # canvas-core
//!
//! Shared data model for Canvas authorization decisions.
//!
//! This crate has no I/O. It defines the vocabulary every other crate speaks:
//!
//! - [`model`] - resources, projects, team memberships, roles and permissions
//! - [`verdict`] - [`AuthorizationVerdict`] and its MessagePack codec
//! - [`key`] - deterministic [`CacheKey`] derivation
//! - [`id`] - identifier validation and generation

pub mod error;
pub mod id;
pub mod key;
pub mod model;
pub mod verdict;

pub use error::{CoreError, Result};
pub use id::validate_id;
pub use key::{CacheKey, KEY_PREFIX, pattern_matches, subject_pattern};
pub use model::{
    Permission, ProjectRecord, ResourceRecord, ResourceRef, ResourceType, Role, TeamMembership,
    Visibility,
};
pub use verdict::{AuthorizationVerdict, Decision, GrantPath};

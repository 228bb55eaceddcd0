//! # canvas-authz
//!
//! Answers "may this subject do this to that resource?" for Canvas.
//!
//! - [`AuthorizationEvaluator`] runs the rule chain behind the tiered cache
//! - [`InvalidationHooks`] turns Resource Store changes into cache
//!   invalidations
//! - [`ViewRefresher`] keeps the materialized-view tier populated
//!
//! Denial is a normal verdict. [`AuthzError`] is reserved for malformed
//! input and an unreachable store, and callers must treat it as a denial.

pub mod config;
pub mod error;
pub mod evaluator;
pub mod hooks;
pub mod policy;
pub mod refresher;

pub use config::AuthzConfig;
pub use error::{AuthzError, AuthzResult};
pub use evaluator::AuthorizationEvaluator;
pub use hooks::InvalidationHooks;
pub use policy::PermissionPolicy;
pub use refresher::{RefreshError, RefreshSummary, RefresherStats, ViewRefresher};

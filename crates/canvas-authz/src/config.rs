//! Evaluator and refresher configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::PermissionPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthzConfig {
    /// Parent hops rule 4 may follow. Deeper chains end the rule as a miss.
    #[serde(default = "default_max_inheritance_depth")]
    pub max_inheritance_depth: u32,

    /// TTL stamped on allow verdicts.
    #[serde(default = "default_allow_ttl_seconds")]
    pub allow_ttl_seconds: u64,

    /// TTL stamped on deny verdicts.
    #[serde(default = "default_deny_ttl_seconds")]
    pub deny_ttl_seconds: u64,

    /// Bound on each Resource Store call.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Minimum role per permission.
    #[serde(default)]
    pub policy: PermissionPolicy,
}

fn default_max_inheritance_depth() -> u32 {
    3
}

fn default_allow_ttl_seconds() -> u64 {
    60
}

fn default_deny_ttl_seconds() -> u64 {
    120
}

fn default_store_timeout_ms() -> u64 {
    500
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            max_inheritance_depth: default_max_inheritance_depth(),
            allow_ttl_seconds: default_allow_ttl_seconds(),
            deny_ttl_seconds: default_deny_ttl_seconds(),
            store_timeout_ms: default_store_timeout_ms(),
            policy: PermissionPolicy::default(),
        }
    }
}

impl AuthzConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.allow_ttl_seconds == 0 || self.deny_ttl_seconds == 0 {
            return Err("authz verdict TTLs must be > 0".into());
        }
        if self.store_timeout_ms == 0 {
            return Err("authz.store_timeout_ms must be > 0".into());
        }
        if self.max_inheritance_depth > 32 {
            return Err("authz.max_inheritance_depth must be <= 32".into());
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

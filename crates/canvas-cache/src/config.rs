//! Cache tier configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::eviction::{EvictionPolicyKind, HybridWeights};

/// Configuration for all three cache tiers and the distributed-tier breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound on in-process entries.
    #[serde(default = "default_l1_max_entries")]
    pub l1_max_entries: usize,

    /// Which entries the in-process tier evicts first when full.
    #[serde(default)]
    pub l1_eviction_policy: EvictionPolicyKind,

    /// Weights used when `l1_eviction_policy = "hybrid"`.
    #[serde(default)]
    pub l1_hybrid_weights: HybridWeights,

    #[serde(default = "default_l1_ttl_seconds")]
    pub l1_default_ttl_seconds: u64,

    /// Redis URL for the distributed tier. Absent means an in-process
    /// stand-in is used, which is only useful for a single instance.
    #[serde(default)]
    pub l2_endpoint: Option<String>,

    #[serde(default = "default_l2_ttl_seconds")]
    pub l2_default_ttl_seconds: u64,

    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_l2_failure_threshold")]
    pub l2_failure_threshold: u32,

    /// Cool-down before a half-open trial call.
    #[serde(default = "default_l2_open_duration_seconds")]
    pub l2_open_duration_seconds: u64,

    /// Per-call timeout for the distributed tier.
    #[serde(default = "default_l2_timeout_ms")]
    pub l2_timeout_ms: u64,

    #[serde(default = "default_l2_pool_size")]
    pub l2_pool_size: usize,

    /// Redis URL for the materialized-view tier. Absent means in-process.
    #[serde(default)]
    pub l3_endpoint: Option<String>,

    #[serde(default = "default_l3_refresh_interval_seconds")]
    pub l3_refresh_interval_seconds: u64,

    /// Rows computed longer ago than this are treated as misses.
    #[serde(default = "default_l3_staleness_bound_seconds")]
    pub l3_staleness_bound_seconds: u64,

    #[serde(default = "default_l3_ttl_seconds")]
    pub l3_default_ttl_seconds: u64,

    #[serde(default = "default_l3_timeout_ms")]
    pub l3_timeout_ms: u64,

    /// Copy slower-tier hits into faster tiers.
    #[serde(default = "default_promotion_enabled")]
    pub promotion_enabled: bool,

    /// Bound on each background distributed/view delete.
    #[serde(default = "default_invalidation_timeout_ms")]
    pub invalidation_timeout_ms: u64,

    /// How long `close()` waits for pending background invalidations.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_l1_max_entries() -> usize {
    10_000
}

fn default_l1_ttl_seconds() -> u64 {
    60
}

fn default_l2_ttl_seconds() -> u64 {
    300
}

fn default_l2_failure_threshold() -> u32 {
    5
}

fn default_l2_open_duration_seconds() -> u64 {
    30
}

fn default_l2_timeout_ms() -> u64 {
    50
}

fn default_l2_pool_size() -> usize {
    16
}

fn default_l3_refresh_interval_seconds() -> u64 {
    300
}

fn default_l3_staleness_bound_seconds() -> u64 {
    900
}

fn default_l3_ttl_seconds() -> u64 {
    900
}

fn default_l3_timeout_ms() -> u64 {
    100
}

fn default_promotion_enabled() -> bool {
    true
}

fn default_invalidation_timeout_ms() -> u64 {
    1_000
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_entries: default_l1_max_entries(),
            l1_eviction_policy: EvictionPolicyKind::default(),
            l1_hybrid_weights: HybridWeights::default(),
            l1_default_ttl_seconds: default_l1_ttl_seconds(),
            l2_endpoint: None,
            l2_default_ttl_seconds: default_l2_ttl_seconds(),
            l2_failure_threshold: default_l2_failure_threshold(),
            l2_open_duration_seconds: default_l2_open_duration_seconds(),
            l2_timeout_ms: default_l2_timeout_ms(),
            l2_pool_size: default_l2_pool_size(),
            l3_endpoint: None,
            l3_refresh_interval_seconds: default_l3_refresh_interval_seconds(),
            l3_staleness_bound_seconds: default_l3_staleness_bound_seconds(),
            l3_default_ttl_seconds: default_l3_ttl_seconds(),
            l3_timeout_ms: default_l3_timeout_ms(),
            promotion_enabled: default_promotion_enabled(),
            invalidation_timeout_ms: default_invalidation_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.l1_max_entries == 0 {
            return Err("cache.l1_max_entries must be > 0".into());
        }
        if self.l1_default_ttl_seconds == 0
            || self.l2_default_ttl_seconds == 0
            || self.l3_default_ttl_seconds == 0
        {
            return Err("cache tier default TTLs must be > 0".into());
        }
        if self.l2_failure_threshold == 0 {
            return Err("cache.l2_failure_threshold must be > 0".into());
        }
        if self.l2_open_duration_seconds == 0 {
            return Err("cache.l2_open_duration_seconds must be > 0".into());
        }
        if self.l2_timeout_ms == 0 || self.l3_timeout_ms == 0 || self.invalidation_timeout_ms == 0 {
            return Err("cache tier timeouts must be > 0".into());
        }
        if self.l2_pool_size == 0 {
            return Err("cache.l2_pool_size must be > 0".into());
        }
        if self.l3_refresh_interval_seconds == 0 {
            return Err("cache.l3_refresh_interval_seconds must be > 0".into());
        }
        if self.l3_staleness_bound_seconds < self.l3_refresh_interval_seconds {
            return Err(
                "cache.l3_staleness_bound_seconds must be >= cache.l3_refresh_interval_seconds"
                    .into(),
            );
        }
        for endpoint in [&self.l2_endpoint, &self.l3_endpoint].into_iter().flatten() {
            if !endpoint.starts_with("redis://") && !endpoint.starts_with("rediss://") {
                return Err(format!("cache endpoint must be a redis:// URL, got {endpoint}"));
            }
        }
        self.l1_hybrid_weights.validate()
    }

    pub fn l1_default_ttl(&self) -> Duration {
        Duration::from_secs(self.l1_default_ttl_seconds)
    }

    pub fn l2_default_ttl(&self) -> Duration {
        Duration::from_secs(self.l2_default_ttl_seconds)
    }

    pub fn l3_default_ttl(&self) -> Duration {
        Duration::from_secs(self.l3_default_ttl_seconds)
    }

    pub fn l2_timeout(&self) -> Duration {
        Duration::from_millis(self.l2_timeout_ms)
    }

    pub fn l3_timeout(&self) -> Duration {
        Duration::from_millis(self.l3_timeout_ms)
    }

    pub fn l2_open_duration(&self) -> Duration {
        Duration::from_secs(self.l2_open_duration_seconds)
    }

    pub fn l3_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.l3_refresh_interval_seconds)
    }

    pub fn l3_staleness_bound(&self) -> Duration {
        Duration::from_secs(self.l3_staleness_bound_seconds)
    }

    pub fn invalidation_timeout(&self) -> Duration {
        Duration::from_millis(self.invalidation_timeout_ms)
    }

    /// How long an invalidated key may still be physically present in the
    /// distributed or view tier.
    pub fn slow_tier_max_ttl(&self) -> Duration {
        self.l2_default_ttl()
            .max(self.l3_default_ttl().min(self.l3_staleness_bound()))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let cfg = CacheConfig {
            l1_max_entries: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = CacheConfig {
            l2_endpoint: Some("localhost:6379".into()),
            ..Default::default()
        };
        assert!(cfg.validate().unwrap_err().contains("redis://"));

        let cfg = CacheConfig {
            l3_refresh_interval_seconds: 600,
            l3_staleness_bound_seconds: 300,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let cfg: CacheConfig =
            serde_json::from_str(r#"{"l1_max_entries": 5, "l1_eviction_policy": "lfu"}"#).unwrap();
        assert_eq!(cfg.l1_max_entries, 5);
        assert_eq!(cfg.l1_eviction_policy, EvictionPolicyKind::Lfu);
        assert_eq!(cfg.l2_failure_threshold, 5);
        assert!(cfg.promotion_enabled);
    }
}

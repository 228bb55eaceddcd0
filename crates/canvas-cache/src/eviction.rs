//! Eviction strategies for the in-process tier.
//!
//! Each policy maps an entry to an [`EvictionScore`]; the entry with the
//! lowest score is evicted first.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Policy names accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicyKind {
    #[default]
    Lru,
    Lfu,
    Ttl,
    Hybrid,
}

/// Weights for [`EvictionPolicy::Hybrid`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HybridWeights {
    #[serde(default = "default_recency_weight")]
    pub recency: f64,
    #[serde(default = "default_frequency_weight")]
    pub frequency: f64,
    #[serde(default = "default_priority_weight")]
    pub priority: f64,
}

fn default_recency_weight() -> f64 {
    0.5
}

fn default_frequency_weight() -> f64 {
    0.4
}

fn default_priority_weight() -> f64 {
    0.1
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            recency: default_recency_weight(),
            frequency: default_frequency_weight(),
            priority: default_priority_weight(),
        }
    }
}

impl HybridWeights {
    pub fn validate(&self) -> Result<(), String> {
        let weights = [self.recency, self.frequency, self.priority];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err("cache.l1_hybrid_weights must be finite and >= 0".into());
        }
        if weights.iter().sum::<f64>() == 0.0 {
            return Err("cache.l1_hybrid_weights must not all be zero".into());
        }
        Ok(())
    }
}

/// Access statistics of one entry, as seen by the scoring function.
///
/// `last_access` is a logical clock shared by the tier: larger is more recent.
/// `expires_at_ms` is milliseconds since the tier was created.
#[derive(Debug, Clone, Copy)]
pub struct EntryView {
    pub last_access: u64,
    pub access_count: u64,
    pub expires_at_ms: u64,
    pub priority: f64,
    /// Monotonic insertion sequence.
    pub seq: u64,
}

/// Population-wide ranges used to normalize hybrid scores.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalization {
    pub min_last_access: u64,
    pub max_last_access: u64,
    pub max_access_count: u64,
}

impl Normalization {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a EntryView>) -> Self {
        let mut norm = Self {
            min_last_access: u64::MAX,
            ..Default::default()
        };
        let mut any = false;
        for e in entries {
            any = true;
            norm.min_last_access = norm.min_last_access.min(e.last_access);
            norm.max_last_access = norm.max_last_access.max(e.last_access);
            norm.max_access_count = norm.max_access_count.max(e.access_count);
        }
        if !any {
            norm.min_last_access = 0;
        }
        norm
    }

    fn recency(&self, last_access: u64) -> f64 {
        let span = self.max_last_access.saturating_sub(self.min_last_access);
        if span == 0 {
            return 1.0;
        }
        last_access.saturating_sub(self.min_last_access) as f64 / span as f64
    }

    fn frequency(&self, access_count: u64) -> f64 {
        if self.max_access_count == 0 {
            return 0.0;
        }
        access_count as f64 / self.max_access_count as f64
    }
}

/// Comparable eviction score. Lower is evicted first.
#[derive(Debug, Clone, Copy)]
pub struct EvictionScore {
    pub primary: f64,
    pub tiebreak: u64,
}

impl PartialEq for EvictionScore {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EvictionScore {}

impl PartialOrd for EvictionScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionScore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.primary
            .total_cmp(&other.primary)
            .then(self.tiebreak.cmp(&other.tiebreak))
    }
}

/// The eviction strategy selected at construction time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EvictionPolicy {
    /// Least recently accessed first.
    Lru,
    /// Least frequently accessed first, ties broken by recency.
    Lfu,
    /// Soonest to expire first. Access statistics are ignored.
    Ttl,
    /// `recency * w1 + frequency * w2 + priority * w3`, lowest first.
    Hybrid(HybridWeights),
}

impl EvictionPolicy {
    pub fn from_config(kind: EvictionPolicyKind, weights: HybridWeights) -> Self {
        match kind {
            EvictionPolicyKind::Lru => Self::Lru,
            EvictionPolicyKind::Lfu => Self::Lfu,
            EvictionPolicyKind::Ttl => Self::Ttl,
            EvictionPolicyKind::Hybrid => Self::Hybrid(weights),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Ttl => "ttl",
            Self::Hybrid(_) => "hybrid",
        }
    }

    /// Whether scoring needs population-wide [`Normalization`].
    pub fn needs_normalization(&self) -> bool {
        matches!(self, Self::Hybrid(_))
    }

    pub fn score_for_eviction(&self, entry: &EntryView, norm: &Normalization) -> EvictionScore {
        match self {
            Self::Lru => EvictionScore {
                primary: entry.last_access as f64,
                tiebreak: entry.seq,
            },
            Self::Lfu => EvictionScore {
                primary: entry.access_count as f64,
                tiebreak: entry.last_access,
            },
            Self::Ttl => EvictionScore {
                primary: entry.expires_at_ms as f64,
                tiebreak: entry.seq,
            },
            Self::Hybrid(w) => EvictionScore {
                primary: w.recency * norm.recency(entry.last_access)
                    + w.frequency * norm.frequency(entry.access_count)
                    + w.priority * entry.priority,
                tiebreak: entry.last_access,
            },
        }
    }
}

//! Cache-internal errors.
//!
//! These never leave the cache manager: every tier failure becomes "try the
//! next source".

use crate::tier::Tier;

#[derive(Debug, thiserror::Error)]
pub enum TierError {
    #[error("{tier} tier unavailable: {message}")]
    Unavailable { tier: Tier, message: String },

    #[error("{tier} tier timed out after {elapsed_ms}ms")]
    Timeout { tier: Tier, elapsed_ms: u64 },

    #[error("{tier} tier payload error: {message}")]
    Codec { tier: Tier, message: String },
}

impl TierError {
    #[must_use]
    pub fn unavailable(tier: Tier, message: impl Into<String>) -> Self {
        Self::Unavailable {
            tier,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(tier: Tier, elapsed_ms: u64) -> Self {
        Self::Timeout { tier, elapsed_ms }
    }

    #[must_use]
    pub fn codec(tier: Tier, message: impl Into<String>) -> Self {
        Self::Codec {
            tier,
            message: message.into(),
        }
    }

    pub fn tier(&self) -> Tier {
        match self {
            Self::Unavailable { tier, .. } | Self::Timeout { tier, .. } | Self::Codec { tier, .. } => {
                *tier
            }
        }
    }

    pub fn redis(tier: Tier, err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::timeout(tier, 0)
        } else {
            Self::unavailable(tier, err.to_string())
        }
    }

    pub fn pool(tier: Tier, err: deadpool_redis::PoolError) -> Self {
        Self::unavailable(tier, format!("failed to get Redis connection: {err}"))
    }
}

pub type TierResult<T> = Result<T, TierError>;

/// Bound a tier call by `timeout`; elapsing counts as a tier failure.
pub async fn with_timeout<T, F>(tier: Tier, timeout: std::time::Duration, fut: F) -> TierResult<T>
where
    F: std::future::Future<Output = TierResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(TierError::timeout(tier, timeout.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_elapses() {
        let result: TierResult<()> = with_timeout(Tier::Distributed, Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, TierError::Timeout { elapsed_ms: 50, .. }));
        assert_eq!(err.tier(), Tier::Distributed);
        assert_eq!(err.to_string(), "distributed tier timed out after 50ms");
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result() {
        let result = with_timeout(Tier::Materialized, Duration::from_millis(50), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}

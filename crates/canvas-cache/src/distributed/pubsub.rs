//! Redis Pub/Sub for cross-instance invalidation of the in-process tier.
//!
//! ```text
//! Instance 1: invalidate_for_subject("alice")
//!   ↓
//! PUBLISH authz:invalidate "pattern:authz:alice:*"
//!   ↓
//! Instance 2: listener drops matching keys from its local tier
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::local::LocalTier;

/// Channel invalidations are published on.
pub const INVALIDATION_CHANNEL: &str = "authz:invalidate";

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Payload of an invalidation broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationMessage {
    /// Drop keys matching a `*` glob.
    Pattern(String),
    /// Drop keys tagged with a resource tag.
    Tag(String),
}

impl InvalidationMessage {
    pub fn encode(&self) -> String {
        match self {
            Self::Pattern(p) => format!("pattern:{p}"),
            Self::Tag(t) => format!("tag:{t}"),
        }
    }

    pub fn parse(payload: &str) -> Option<Self> {
        if let Some(pattern) = payload.strip_prefix("pattern:") {
            return Some(Self::Pattern(pattern.to_string()));
        }
        payload
            .strip_prefix("tag:")
            .map(|tag| Self::Tag(tag.to_string()))
    }

    /// Apply to a local tier. Returns how many entries were removed.
    pub fn apply(&self, local: &LocalTier) -> usize {
        match self {
            Self::Pattern(p) => local.remove_matching(p),
            Self::Tag(t) => local.remove_tag(t),
        }
    }
}

/// Subscribes to [`INVALIDATION_CHANNEL`] and keeps the local tier in step
/// with invalidations issued by other instances.
pub struct InvalidationListener {
    pub redis_url: String,
    pub local: Arc<LocalTier>,
}

impl InvalidationListener {
    pub fn new(redis_url: impl Into<String>, local: Arc<LocalTier>) -> Self {
        Self {
            redis_url: redis_url.into(),
            local,
        }
    }

    /// Run until `token` is cancelled, reconnecting with exponential backoff.
    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);

            loop {
                let result = tokio::select! {
                    _ = token.cancelled() => break,
                    result = self.run() => result,
                };
                match result {
                    Ok(()) => {
                        backoff = Duration::from_secs(1);
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "Invalidation listener error, reconnecting..."
                        );
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
            tracing::info!("Invalidation listener stopped");
        })
    }

    async fn run(&self) -> Result<(), String> {
        let client = redis::Client::open(self.redis_url.clone())
            .map_err(|e| format!("failed to create Redis client: {e}"))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| format!("failed to get pub/sub connection: {e}"))?;

        pubsub
            .subscribe(INVALIDATION_CHANNEL)
            .await
            .map_err(|e| format!("failed to subscribe: {e}"))?;

        tracing::info!(channel = INVALIDATION_CHANNEL, "Subscribed to invalidation channel");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let Ok(payload) = msg.get_payload::<String>() else {
                tracing::warn!("failed to read invalidation payload");
                continue;
            };
            match InvalidationMessage::parse(&payload) {
                Some(message) => {
                    let removed = message.apply(&self.local);
                    tracing::debug!(payload = %payload, removed, "applied remote invalidation");
                }
                None => tracing::warn!(payload = %payload, "unknown invalidation payload"),
            }
        }
        Err("pub/sub connection closed".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::EvictionPolicy;
    use crate::local::InsertOptions;

    #[test]
    fn test_message_codec() {
        let msg = InvalidationMessage::Pattern("authz:alice:*".into());
        assert_eq!(msg.encode(), "pattern:authz:alice:*");
        assert_eq!(InvalidationMessage::parse(&msg.encode()), Some(msg));

        let msg = InvalidationMessage::Tag("generation/g1".into());
        assert_eq!(InvalidationMessage::parse(&msg.encode()), Some(msg));

        assert_eq!(InvalidationMessage::parse("authz:alice:*"), None);
    }

    #[tokio::test]
    async fn test_apply_to_local() {
        let local = LocalTier::new(10, EvictionPolicy::Lru);
        let ttl = Duration::from_secs(60);
        local.insert("authz:alice:1", Arc::new(vec![1]), ttl, InsertOptions::new("file/f1"));
        local.insert("authz:bob:1", Arc::new(vec![1]), ttl, InsertOptions::new("file/f2"));

        assert_eq!(InvalidationMessage::Tag("file/f2".into()).apply(&local), 1);
        assert_eq!(
            InvalidationMessage::Pattern("authz:alice:*".into()).apply(&local),
            1
        );
        assert!(local.is_empty());
    }
}

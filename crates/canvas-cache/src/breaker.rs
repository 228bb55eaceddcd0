//! Circuit breaker for the distributed tier.
//!
//! State lives in atomics so the breaker can be shared by every caller in the
//! process without a lock around the wrapped call. The `open -> half_open`
//! transition is a compare-and-swap, so exactly one caller runs the trial.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl BreakerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a trial call.
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerState {
    pub tier_id: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_failure_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub open_since: Option<OffsetDateTime>,
    pub trips: u64,
    pub rejected: u64,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without running it.
    #[error("circuit open")]
    Open,
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Sentinel for "no timestamp recorded".
const NEVER: u64 = u64::MAX;

pub struct CircuitBreaker {
    tier_id: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Milliseconds since `base`.
    open_since_ms: AtomicU64,
    last_failure_ms: AtomicU64,
    trips: AtomicU64,
    rejected: AtomicU64,
    base: Instant,
    base_wall: OffsetDateTime,
}

impl CircuitBreaker {
    pub fn new(tier_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let tier_id = tier_id.into();
        metrics::set_breaker_state(&tier_id, BreakerState::Closed as u8);
        Self {
            tier_id,
            config,
            state: AtomicU8::new(BreakerState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            open_since_ms: AtomicU64::new(NEVER),
            last_failure_ms: AtomicU64::new(NEVER),
            trips: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            base: Instant::now(),
            base_wall: OffsetDateTime::now_utc(),
        }
    }

    pub fn tier_id(&self) -> &str {
        &self.tier_id
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn now_ms(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }

    fn wall_time(&self, ms: u64) -> Option<OffsetDateTime> {
        if ms == NEVER {
            return None;
        }
        self.base_wall
            .checked_add(time::Duration::milliseconds(ms as i64))
    }

    /// Decide whether a call may proceed.
    fn acquire(&self) -> Option<Permit<'_>> {
        match self.state() {
            BreakerState::Closed => Some(Permit::new(self, false)),
            BreakerState::HalfOpen => None,
            BreakerState::Open => {
                let since = self.open_since_ms.load(Ordering::SeqCst);
                let elapsed = self.now_ms().saturating_sub(since);
                if since == NEVER || elapsed < self.config.open_duration.as_millis() as u64 {
                    return None;
                }
                self.state
                    .compare_exchange(
                        BreakerState::Open as u8,
                        BreakerState::HalfOpen as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .ok()
                    .map(|_| {
                        metrics::set_breaker_state(&self.tier_id, BreakerState::HalfOpen as u8);
                        tracing::info!(tier = %self.tier_id, "circuit half-open, allowing trial call");
                        Permit::new(self, true)
                    })
            }
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// When the breaker rejects the call the future is dropped unpolled, so
    /// no I/O is attempted.
    pub async fn call<T, E, F>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let Some(mut permit) = self.acquire() else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(BreakerError::Open);
        };
        match operation.await {
            Ok(value) => {
                permit.succeed();
                Ok(value)
            }
            Err(err) => {
                permit.fail();
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn on_success(&self, trial: bool) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if trial
            && self
                .state
                .compare_exchange(
                    BreakerState::HalfOpen as u8,
                    BreakerState::Closed as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
        {
            self.open_since_ms.store(NEVER, Ordering::SeqCst);
            metrics::set_breaker_state(&self.tier_id, BreakerState::Closed as u8);
            tracing::info!(tier = %self.tier_id, "circuit closed after successful trial");
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = self.now_ms();
        self.last_failure_ms.store(now, Ordering::SeqCst);

        if trial {
            self.open_since_ms.store(now, Ordering::SeqCst);
            self.state.store(BreakerState::Open as u8, Ordering::SeqCst);
            self.trips.fetch_add(1, Ordering::Relaxed);
            metrics::set_breaker_state(&self.tier_id, BreakerState::Open as u8);
            metrics::record_breaker_trip(&self.tier_id);
            tracing::warn!(tier = %self.tier_id, "trial call failed, circuit re-opened");
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures < self.config.failure_threshold {
            return;
        }
        // Publish the timestamp before the state so no caller observes `open`
        // with a stale `open_since`.
        self.open_since_ms.store(now, Ordering::SeqCst);
        if self
            .state
            .compare_exchange(
                BreakerState::Closed as u8,
                BreakerState::Open as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.trips.fetch_add(1, Ordering::Relaxed);
            metrics::set_breaker_state(&self.tier_id, BreakerState::Open as u8);
            metrics::record_breaker_trip(&self.tier_id);
            tracing::warn!(
                tier = %self.tier_id,
                failures,
                open_for_secs = self.config.open_duration.as_secs(),
                "circuit opened"
            );
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.open_since_ms.store(NEVER, Ordering::SeqCst);
        self.state.store(BreakerState::Closed as u8, Ordering::SeqCst);
        metrics::set_breaker_state(&self.tier_id, BreakerState::Closed as u8);
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let state = self.state();
        CircuitBreakerState {
            tier_id: self.tier_id.clone(),
            state,
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            last_failure_at: self.wall_time(self.last_failure_ms.load(Ordering::SeqCst)),
            open_since: match state {
                BreakerState::Closed => None,
                _ => self.wall_time(self.open_since_ms.load(Ordering::SeqCst)),
            },
            trips: self.trips.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("tier_id", &self.tier_id)
            .field("state", &self.state())
            .field(
                "consecutive_failures",
                &self.consecutive_failures.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// Permission to run one call. A trial permit dropped without an outcome
/// (the caller was cancelled) counts as a failed trial so the breaker never
/// stays half-open.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn succeed(&mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    fn fail(&mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.on_failure(true);
        }
    }
}

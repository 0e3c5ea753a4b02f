//! Circuit breaker guarding the publisher's broker I/O.
//!
//! ```text
//!   CLOSED --(threshold consecutive failures)--> OPEN
//!     ^                                           |
//!     |                                      cooldown elapsed
//!     |                                           v
//!     +-------(trial succeeds)------------- HALF-OPEN
//!                                                 |
//!   OPEN <---(trial fails or is abandoned)--------+
//! ```
//!
//! While open, [`CircuitBreaker::try_acquire`] rejects immediately, so no
//! I/O is attempted. Half-open admits exactly one trial call; concurrent
//! callers are rejected until that trial settles.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use linewatch_core::clock::Clock;
use linewatch_core::types::{to_chrono, Timestamp};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent open before a trial call is admitted.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of the breaker, e.g. for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Timestamp>,
}

/// Returned when the breaker refuses a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    pub retry_after: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Timestamp>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
        }
    }

    /// Ask permission for one call. The returned permit must be settled
    /// with [`CallPermit::success`] or [`CallPermit::failure`]; dropping it
    /// unsettled counts as a failure when it was the half-open trial.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, Rejected> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::Open => {
                let remaining = self.remaining_cooldown(&inner);
                if remaining.is_zero() {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!("Circuit half-open, admitting trial publish");
                    Ok(CallPermit::new(self, true))
                } else {
                    Err(Rejected {
                        retry_after: remaining,
                    })
                }
            }
            CircuitState::HalfOpen => Err(Rejected {
                retry_after: self.remaining_cooldown(&inner),
            }),
        }
    }

    fn remaining_cooldown(&self, inner: &BreakerInner) -> Duration {
        let Some(opened_at) = inner.opened_at else {
            return Duration::ZERO;
        };
        let ends_at = opened_at + to_chrono(self.config.cooldown);
        (ends_at - self.clock.now()).to_std().unwrap_or(Duration::ZERO)
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                tracing::info!("Circuit closed after successful trial");
            }
            CircuitState::Closed => inner.consecutive_failures = 0,
            // A call admitted before the circuit opened finished late.
            CircuitState::Open | CircuitState::HalfOpen => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(self.clock.now());
                tracing::warn!(
                    consecutive_failures = inner.consecutive_failures,
                    "Circuit re-opened after failed trial",
                );
            }
            CircuitState::Closed
                if inner.consecutive_failures >= self.config.failure_threshold =>
            {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(self.clock.now());
                tracing::warn!(
                    consecutive_failures = inner.consecutive_failures,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Circuit opened",
                );
            }
            _ => {}
        }
    }
}

/// Permission for a single guarded call.
#[must_use = "a permit must be settled with success() or failure()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.record_failure(true);
        }
    }
}

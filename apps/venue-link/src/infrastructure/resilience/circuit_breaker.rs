//! Circuit breaker for venue request isolation.
//!
//! Stops hammering a venue that is failing and probes it again after a
//! cool-down.
//!
//! # State Machine
//!
//! ```text
//! CLOSED → OPEN       (consecutive failures >= failure_threshold)
//! OPEN → HALF_OPEN    (reset_timeout elapsed, checked on the next execute)
//! HALF_OPEN → CLOSED  (consecutive successes >= success_threshold)
//! HALF_OPEN → OPEN    (any failure)
//! ```
//!
//! While HALF_OPEN exactly one probe call is in flight at a time; other
//! callers fail fast. Every counter update and transition happens under a
//! single lock.
//!
//! Each transition starts a new epoch and every admitted call carries the
//! epoch it was admitted in. Outcomes from an earlier epoch only update the
//! totals; they never move the state or free the probe slot.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::infrastructure::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected.
    Open,
    /// Probe calls test the dependency.
    HalfOpen,
}

impl CircuitState {
    /// Metric label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive probe successes that close it again.
    pub success_threshold: u32,
    /// Time to stay open before probing.
    pub reset_timeout: Duration,
    /// Maximum call duration; a timed-out call counts as a failure.
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            call_timeout: None,
        }
    }
}

/// Errors returned by [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open; the operation was not invoked.
    #[error("circuit '{name}' is open")]
    Open {
        /// Breaker name.
        name: String,
        /// Time until the next probe is allowed (zero while a probe is in flight).
        retry_after: Duration,
    },

    /// The operation exceeded the call timeout.
    #[error("call through circuit '{name}' timed out after {timeout:?}")]
    Timeout {
        /// Breaker name.
        name: String,
        /// Configured timeout.
        timeout: Duration,
    },

    /// The operation's own error.
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Check if the call was rejected without running.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    /// Get the operation's own error, if that is what failed.
    #[must_use]
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } | Self::Timeout { .. } => None,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    epoch: u64,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
    state_transitions: u64,
}

/// Admission granted for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Admission {
    epoch: u64,
    probe: bool,
}

/// Clears the probe slot if a probe call is dropped before it finishes.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.inner.lock();
            if inner.epoch == self.admission.epoch {
                inner.probe_in_flight = false;
            }
        }
    }
}

/// Three-state circuit breaker around async operations.
///
/// # Example
///
/// ```rust
/// use venue_link::infrastructure::resilience::{
///     CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
/// };
///
/// # tokio_test::block_on(async {
/// let breaker = CircuitBreaker::new("rest", CircuitBreakerConfig {
///     failure_threshold: 1,
///     ..CircuitBreakerConfig::default()
/// });
///
/// let failed: Result<(), _> = breaker.execute(|| async { Err("503") }).await;
/// assert!(matches!(failed, Err(CircuitBreakerError::Inner("503"))));
/// assert_eq!(breaker.state(), CircuitState::Open);
///
/// let rejected: Result<(), CircuitBreakerError<&str>> =
///     breaker.execute(|| async { Ok(()) }).await;
/// assert!(rejected.unwrap_err().is_open());
/// # });
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probe_in_flight: false,
                epoch: 0,
                total_calls: 0,
                total_failures: 0,
                total_rejections: 0,
                state_transitions: 0,
            }),
        }
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current stored state. Reading never triggers a transition.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `operation` through the breaker.
    ///
    /// # Errors
    ///
    /// - `Open` if the circuit rejects the call (operation not invoked)
    /// - `Timeout` if `call_timeout` elapsed first
    /// - `Inner` with the operation's own error
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit()?;
        let mut guard = ProbeGuard {
            breaker: self,
            admission,
            armed: admission.probe,
        };

        let result = match self.config.call_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result.map_err(CircuitBreakerError::Inner),
                Err(_) => Err(CircuitBreakerError::Timeout {
                    name: self.name.clone(),
                    timeout,
                }),
            },
            None => operation().await.map_err(CircuitBreakerError::Inner),
        };

        guard.armed = false;
        if result.is_ok() {
            self.record_success(admission);
        } else {
            self.record_failure(admission);
        }
        result
    }

    fn admit<E>(&self) -> Result<Admission, CircuitBreakerError<E>> {
        let mut inner = self.inner.lock();
        let probe = match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map_or(Duration::MAX, |t| t.elapsed());
                if elapsed >= self.config.reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    Some(true)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Some(true)
            }
            CircuitState::HalfOpen => None,
        };

        if let Some(probe) = probe {
            inner.total_calls += 1;
            return Ok(Admission {
                epoch: inner.epoch,
                probe,
            });
        }

        inner.total_rejections += 1;
        let retry_after = inner.opened_at.map_or(Duration::ZERO, |t| {
            self.config.reset_timeout.saturating_sub(t.elapsed())
        });
        drop(inner);

        metrics::record_circuit_rejection(&self.name);
        tracing::debug!(name = %self.name, "Circuit open, call rejected");
        Err(CircuitBreakerError::Open {
            name: self.name.clone(),
            retry_after,
        })
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if inner.epoch != admission.epoch {
            tracing::debug!(name = %self.name, "Ignoring success from an earlier circuit state");
            return;
        }
        inner.consecutive_successes += 1;
        inner.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
            if inner.consecutive_successes >= self.config.success_threshold {
                self.transition(&mut inner, CircuitState::Closed);
            }
        }
    }

    fn record_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        if inner.epoch != admission.epoch {
            tracing::debug!(name = %self.name, "Ignoring failure from an earlier circuit state");
            return;
        }
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;

        match inner.state {
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Closed | CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.epoch += 1;
        inner.state_transitions += 1;

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                tracing::warn!(
                    name = %self.name,
                    from = %from,
                    to = %to,
                    consecutive_failures = inner.consecutive_failures,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes = 0;
                inner.consecutive_failures = 0;
                tracing::info!(name = %self.name, from = %from, to = %to, "Circuit breaker testing");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.consecutive_failures = 0;
                inner.probe_in_flight = false;
                tracing::info!(name = %self.name, from = %from, to = %to, "Circuit breaker closed");
            }
        }
        metrics::record_circuit_transition(&self.name, to);
    }

    /// Force the circuit open (operator intervention).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Open);
    }

    /// Force the circuit closed and clear counters (operator intervention).
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
    }

    /// Metrics snapshot. Reading never triggers a transition.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            state_transitions: inner.state_transitions,
            open_for: inner.opened_at.map(|t| t.elapsed()),
        }
    }
}

/// Metrics for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Current run of failures.
    pub consecutive_failures: u32,
    /// Current run of successes.
    pub consecutive_successes: u32,
    /// Calls admitted.
    pub total_calls: u64,
    /// Admitted calls that failed.
    pub total_failures: u64,
    /// Calls rejected while open.
    pub total_rejections: u64,
    /// Number of state transitions.
    pub state_transitions: u64,
    /// Time since the circuit opened, while open or half-open.
    pub open_for: Option<Duration>,
}

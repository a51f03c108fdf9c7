//! Rate limit, retry and circuit breaking for one venue request.
//!
//! Each attempt first acquires rate-limiter capacity, then runs through the
//! circuit breaker; the retry policy wraps the pair. A disposed limiter or an
//! open circuit ends the loop at once.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use super::rate_limiter::{RateLimitError, RateLimiter};
use super::retry::RetryPolicy;

/// Errors returned by [`ResilientExecutor::execute`].
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError<E> {
    /// Rate limiter refused admission.
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    /// Circuit breaker rejection, timeout or the operation's own error.
    #[error(transparent)]
    Circuit(#[from] CircuitBreakerError<E>),
}

impl<E> ExecutorError<E> {
    /// Get the operation's own error, if that is what failed.
    #[must_use]
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Circuit(error) => error.into_inner(),
            Self::RateLimit(_) => None,
        }
    }

    /// Check if the circuit rejected the call.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::Circuit(error) if error.is_open())
    }
}

/// Shared request pipeline for one venue.
#[derive(Debug, Clone)]
pub struct ResilientExecutor {
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl ResilientExecutor {
    /// Create an executor from shared components.
    #[must_use]
    pub const fn new(
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            limiter,
            breaker,
            retry,
        }
    }

    /// Rate limiter.
    #[must_use]
    pub const fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Circuit breaker.
    #[must_use]
    pub const fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Retry policy.
    #[must_use]
    pub const fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run `operation` under the `operation_key` rate-limit weight.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted or a
    /// non-retryable error occurs.
    pub async fn execute<T, E, F, Fut, P>(
        &self,
        operation_key: &str,
        mut operation: F,
        is_retryable: P,
    ) -> Result<T, ExecutorError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let limiter = &self.limiter;
        let breaker = &self.breaker;

        self.retry
            .execute(
                || {
                    let call = operation();
                    async move {
                        limiter
                            .acquire(operation_key)
                            .await
                            .map_err(ExecutorError::RateLimit)?;
                        breaker
                            .execute(move || call)
                            .await
                            .map_err(ExecutorError::Circuit)
                    }
                },
                |error: &ExecutorError<E>| match error {
                    ExecutorError::RateLimit(_)
                    | ExecutorError::Circuit(CircuitBreakerError::Open { .. }) => false,
                    ExecutorError::Circuit(CircuitBreakerError::Timeout { .. }) => true,
                    ExecutorError::Circuit(CircuitBreakerError::Inner(inner)) => is_retryable(inner),
                },
            )
            .await
    }
}

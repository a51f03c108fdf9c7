//! Exponential-backoff retry for idempotent requests.
//!
//! The caller decides what is retryable: [`RetryPolicy::execute`] takes a
//! predicate over the operation's error, so non-idempotent operations are
//! only retried when the caller opts in. The last error is returned as-is.
//!
//! Composed with a [`CircuitBreaker`], an open circuit ends the retry loop
//! immediately instead of spending the remaining attempts on a known-down
//! dependency.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use super::backoff::{apply_jitter, backoff_delay};
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::infrastructure::metrics;

/// Retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Backoff growth factor.
    pub multiplier: f64,
    /// Jitter fraction applied to each delay (0 disables jitter).
    pub jitter: f64,
    /// HTTP statuses worth retrying.
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.0,
            retryable_statuses: default_retryable_statuses(),
        }
    }
}

/// 408, 429 and every 5xx.
#[must_use]
pub fn default_retryable_statuses() -> Vec<u16> {
    [408, 429].into_iter().chain(500..=599).collect()
}

/// Retry wrapper around async operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    name: String,
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a named policy.
    #[must_use]
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// Policy name (metric label).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Policy configuration.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Check if an HTTP status is in the retryable set.
    #[must_use]
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.config.retryable_statuses.contains(&status)
    }

    /// Delay before retry number `retry` (1-based), jitter included.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = backoff_delay(
            self.config.initial_delay,
            self.config.max_delay,
            self.config.multiplier,
            retry,
        );
        apply_jitter(base, self.config.jitter)
    }

    /// Invoke `operation` until it succeeds, the error is not retryable, or
    /// attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `operation`, unchanged.
    pub async fn execute<T, E, F, Fut, P>(&self, mut operation: F, is_retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if attempt >= max_attempts || !is_retryable(&error) {
                if attempt > 1 {
                    tracing::warn!(
                        policy = %self.name,
                        attempts = attempt,
                        error = %error,
                        "Request failed after retries"
                    );
                }
                return Err(error);
            }

            let delay = self.delay_for(attempt);
            tracing::debug!(
                policy = %self.name,
                attempt,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Retrying request"
            );
            metrics::record_retry(&self.name);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Retry `operation` through `breaker`.
    ///
    /// An open circuit is never retried; call timeouts are; the operation's
    /// own errors go through `is_retryable`.
    ///
    /// # Errors
    ///
    /// Returns the last [`CircuitBreakerError`].
    pub async fn execute_with_breaker<T, E, F, Fut, P>(
        &self,
        breaker: &CircuitBreaker,
        mut operation: F,
        is_retryable: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: fmt::Display,
    {
        self.execute(
            || {
                let call = operation();
                breaker.execute(move || call)
            },
            |error: &CircuitBreakerError<E>| match error {
                CircuitBreakerError::Open { .. } => false,
                CircuitBreakerError::Timeout { .. } => true,
                CircuitBreakerError::Inner(inner) => is_retryable(inner),
            },
        )
        .await
    }
}

//! Weighted token-bucket rate limiter.
//!
//! Each logical operation consumes `weight(operation)` tokens. Tokens refill
//! lazily from elapsed time on every acquire; a caller that finds too few
//! tokens sleeps for exactly the time the deficit needs, then checks again.
//!
//! Waiters are served in arrival order: acquires pass through a fair
//! `tokio::sync::Mutex` turnstile, so a heavy request at the head of the
//! line is never overtaken by lighter ones behind it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::metrics;

/// Float slack so a refill computed to the exact deficit is accepted.
const TOKEN_EPSILON: f64 = 1e-9;

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Maximum tokens held by the bucket.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate_per_second: f64,
    /// Per-operation weights. Unlisted operations weigh 1.
    pub weights: HashMap<String, f64>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_rate_per_second: 10.0,
            weights: HashMap::new(),
        }
    }
}

fn is_valid_amount(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

impl RateLimiterConfig {
    /// Replace negative or non-finite values with defaults and drop such weights.
    fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        if !is_valid_amount(self.capacity) {
            tracing::warn!(capacity = self.capacity, "Invalid rate limiter capacity, using default");
            self.capacity = defaults.capacity;
        }
        if !is_valid_amount(self.refill_rate_per_second) {
            tracing::warn!(
                refill_rate_per_second = self.refill_rate_per_second,
                "Invalid rate limiter refill rate, using default"
            );
            self.refill_rate_per_second = defaults.refill_rate_per_second;
        }
        self.weights.retain(|operation, weight| {
            let valid = is_valid_amount(*weight);
            if !valid {
                tracing::warn!(operation = %operation, weight = *weight, "Invalid operation weight ignored");
            }
            valid
        });
        self
    }

    /// Create a config with no custom weights.
    #[must_use]
    pub fn new(capacity: f64, refill_rate_per_second: f64) -> Self {
        Self {
            capacity,
            refill_rate_per_second,
            weights: HashMap::new(),
        }
    }

    /// Set the weight of one operation.
    #[must_use]
    pub fn with_weight(mut self, operation: impl Into<String>, weight: f64) -> Self {
        self.weights.insert(operation.into(), weight);
        self
    }
}

/// Rate limiter errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    /// The limiter was destroyed; pending and future acquires fail.
    #[error("rate limiter has been disposed")]
    Disposed,

    /// The operation can never be admitted by this bucket.
    #[error("operation '{operation}' weighs {weight} tokens but capacity is {capacity}")]
    WeightExceedsCapacity {
        /// Operation key.
        operation: String,
        /// Configured weight.
        weight: f64,
        /// Bucket capacity.
        capacity: f64,
    },
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn refilled(&self, now: Instant, config: &RateLimiterConfig) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * config.refill_rate_per_second).min(config.capacity)
    }
}

/// Decrements the waiter count when an acquire finishes or is dropped.
struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Token-bucket admission control shared by all callers of one venue.
///
/// # Example
///
/// ```rust
/// use venue_link::infrastructure::resilience::{RateLimiter, RateLimiterConfig};
///
/// # tokio_test::block_on(async {
/// let limiter = RateLimiter::new(RateLimiterConfig::new(10.0, 5.0).with_weight("orders", 4.0));
/// limiter.acquire("orders").await.unwrap();
/// limiter.acquire("ticker").await.unwrap();
/// assert!(limiter.available_tokens() <= 5.0 + 1e-6);
/// # });
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    bucket: Mutex<TokenBucket>,
    turnstile: tokio::sync::Mutex<()>,
    waiters: AtomicUsize,
    disposed: CancellationToken,
}

impl RateLimiter {
    /// Create a limiter with a full bucket.
    ///
    /// Negative or non-finite capacity and refill rate fall back to the
    /// defaults; such weights are dropped so those operations weigh 1.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        let config = config.sanitized();
        let tokens = config.capacity;
        Self {
            config,
            bucket: Mutex::new(TokenBucket {
                tokens,
                last_refill: Instant::now(),
            }),
            turnstile: tokio::sync::Mutex::new(()),
            waiters: AtomicUsize::new(0),
            disposed: CancellationToken::new(),
        }
    }

    /// Limiter configuration.
    #[must_use]
    pub const fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Weight of an operation (1 when not configured).
    #[must_use]
    pub fn weight(&self, operation: &str) -> f64 {
        self.config.weights.get(operation).copied().unwrap_or(1.0)
    }

    /// Wait until the bucket covers `weight(operation)`, then deduct it.
    ///
    /// # Errors
    ///
    /// - `Disposed` if the limiter is destroyed before or while waiting
    /// - `WeightExceedsCapacity` if the weight can never be satisfied
    pub async fn acquire(&self, operation: &str) -> Result<(), RateLimitError> {
        if self.disposed.is_cancelled() {
            return Err(RateLimitError::Disposed);
        }

        let weight = self.weight(operation);
        if weight > self.config.capacity {
            return Err(RateLimitError::WeightExceedsCapacity {
                operation: operation.to_string(),
                weight,
                capacity: self.config.capacity,
            });
        }

        self.waiters.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaiterGuard(&self.waiters);
        let started = Instant::now();

        let _turn = tokio::select! {
            biased;
            () = self.disposed.cancelled() => return Err(RateLimitError::Disposed),
            turn = self.turnstile.lock() => turn,
        };

        loop {
            let Some(wait) = self.try_take(weight) else {
                let waited = started.elapsed();
                if !waited.is_zero() {
                    tracing::debug!(
                        operation,
                        weight,
                        waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                        "Rate limiter admitted after wait"
                    );
                    metrics::record_rate_limit_wait(operation, waited);
                }
                return Ok(());
            };

            tracing::trace!(
                operation,
                weight,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "Waiting for tokens"
            );
            tokio::select! {
                biased;
                () = self.disposed.cancelled() => return Err(RateLimitError::Disposed),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Deduct `weight` if available, otherwise return how long the deficit takes to refill.
    fn try_take(&self, weight: f64) -> Option<Duration> {
        let now = Instant::now();
        let mut bucket = self.bucket.lock();
        bucket.tokens = bucket.refilled(now, &self.config);
        bucket.last_refill = now;

        if bucket.tokens + TOKEN_EPSILON >= weight {
            bucket.tokens = (bucket.tokens - weight).clamp(0.0, self.config.capacity);
            return None;
        }

        let deficit = weight - bucket.tokens;
        let seconds = deficit / self.config.refill_rate_per_second;
        Some(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX))
    }

    /// Tokens available right now. Does not modify the bucket.
    #[must_use]
    pub fn available_tokens(&self) -> f64 {
        self.bucket.lock().refilled(Instant::now(), &self.config)
    }

    /// Number of acquires currently in progress.
    #[must_use]
    pub fn queued_waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Check if the limiter has been destroyed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    /// Destroy the limiter: wake every waiter with `Disposed` and reject
    /// future acquires.
    pub fn destroy(&self) {
        if !self.disposed.is_cancelled() {
            tracing::info!(waiters = self.queued_waiters(), "Rate limiter disposed");
            self.disposed.cancel();
        }
    }
}

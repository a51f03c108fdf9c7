//! Resilience patterns for venue requests.
//!
//! - **rate_limiter**: Weighted token bucket with FIFO waiters
//! - **circuit_breaker**: Three-state breaker with single-probe recovery
//! - **retry**: Exponential-backoff retry with caller-supplied predicate
//! - **executor**: Limiter, retry and breaker composed for one request
//! - **backoff**: Delay formula shared with the reconnect loop

pub mod backoff;
pub mod circuit_breaker;
pub mod executor;
pub mod rate_limiter;
pub mod retry;

pub use backoff::{apply_jitter, backoff_delay};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerMetrics, CircuitState,
};
pub use executor::{ExecutorError, ResilientExecutor};
pub use rate_limiter::{RateLimitError, RateLimiter, RateLimiterConfig};
pub use retry::{RetryConfig, RetryPolicy, default_retryable_statuses};

//! Exponential backoff with symmetric jitter.
//!
//! Shared by the reconnect loop and the request retry policy:
//!
//! ```text
//! base(n)   = min(initial * multiplier^(n-1), max)        n >= 1
//! jitter(d) = d + d * fraction * U(-0.5, 0.5), clamped >= 0
//! ```

use std::time::Duration;

use rand::Rng;

/// Base delay before attempt `attempt` (1-based), without jitter.
///
/// Attempt `0` is treated as attempt `1`.
#[must_use]
pub fn backoff_delay(
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
) -> Duration {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let scaled = initial.as_secs_f64() * multiplier.powi(exponent);
    if !scaled.is_finite() || scaled >= max.as_secs_f64() {
        return max;
    }
    if scaled <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(scaled)
}

/// Adjust `delay` by `delay * fraction * U(-0.5, 0.5)`, never below zero.
#[must_use]
pub fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || delay.is_zero() {
        return delay;
    }
    let base = delay.as_secs_f64();
    let offset: f64 = rand::rng().random_range(-0.5..=0.5);
    let adjusted = offset.mul_add(base * fraction, base);
    if adjusted.is_finite() && adjusted > 0.0 {
        Duration::from_secs_f64(adjusted)
    } else {
        Duration::ZERO
    }
}

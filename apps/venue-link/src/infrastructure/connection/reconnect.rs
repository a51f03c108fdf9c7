//! Reconnection Policy
//!
//! Implements exponential backoff with jitter for WebSocket reconnection.
//! The attempt counter only resets after a successful open, so a flapping
//! endpoint keeps backing off until the attempt budget is spent.

use std::time::Duration;

use crate::infrastructure::resilience::backoff::{apply_jitter, backoff_delay};

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Whether unexpected closes trigger reconnection.
    pub enabled: bool,
    /// Maximum number of reconnection attempts (0 = unlimited).
    pub max_attempts: u32,
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
    /// Jitter fraction; the delay moves by at most `delay * jitter / 2` either way.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl ReconnectConfig {
    /// Configuration that never reconnects.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Reconnection policy implementing exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use venue_link::infrastructure::connection::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig {
///     max_attempts: 2,
///     jitter: 0.0,
///     initial_delay: Duration::from_millis(100),
///     ..ReconnectConfig::default()
/// });
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(200)));
/// assert_eq!(policy.next_delay(), None);
///
/// // Simulate successful connection
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Advance to the next attempt and return its jittered delay.
    ///
    /// Returns `None` if reconnection is disabled or max attempts have been
    /// used.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempt_count += 1;
        Some(apply_jitter(self.base_delay(self.attempt_count), self.config.jitter))
    }

    /// Delay before attempt `attempt`, without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.config.initial_delay,
            self.config.max_delay,
            self.config.multiplier,
            attempt,
        )
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Get the current attempt count.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check if reconnection should continue.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.enabled
            && (self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts)
    }

    /// Policy configuration.
    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            enabled: true,
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert!(config.enabled);
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!((config.jitter - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn policy_exponential_backoff() {
        let mut policy = ReconnectPolicy::new(exact(0));

        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(800)));
    }

    #[test]
    fn policy_max_delay_cap() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(2000),
            multiplier: 4.0,
            ..exact(0)
        });

        let _ = policy.next_delay();
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn policy_max_attempts() {
        let mut policy = ReconnectPolicy::new(exact(3));

        assert!(policy.next_delay().is_some());
        assert_eq!(policy.attempt_count(), 1);
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert_eq!(policy.attempt_count(), 3);

        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
        assert_eq!(policy.attempt_count(), 3);
    }

    #[test]
    fn policy_reset() {
        let mut policy = ReconnectPolicy::new(exact(3));
        let _ = policy.next_delay();
        let _ = policy.next_delay();

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert!(policy.should_retry());
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn disabled_policy_never_retries() {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::disabled());
        assert!(!policy.should_retry());
        assert!(policy.next_delay().is_none());
    }

    #[test]
    fn policy_jitter_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(1000),
                jitter: 0.2,
                ..exact(0)
            });

            let millis = policy.next_delay().unwrap().as_millis();
            // ±(1000 * 0.2 / 2)
            assert!(millis >= 900, "delay {millis}ms is below minimum 900ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }

    #[test]
    fn unlimited_attempts() {
        let mut policy = ReconnectPolicy::new(exact(0));
        for _ in 0..1000 {
            assert!(policy.next_delay().is_some());
        }
    }
}

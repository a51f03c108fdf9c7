//! Venue Link Configuration Settings
//!
//! Configuration for the operator binary, loaded from `VENUE_*` environment
//! variables. Unset or unparsable values fall back to the component
//! defaults; only `VENUE_WS_URL` is required.

use std::collections::HashMap;
use std::time::Duration;

use crate::application::services::SubscriptionManagerConfig;
use crate::domain::streaming::OutboundPayload;
use crate::infrastructure::connection::{ConnectionConfig, HeartbeatConfig, ReconnectConfig};
use crate::infrastructure::resilience::{CircuitBreakerConfig, RateLimiterConfig, RetryConfig};

/// Connection name used when none is configured.
const DEFAULT_CONNECTION_NAME: &str = "venue";

// =============================================================================
// Settings Types
// =============================================================================

/// HTTP server settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Port for health checks and Prometheus metrics.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8082 }
    }
}

/// Channel the binary watches and logs.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchSettings {
    /// Channel name matched against routed messages.
    pub channel: String,
    /// Payload that subscribes to the channel.
    pub subscribe_message: OutboundPayload,
    /// Payload sent when the watch ends.
    pub unsubscribe_message: Option<OutboundPayload>,
}

/// Complete configuration for one venue link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSettings {
    /// Endpoint, reconnect and heartbeat settings.
    pub connection: ConnectionConfig,
    /// Request rate limiting.
    pub rate_limiter: RateLimiterConfig,
    /// Circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry policy.
    pub retry: RetryConfig,
    /// Subscription manager settings.
    pub subscriptions: SubscriptionManagerConfig,
    /// HTTP server settings.
    pub server: ServerSettings,
    /// Optional channel to watch.
    pub watch: Option<WatchSettings>,
}

impl LinkSettings {
    /// Create settings for `url` with every other option at its default.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url).with_name(DEFAULT_CONNECTION_NAME),
            rate_limiter: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            subscriptions: SubscriptionManagerConfig::default(),
            server: ServerSettings::default(),
            watch: None,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `VENUE_WS_URL` is missing, empty or not a
    /// WebSocket URL, or if `VENUE_WATCH_CHANNEL` is set without
    /// `VENUE_SUBSCRIBE_MESSAGE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Same as [`LinkSettings::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let url = env.required("VENUE_WS_URL")?;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                key: "VENUE_WS_URL".to_string(),
                value: url,
            });
        }

        let defaults = Self::new(url);

        let reconnect_defaults = ReconnectConfig::default();
        let reconnect = ReconnectConfig {
            enabled: env.bool("VENUE_RECONNECT_ENABLED", reconnect_defaults.enabled),
            max_attempts: env.u32("VENUE_RECONNECT_MAX_ATTEMPTS", reconnect_defaults.max_attempts),
            initial_delay: env.millis(
                "VENUE_RECONNECT_INITIAL_DELAY_MS",
                reconnect_defaults.initial_delay,
            ),
            max_delay: env.millis("VENUE_RECONNECT_MAX_DELAY_MS", reconnect_defaults.max_delay),
            multiplier: env.f64("VENUE_RECONNECT_MULTIPLIER", reconnect_defaults.multiplier),
            jitter: env.f64("VENUE_RECONNECT_JITTER", reconnect_defaults.jitter),
        };

        let heartbeat_defaults = HeartbeatConfig::default();
        let heartbeat = HeartbeatConfig {
            enabled: env.bool("VENUE_HEARTBEAT_ENABLED", heartbeat_defaults.enabled),
            interval: env.millis("VENUE_HEARTBEAT_INTERVAL_MS", heartbeat_defaults.interval),
            timeout: env.millis("VENUE_HEARTBEAT_TIMEOUT_MS", heartbeat_defaults.timeout),
            ping_payload: env
                .non_empty("VENUE_HEARTBEAT_PING_PAYLOAD")
                .map(|raw| parse_payload(&raw)),
        };

        let limiter_defaults = defaults.rate_limiter;
        let rate_limiter = RateLimiterConfig {
            capacity: env.f64("VENUE_RATE_LIMIT_CAPACITY", limiter_defaults.capacity),
            refill_rate_per_second: env.f64(
                "VENUE_RATE_LIMIT_REFILL_PER_SEC",
                limiter_defaults.refill_rate_per_second,
            ),
            weights: env
                .non_empty("VENUE_RATE_LIMIT_WEIGHTS")
                .map_or(limiter_defaults.weights, |raw| parse_weights(&raw)),
        };

        let breaker_defaults = defaults.circuit_breaker;
        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: env.u32(
                "VENUE_BREAKER_FAILURE_THRESHOLD",
                breaker_defaults.failure_threshold,
            ),
            success_threshold: env.u32(
                "VENUE_BREAKER_SUCCESS_THRESHOLD",
                breaker_defaults.success_threshold,
            ),
            reset_timeout: env.millis(
                "VENUE_BREAKER_RESET_TIMEOUT_MS",
                breaker_defaults.reset_timeout,
            ),
            call_timeout: breaker_defaults.call_timeout,
        };

        let retry_defaults = defaults.retry;
        let retry = RetryConfig {
            max_attempts: env.u32("VENUE_RETRY_MAX_ATTEMPTS", retry_defaults.max_attempts),
            initial_delay: env.millis("VENUE_RETRY_INITIAL_DELAY_MS", retry_defaults.initial_delay),
            max_delay: env.millis("VENUE_RETRY_MAX_DELAY_MS", retry_defaults.max_delay),
            multiplier: env.f64("VENUE_RETRY_MULTIPLIER", retry_defaults.multiplier),
            jitter: retry_defaults.jitter,
            retryable_statuses: env
                .non_empty("VENUE_RETRY_STATUSES")
                .and_then(|raw| parse_statuses(&raw))
                .unwrap_or(retry_defaults.retryable_statuses),
        };

        let server = ServerSettings {
            health_port: env.u16("VENUE_HEALTH_PORT", defaults.server.health_port),
        };

        let watch = match env.non_empty("VENUE_WATCH_CHANNEL") {
            Some(channel) => {
                let subscribe = env.required("VENUE_SUBSCRIBE_MESSAGE")?;
                Some(WatchSettings {
                    channel,
                    subscribe_message: parse_payload(&subscribe),
                    unsubscribe_message: env
                        .non_empty("VENUE_UNSUBSCRIBE_MESSAGE")
                        .map(|raw| parse_payload(&raw)),
                })
            }
            None => None,
        };

        Ok(Self {
            connection: defaults
                .connection
                .with_reconnect(reconnect)
                .with_heartbeat(heartbeat),
            rate_limiter,
            circuit_breaker,
            retry,
            subscriptions: defaults.subscriptions,
            server,
            watch,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable is present but unusable.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
}

// =============================================================================
// Parsing Helpers
// =============================================================================

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = (self.0)(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value.to_string())
    }

    fn non_empty(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.non_empty(key).and_then(|v| v.parse().ok())
    }

    fn u16(&self, key: &str, default: u16) -> u16 {
        self.parsed(key).unwrap_or(default)
    }

    fn u32(&self, key: &str, default: u32) -> u32 {
        self.parsed(key).unwrap_or(default)
    }

    fn f64(&self, key: &str, default: f64) -> f64 {
        self.parsed::<f64>(key)
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(default)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.parsed::<u64>(key).map_or(default, Duration::from_millis)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        match self.non_empty(key).map(|v| v.to_lowercase()).as_deref() {
            Some("true" | "1" | "yes" | "on") => true,
            Some("false" | "0" | "no" | "off") => false,
            _ => default,
        }
    }
}

/// JSON when the text parses as JSON, otherwise a verbatim text frame.
fn parse_payload(raw: &str) -> OutboundPayload {
    serde_json::from_str::<serde_json::Value>(raw)
        .map_or_else(|_| OutboundPayload::Text(raw.to_string()), OutboundPayload::Json)
}

/// `orders=5,cancel=2`; malformed entries are skipped.
fn parse_weights(raw: &str) -> HashMap<String, f64> {
    raw.split(',')
        .filter_map(|entry| {
            let (operation, weight) = entry.split_once('=')?;
            let operation = operation.trim();
            let weight: f64 = weight.trim().parse().ok()?;
            (!operation.is_empty() && weight.is_finite() && weight >= 0.0)
                .then(|| (operation.to_string(), weight))
        })
        .collect()
}

/// `429,503`; `None` when no entry is a valid status code.
fn parse_statuses(raw: &str) -> Option<Vec<u16>> {
    let statuses: Vec<u16> = raw
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .filter(|s| (100..=599).contains(s))
        .collect();
    (!statuses.is_empty()).then_some(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_only_url_is_set() {
        let settings =
            LinkSettings::from_lookup(lookup(&[("VENUE_WS_URL", "wss://venue.test/ws")])).unwrap();

        assert_eq!(settings, LinkSettings::new("wss://venue.test/ws"));
        assert_eq!(settings.connection.name, DEFAULT_CONNECTION_NAME);
        assert_eq!(settings.server.health_port, 8082);
        assert!(settings.watch.is_none());
    }

    #[test]
    fn missing_url_is_an_error() {
        let err = LinkSettings::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "VENUE_WS_URL"));
    }

    #[test]
    fn empty_url_is_an_error() {
        let err = LinkSettings::from_lookup(lookup(&[("VENUE_WS_URL", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(key) if key == "VENUE_WS_URL"));
    }

    #[test]
    fn non_websocket_url_is_rejected() {
        let err =
            LinkSettings::from_lookup(lookup(&[("VENUE_WS_URL", "https://venue.test")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn reads_every_component() {
        let settings = LinkSettings::from_lookup(lookup(&[
            ("VENUE_WS_URL", "ws://127.0.0.1:9000"),
            ("VENUE_RECONNECT_ENABLED", "false"),
            ("VENUE_RECONNECT_MAX_ATTEMPTS", "3"),
            ("VENUE_RECONNECT_INITIAL_DELAY_MS", "250"),
            ("VENUE_RECONNECT_MAX_DELAY_MS", "5000"),
            ("VENUE_RECONNECT_MULTIPLIER", "1.5"),
            ("VENUE_RECONNECT_JITTER", "0"),
            ("VENUE_HEARTBEAT_ENABLED", "no"),
            ("VENUE_HEARTBEAT_INTERVAL_MS", "15000"),
            ("VENUE_HEARTBEAT_TIMEOUT_MS", "4000"),
            ("VENUE_HEARTBEAT_PING_PAYLOAD", r#"{"op":"ping"}"#),
            ("VENUE_RATE_LIMIT_CAPACITY", "20"),
            ("VENUE_RATE_LIMIT_REFILL_PER_SEC", "5"),
            ("VENUE_RATE_LIMIT_WEIGHTS", "orders=5, cancel=2"),
            ("VENUE_BREAKER_FAILURE_THRESHOLD", "7"),
            ("VENUE_BREAKER_SUCCESS_THRESHOLD", "1"),
            ("VENUE_BREAKER_RESET_TIMEOUT_MS", "60000"),
            ("VENUE_RETRY_MAX_ATTEMPTS", "4"),
            ("VENUE_RETRY_INITIAL_DELAY_MS", "50"),
            ("VENUE_RETRY_MAX_DELAY_MS", "2000"),
            ("VENUE_RETRY_MULTIPLIER", "3"),
            ("VENUE_RETRY_STATUSES", "429, 503"),
            ("VENUE_HEALTH_PORT", "9100"),
        ]))
        .unwrap();

        let reconnect = &settings.connection.reconnect;
        assert!(!reconnect.enabled);
        assert_eq!(reconnect.max_attempts, 3);
        assert_eq!(reconnect.initial_delay, Duration::from_millis(250));
        assert_eq!(reconnect.max_delay, Duration::from_secs(5));
        assert!((reconnect.multiplier - 1.5).abs() < f64::EPSILON);
        assert!(reconnect.jitter.abs() < f64::EPSILON);

        let heartbeat = &settings.connection.heartbeat;
        assert!(!heartbeat.enabled);
        assert_eq!(heartbeat.interval, Duration::from_secs(15));
        assert_eq!(heartbeat.timeout, Duration::from_secs(4));
        assert_eq!(
            heartbeat.ping_payload,
            Some(OutboundPayload::Json(serde_json::json!({"op": "ping"})))
        );

        assert!((settings.rate_limiter.capacity - 20.0).abs() < f64::EPSILON);
        assert!((settings.rate_limiter.refill_rate_per_second - 5.0).abs() < f64::EPSILON);
        assert_eq!(settings.rate_limiter.weights.get("orders"), Some(&5.0));
        assert_eq!(settings.rate_limiter.weights.get("cancel"), Some(&2.0));

        assert_eq!(settings.circuit_breaker.failure_threshold, 7);
        assert_eq!(settings.circuit_breaker.success_threshold, 1);
        assert_eq!(settings.circuit_breaker.reset_timeout, Duration::from_secs(60));

        assert_eq!(settings.retry.max_attempts, 4);
        assert_eq!(settings.retry.initial_delay, Duration::from_millis(50));
        assert_eq!(settings.retry.max_delay, Duration::from_secs(2));
        assert_eq!(settings.retry.retryable_statuses, vec![429, 503]);

        assert_eq!(settings.server.health_port, 9100);
    }

    #[test]
    fn unparsable_values_fall_back_to_defaults() {
        let settings = LinkSettings::from_lookup(lookup(&[
            ("VENUE_WS_URL", "ws://localhost"),
            ("VENUE_RECONNECT_MAX_ATTEMPTS", "many"),
            ("VENUE_RECONNECT_MULTIPLIER", "-2"),
            ("VENUE_HEARTBEAT_ENABLED", "maybe"),
            ("VENUE_RETRY_STATUSES", "abc,700"),
            ("VENUE_HEALTH_PORT", "70000"),
        ]))
        .unwrap();

        assert_eq!(settings, LinkSettings::new("ws://localhost"));
    }

    #[test]
    fn watch_requires_subscribe_message() {
        let err = LinkSettings::from_lookup(lookup(&[
            ("VENUE_WS_URL", "ws://localhost"),
            ("VENUE_WATCH_CHANNEL", "trades:BTC-USD"),
        ]))
        .unwrap_err();

        assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "VENUE_SUBSCRIBE_MESSAGE"));
    }

    #[test]
    fn watch_settings() {
        let settings = LinkSettings::from_lookup(lookup(&[
            ("VENUE_WS_URL", "ws://localhost"),
            ("VENUE_WATCH_CHANNEL", "trades:BTC-USD"),
            ("VENUE_SUBSCRIBE_MESSAGE", r#"{"op":"subscribe","channel":"trades:BTC-USD"}"#),
            ("VENUE_UNSUBSCRIBE_MESSAGE", "UNSUB trades:BTC-USD"),
        ]))
        .unwrap();

        let watch = settings.watch.unwrap();
        assert_eq!(watch.channel, "trades:BTC-USD");
        assert!(matches!(watch.subscribe_message, OutboundPayload::Json(_)));
        assert_eq!(
            watch.unsubscribe_message,
            Some(OutboundPayload::Text("UNSUB trades:BTC-USD".to_string()))
        );
    }

    #[test_case("orders=5", &[("orders", 5.0)] ; "single entry")]
    #[test_case("orders=5,,cancel=x,=3", &[("orders", 5.0)] ; "malformed entries skipped")]
    #[test_case(" a = 1.5 , b=0 ", &[("a", 1.5), ("b", 0.0)] ; "whitespace trimmed")]
    fn weight_parsing(raw: &str, expected: &[(&str, f64)]) {
        let weights = parse_weights(raw);
        assert_eq!(weights.len(), expected.len());
        for (operation, weight) in expected {
            assert_eq!(weights.get(*operation), Some(weight));
        }
    }

    #[test_case("ping", OutboundPayload::Text("ping".to_string()) ; "plain text")]
    #[test_case("42", OutboundPayload::Json(serde_json::json!(42)) ; "json number")]
    #[test_case(r#"{"op":"ping"}"#, OutboundPayload::Json(serde_json::json!({"op": "ping"})) ; "json object")]
    fn payload_parsing(raw: &str, expected: OutboundPayload) {
        assert_eq!(parse_payload(raw), expected);
    }
}

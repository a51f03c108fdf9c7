#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_precision_loss
    )
)]

//! Venue Link - Resilient Venue Connectivity
//!
//! One long-lived WebSocket connection per trading venue, kept alive with
//! heartbeats and exponential-backoff reconnection, with channel
//! subscriptions multiplexed over it and replayed after every reconnect.
//! Request-side calls go through a weighted rate limiter, a retry policy
//! and a circuit breaker.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Plain data and invariants
//!   - `streaming`: Inbound/outbound payloads, routed messages, bounded queue
//!   - `subscription`: Subscription records and the ordered registry
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport and message parser seams
//!   - `services`: Subscription manager and pull-based watches
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `connection`: Connection client, reconnect policy, heartbeat
//!   - `resilience`: Rate limiter, circuit breaker, retry, executor
//!   - `codec`: Frame decoding and the JSON envelope parser
//!   - `broadcast`: Event fan-out
//!   - `config`, `health`, `metrics`, `telemetry`: Operator plumbing
//!
//! # Data Flow
//!
//! ```text
//!             ┌──────────────────┐ frames ┌──────────────────────┐
//! Venue WS ◄─►│ ConnectionClient │───────►│ SubscriptionManager  │──► handler
//!             │ reconnect + ping │ events │ parse, route by chan │──► Watch queue
//!             └──────────────────┘        └──────────────────────┘──► Watch queue
//!                      ▲ replay subscriptions on every reopen │
//!                      └──────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{BoundedQueue, InboundPayload, MAX_QUEUE_SIZE, OutboundPayload, StreamMessage};
pub use domain::subscription::{Channel, HandlerError, MessageHandler, SubscriptionId};

// Ports
pub use application::ports::{Frame, MessageParser, Transport, TransportConnector, TransportError};

// Subscription service
pub use application::services::{
    SubscriptionError, SubscriptionEvent, SubscriptionManager, SubscriptionManagerConfig,
    SubscriptionStats, Watch,
};

// Connection
pub use infrastructure::connection::{
    ConnectionClient, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionState,
    ConnectionStats, HeartbeatConfig, ReconnectConfig, TungsteniteConnector,
};

// Resilience
pub use infrastructure::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, ExecutorError,
    RateLimitError, RateLimiter, RateLimiterConfig, ResilientExecutor, RetryConfig, RetryPolicy,
};

// Parsing
pub use infrastructure::codec::JsonEnvelopeParser;

// Infrastructure config
pub use infrastructure::config::{ConfigError, LinkSettings, ServerSettings, WatchSettings};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};

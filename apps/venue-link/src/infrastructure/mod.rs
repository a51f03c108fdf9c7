//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the resilience primitives shared
//! by every venue call.

/// Event fan-out to any number of listeners.
pub mod broadcast;

/// Frame encoding and the default message parser.
pub mod codec;

/// Environment-driven configuration.
pub mod config;

/// Reconnecting, heartbeated venue connection.
pub mod connection;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Rate limiting, circuit breaking and retries.
pub mod resilience;

/// OpenTelemetry tracing integration.
pub mod telemetry;

//! Prometheus Metrics Module
//!
//! Exposes connectivity metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Connection**: State, frames in/out, reconnect attempts, heartbeat timeouts
//! - **Subscriptions**: Active subscriptions, queue overflow drops, handler failures
//! - **Admission**: Rate-limiter wait time
//! - **Isolation**: Circuit transitions and fail-fast rejections, request retries
//!
//! Recording functions are no-ops until [`init_metrics`] installs a recorder.
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::infrastructure::connection::ConnectionState;
use crate::infrastructure::resilience::CircuitState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed (for example
/// because another recorder already owns it).
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Connection
    describe_gauge!(
        "venue_link_connection_state",
        "Connection state (0=disconnected, 1=connecting, 2=connected, 3=disconnecting)"
    );
    describe_counter!(
        "venue_link_messages_received_total",
        "Total frames received from the venue"
    );
    describe_counter!(
        "venue_link_messages_sent_total",
        "Total frames written to the venue"
    );
    describe_counter!(
        "venue_link_reconnect_attempts_total",
        "Total reconnection attempts"
    );
    describe_counter!(
        "venue_link_heartbeat_timeouts_total",
        "Total connections reset by the heartbeat watchdog"
    );

    // Subscriptions
    describe_gauge!(
        "venue_link_subscriptions_active",
        "Number of active channel subscriptions"
    );
    describe_counter!(
        "venue_link_queue_overflow_total",
        "Total messages dropped from full watch queues"
    );
    describe_counter!(
        "venue_link_handler_failures_total",
        "Total subscriber callback failures"
    );

    // Admission
    describe_histogram!(
        "venue_link_rate_limit_wait_seconds",
        "Time spent waiting for rate-limiter tokens"
    );

    // Isolation
    describe_counter!(
        "venue_link_circuit_transitions_total",
        "Total circuit breaker state transitions"
    );
    describe_counter!(
        "venue_link_circuit_rejections_total",
        "Total calls rejected by an open circuit"
    );
    describe_counter!(
        "venue_link_retries_total",
        "Total request retries"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record the current connection state.
pub fn set_connection_state(connection: &str, state: ConnectionState) {
    gauge!(
        "venue_link_connection_state",
        "connection" => connection.to_string()
    )
    .set(state.as_gauge());
}

/// Record a frame received.
pub fn record_message_received(connection: &str) {
    counter!(
        "venue_link_messages_received_total",
        "connection" => connection.to_string()
    )
    .increment(1);
}

/// Record a frame written.
pub fn record_message_sent(connection: &str) {
    counter!(
        "venue_link_messages_sent_total",
        "connection" => connection.to_string()
    )
    .increment(1);
}

/// Record a reconnection attempt.
pub fn record_reconnect_attempt(connection: &str) {
    counter!(
        "venue_link_reconnect_attempts_total",
        "connection" => connection.to_string()
    )
    .increment(1);
}

/// Record a heartbeat timeout.
pub fn record_heartbeat_timeout(connection: &str) {
    counter!(
        "venue_link_heartbeat_timeouts_total",
        "connection" => connection.to_string()
    )
    .increment(1);
}

/// Update the active subscription count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(count: usize) {
    gauge!("venue_link_subscriptions_active").set(count as f64);
}

/// Record a message dropped from a full watch queue.
pub fn record_queue_overflow(channel: &str) {
    counter!(
        "venue_link_queue_overflow_total",
        "channel" => channel.to_string()
    )
    .increment(1);
}

/// Record a subscriber callback failure.
pub fn record_handler_failure(channel: &str) {
    counter!(
        "venue_link_handler_failures_total",
        "channel" => channel.to_string()
    )
    .increment(1);
}

/// Record time spent waiting for rate-limiter tokens.
pub fn record_rate_limit_wait(operation: &str, waited: Duration) {
    histogram!(
        "venue_link_rate_limit_wait_seconds",
        "operation" => operation.to_string()
    )
    .record(waited.as_secs_f64());
}

/// Record a circuit breaker state transition.
pub fn record_circuit_transition(breaker: &str, to: CircuitState) {
    counter!(
        "venue_link_circuit_transitions_total",
        "breaker" => breaker.to_string(),
        "to" => to.as_str()
    )
    .increment(1);
}

/// Record a call rejected by an open circuit.
pub fn record_circuit_rejection(breaker: &str) {
    counter!(
        "venue_link_circuit_rejections_total",
        "breaker" => breaker.to_string()
    )
    .increment(1);
}

/// Record a request retry.
pub fn record_retry(policy: &str) {
    counter!(
        "venue_link_retries_total",
        "policy" => policy.to_string()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================

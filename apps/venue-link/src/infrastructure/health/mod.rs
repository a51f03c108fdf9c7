//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, connection status reporting, and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (200 only while connected)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{SubscriptionManager, SubscriptionStats};
use crate::infrastructure::connection::{ConnectionState, ConnectionStats};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::resilience::{CircuitBreakerMetrics, CircuitState, ResilientExecutor};

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Binary version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Connection state and counters.
    pub connection: ConnectionStats,
    /// Subscription statistics.
    pub subscriptions: SubscriptionStats,
    /// Rate limiter status.
    pub rate_limiter: RateLimiterStatus,
    /// Circuit breaker status.
    pub circuit_breaker: CircuitBreakerMetrics,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Connected with a closed circuit.
    Healthy,
    /// Reconnecting, or connected while the circuit is not closed.
    Degraded,
    /// No connection and none being attempted.
    Unhealthy,
}

/// Rate limiter status.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStatus {
    /// Tokens available now.
    pub available_tokens: f64,
    /// Callers waiting for tokens.
    pub queued_waiters: usize,
    /// Whether the limiter was destroyed.
    pub disposed: bool,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    manager: SubscriptionManager,
    executor: ResilientExecutor,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, manager: SubscriptionManager, executor: ResilientExecutor) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            manager,
            executor,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.manager.is_connected() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let connection = state.manager.client().stats();
    let limiter = state.executor.limiter();
    let circuit_breaker = state.executor.breaker().metrics();

    HealthResponse {
        status: determine_health_status(connection.state, circuit_breaker.state),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        connection,
        subscriptions: state.manager.stats(),
        rate_limiter: RateLimiterStatus {
            available_tokens: limiter.available_tokens(),
            queued_waiters: limiter.queued_waiters(),
            disposed: limiter.is_disposed(),
        },
        circuit_breaker,
    }
}

const fn determine_health_status(connection: ConnectionState, circuit: CircuitState) -> HealthStatus {
    match (connection, circuit) {
        (ConnectionState::Connected, CircuitState::Closed) => HealthStatus::Healthy,
        (ConnectionState::Connected | ConnectionState::Connecting, _) => HealthStatus::Degraded,
        (ConnectionState::Disconnecting | ConnectionState::Disconnected, _) => {
            HealthStatus::Unhealthy
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::connection::{ConnectionClient, ConnectionConfig};
    use crate::infrastructure::resilience::{
        CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig, RetryConfig,
        RetryPolicy,
    };
    use test_case::test_case;

    fn state() -> HealthServerState {
        let manager = SubscriptionManager::new(ConnectionClient::new(ConnectionConfig::new(
            "ws://127.0.0.1:1",
        )));
        let executor = ResilientExecutor::new(
            Arc::new(RateLimiter::new(RateLimiterConfig::new(5.0, 1.0))),
            Arc::new(CircuitBreaker::new("venue", CircuitBreakerConfig::default())),
            RetryPolicy::new("venue", RetryConfig::default()),
        );
        HealthServerState::new("0.1.0".to_string(), manager, executor)
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test_case(ConnectionState::Connected, CircuitState::Closed, HealthStatus::Healthy)]
    #[test_case(ConnectionState::Connected, CircuitState::Open, HealthStatus::Degraded)]
    #[test_case(ConnectionState::Connected, CircuitState::HalfOpen, HealthStatus::Degraded)]
    #[test_case(ConnectionState::Connecting, CircuitState::Closed, HealthStatus::Degraded)]
    #[test_case(ConnectionState::Disconnected, CircuitState::Closed, HealthStatus::Unhealthy)]
    #[test_case(ConnectionState::Disconnecting, CircuitState::Open, HealthStatus::Unhealthy)]
    fn determine_status(
        connection: ConnectionState,
        circuit: CircuitState,
        expected: HealthStatus,
    ) {
        assert_eq!(determine_health_status(connection, circuit), expected);
    }

    #[tokio::test]
    async fn response_reports_every_component() {
        let state = state();
        let response = build_health_response(&state);

        assert_eq!(response.status, HealthStatus::Unhealthy);
        assert_eq!(response.connection.state, ConnectionState::Disconnected);
        assert_eq!(response.subscriptions.active, 0);
        assert_eq!(response.rate_limiter.queued_waiters, 0);
        assert!((response.rate_limiter.available_tokens - 5.0).abs() < f64::EPSILON);
        assert_eq!(response.circuit_breaker.state, CircuitState::Closed);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["connection"]["state"], "disconnected");
        assert_eq!(json["version"], "0.1.0");
    }

    #[tokio::test]
    async fn router_serves_every_endpoint() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let app = router(Arc::new(state()));
        for (path, expected) in [
            ("/healthz", StatusCode::OK),
            ("/health", StatusCode::SERVICE_UNAVAILABLE),
            ("/readyz", StatusCode::SERVICE_UNAVAILABLE),
            ("/missing", StatusCode::NOT_FOUND),
        ] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), expected, "{path}");
        }
    }

    #[tokio::test]
    async fn readiness_requires_connection() {
        let response = readiness_handler(State(Arc::new(state()))).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let response = liveness_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

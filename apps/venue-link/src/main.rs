//! Venue Link Binary
//!
//! Connects to one venue endpoint, optionally watches one channel and
//! serves health and metrics over HTTP.
//!
//! # Usage
//!
//! ```bash
//! VENUE_WS_URL=wss://stream.example.com/ws cargo run --bin venue-link
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `VENUE_WS_URL`: WebSocket endpoint (`ws://` or `wss://`)
//!
//! ## Optional
//! - `VENUE_WATCH_CHANNEL`: Channel to watch and log
//! - `VENUE_SUBSCRIBE_MESSAGE`: Subscribe payload (required with a channel)
//! - `VENUE_UNSUBSCRIBE_MESSAGE`: Unsubscribe payload
//! - `VENUE_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `VENUE_RECONNECT_*`, `VENUE_HEARTBEAT_*`, `VENUE_RATE_LIMIT_*`,
//!   `VENUE_BREAKER_*`, `VENUE_RETRY_*`: Connection and resilience tuning
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: venue-link)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use venue_link::infrastructure::telemetry;
use venue_link::{
    CircuitBreaker, ConnectionError, ConnectionEvent, HealthServer, HealthServerState,
    JsonEnvelopeParser, LinkSettings, RateLimiter, ResilientExecutor, RetryPolicy,
    SubscriptionEvent, SubscriptionManager, WatchSettings, init_metrics,
};

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Rate-limit key for connection attempts.
const CONNECT_OPERATION: &str = "connect";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider was already installed");
    }

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Venue Link");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let settings = LinkSettings::from_env()?;
    log_config(&settings);

    let shutdown_token = CancellationToken::new();

    let client = venue_link::ConnectionClient::new(settings.connection.clone());
    let manager = SubscriptionManager::with_parser(
        client,
        settings.subscriptions.clone(),
        Arc::new(JsonEnvelopeParser::new()),
    );

    let name = settings.connection.name.clone();
    let executor = ResilientExecutor::new(
        Arc::new(RateLimiter::new(settings.rate_limiter.clone())),
        Arc::new(CircuitBreaker::new(
            name.clone(),
            settings.circuit_breaker.clone(),
        )),
        RetryPolicy::new(name, settings.retry.clone()),
    );

    // Health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        manager.clone(),
        executor.clone(),
    ));
    let health_server = HealthServer::new(
        settings.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    tokio::spawn(log_connection_events(
        manager.client().events(),
        shutdown_token.clone(),
    ));
    tokio::spawn(log_subscription_events(
        manager.events(),
        shutdown_token.clone(),
    ));

    let connected = executor
        .execute(
            CONNECT_OPERATION,
            || manager.connect(),
            |e| matches!(e, ConnectionError::Connect { .. }),
        )
        .await;
    if let Err(e) = connected {
        tracing::error!(error = %e, "Could not reach venue");
        shutdown_token.cancel();
        executor.limiter().destroy();
        return Err(e.into());
    }

    if let Some(watch) = settings.watch.clone() {
        let manager = manager.clone();
        let shutdown = shutdown_token.clone();
        tokio::spawn(async move {
            if let Err(e) = run_watch(&manager, watch, shutdown).await {
                tracing::error!(error = %e, "Watch failed");
            }
        });
    }

    await_shutdown(shutdown_token).await;

    executor.limiter().destroy();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, manager.disconnect())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Disconnect did not finish in time"
        );
    }

    tracing::info!("Venue Link stopped");
    Ok(())
}

/// Watch the configured channel and log every routed message.
async fn run_watch(
    manager: &SubscriptionManager,
    settings: WatchSettings,
    shutdown: CancellationToken,
) -> Result<(), venue_link::SubscriptionError> {
    let mut watch = manager
        .watch(
            settings.channel,
            settings.subscribe_message,
            settings.unsubscribe_message,
        )
        .await?;

    tracing::info!(channel = watch.channel(), subscription = %watch.id(), "Watching channel");

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            message = watch.next() => {
                let Some(message) = message else { break };
                tracing::info!(
                    channel = watch.channel(),
                    kind = %message.kind,
                    sequence_id = ?message.sequence_id,
                    data = %message.data,
                    "Message"
                );
            }
        }
    }

    tracing::info!(
        channel = watch.channel(),
        dropped = watch.dropped(),
        "Watch ended"
    );
    Ok(())
}

/// Log connection lifecycle events the client does not already log.
async fn log_connection_events(
    mut events: venue_link::infrastructure::broadcast::EventReceiver<ConnectionEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        match event {
            ConnectionEvent::Reconnected { attempts } => {
                tracing::info!(attempts, "Venue connection restored");
            }
            ConnectionEvent::MaxRetriesExceeded { attempts } => {
                tracing::error!(attempts, "Venue unreachable, giving up");
            }
            ConnectionEvent::Error(error) => {
                tracing::warn!(error = %error, "Venue connection error");
            }
            ConnectionEvent::StateChange { .. }
            | ConnectionEvent::Open
            | ConnectionEvent::Close { .. }
            | ConnectionEvent::Reconnecting { .. }
            | ConnectionEvent::Message(_) => {}
        }
    }
}

/// Log subscription events worth an operator's attention.
async fn log_subscription_events(
    mut events: venue_link::infrastructure::broadcast::EventReceiver<SubscriptionEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = shutdown.cancelled() => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        match event {
            SubscriptionEvent::Resubscribed { count } => {
                tracing::info!(count, "Subscriptions replayed");
            }
            SubscriptionEvent::HandlerFailed { channel, error, .. } => {
                tracing::warn!(channel = %channel, error = %error, "Handler failed");
            }
            SubscriptionEvent::Subscribed { channel, queued, .. } => {
                tracing::debug!(channel = %channel, queued, "Subscribed");
            }
            SubscriptionEvent::Unsubscribed { channel, .. } => {
                tracing::debug!(channel = %channel, "Unsubscribed");
            }
            SubscriptionEvent::QueueOverflow { .. } | SubscriptionEvent::Message(_) => {}
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(settings: &LinkSettings) {
    let connection = &settings.connection;
    tracing::info!(
        connection = %connection.name,
        url = %connection.url,
        reconnect = connection.reconnect.enabled,
        max_reconnect_attempts = connection.reconnect.max_attempts,
        heartbeat = connection.heartbeat.enabled,
        health_port = settings.server.health_port,
        watch_channel = settings.watch.as_ref().map(|w| w.channel.as_str()),
        "Configuration loaded"
    );
    tracing::debug!(
        capacity = settings.rate_limiter.capacity,
        refill_per_sec = settings.rate_limiter.refill_rate_per_second,
        failure_threshold = settings.circuit_breaker.failure_threshold,
        reset_timeout_ms = u64::try_from(settings.circuit_breaker.reset_timeout.as_millis())
            .unwrap_or(u64::MAX),
        retry_attempts = settings.retry.max_attempts,
        "Resilience settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}

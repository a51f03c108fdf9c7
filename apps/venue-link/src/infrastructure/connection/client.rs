//! Connection Client
//!
//! Owns one physical transport to one venue endpoint.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──open──► Connected
//!      ▲                          │ fail               │ unexpected close
//!      │                          ▼                    ▼
//!      └──────────────────── Disconnected ◄──── reconnect loop (Connecting)
//!      ▲                                               │ attempts exhausted
//!      └── disconnect() ── Disconnecting ◄─────────────┘ (MaxRetriesExceeded)
//! ```
//!
//! A supervisor task owns the transport. It multiplexes outbound writes,
//! heartbeat pings and inbound frames, and after an unexpected close runs
//! the reconnect loop. An explicit `disconnect()` cancels the supervisor,
//! so nothing reconnects until `connect()` is called again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::{ConnectionEvent, ConnectionState, ConnectionStats};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::websocket::TungsteniteConnector;
use crate::application::ports::{Frame, Transport, TransportConnector, TransportError};
use crate::domain::streaming::OutboundPayload;
use crate::infrastructure::broadcast::{EventHub, EventReceiver};
use crate::infrastructure::codec::{CodecError, FrameCodec};
use crate::infrastructure::metrics;

/// Time allowed for the close handshake on explicit disconnect.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Error Type
// =============================================================================

/// Errors returned by the connection client.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The transport could not be opened.
    #[error("failed to connect to {url}")]
    Connect {
        /// Endpoint URL.
        url: String,
        /// Original cause.
        #[source]
        source: TransportError,
    },

    /// Send attempted while the connection is not open.
    #[error("not connected")]
    NotConnected,

    /// Outbound payload could not be serialized.
    #[error("failed to encode outbound payload")]
    Encode(#[from] CodecError),

    /// The transport rejected the write.
    #[error("failed to write to transport")]
    Send(#[source] TransportError),
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Endpoint URL.
    pub url: String,
    /// Name used in logs and metric labels.
    pub name: String,
    /// Reconnection behavior.
    pub reconnect: ReconnectConfig,
    /// Heartbeat behavior.
    pub heartbeat: HeartbeatConfig,
}

impl ConnectionConfig {
    /// Create a configuration with default policies.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: "venue".to_string(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }

    /// Set the connection name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the reconnection policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the heartbeat policy.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

// =============================================================================
// Internals
// =============================================================================

/// A queued write; `ack` resolves once the frame reached the transport.
struct Outbound {
    frame: Frame,
    ack: Option<oneshot::Sender<Result<(), TransportError>>>,
}

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum SessionEnd {
    /// Explicit disconnect.
    Cancelled,
    /// Anything else: peer close, read/write failure, heartbeat timeout.
    Lost(String),
}

#[derive(Debug, Default)]
struct Timestamps {
    last_connected_at: Option<DateTime<Utc>>,
    last_disconnected_at: Option<DateTime<Utc>>,
}

struct Inner {
    config: ConnectionConfig,
    connector: Arc<dyn TransportConnector>,
    codec: FrameCodec,
    state: RwLock<ConnectionState>,
    events: EventHub<ConnectionEvent>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    lifecycle: tokio::sync::Mutex<Option<Session>>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    reconnect_attempt: AtomicU32,
    total_reconnects: AtomicU64,
    opens: AtomicU64,
    timestamps: RwLock<Timestamps>,
}

/// Render an error with its cause chain.
fn describe(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

// =============================================================================
// Connection Client
// =============================================================================

/// Reconnecting, heartbeated connection to one venue endpoint.
///
/// Cloning is cheap; clones share the same connection.
///
/// # Example
///
/// ```rust,no_run
/// use venue_link::domain::streaming::OutboundPayload;
/// use venue_link::infrastructure::connection::{
///     ConnectionClient, ConnectionConfig, ConnectionEvent,
/// };
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ConnectionClient::new(ConnectionConfig::new("wss://stream.venue.example/ws"));
/// let mut events = client.events();
///
/// client.connect().await?;
/// client.send(&OutboundPayload::from(r#"{"op":"ping"}"#)).await?;
///
/// while let Some(event) = events.recv().await {
///     if let ConnectionEvent::Message(payload) = event {
///         println!("{payload:?}");
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionClient")
            .field("name", &self.inner.config.name)
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionClient {
    /// Create a client using the WebSocket transport.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, Arc::new(TungsteniteConnector::new()))
    }

    /// Create a client with an injected transport connector.
    #[must_use]
    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                codec: FrameCodec::new(),
                state: RwLock::new(ConnectionState::Disconnected),
                events: EventHub::new(),
                outbound: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(None),
                messages_sent: AtomicU64::new(0),
                messages_received: AtomicU64::new(0),
                reconnect_attempt: AtomicU32::new(0),
                total_reconnects: AtomicU64::new(0),
                opens: AtomicU64::new(0),
                timestamps: RwLock::new(Timestamps::default()),
            }),
        }
    }

    /// Register a bounded listener for connection events.
    ///
    /// A listener more than `DEFAULT_EVENT_CAPACITY` events behind skips
    /// the oldest ones.
    #[must_use]
    pub fn events(&self) -> EventReceiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Register a listener that never skips events.
    pub(crate) fn lossless_events(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.inner.events.subscribe_lossless()
    }

    /// Number of times the transport has opened. Bumped before the state
    /// becomes `Connected` and before `Open` is emitted.
    pub(crate) fn open_count(&self) -> u64 {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Check if the transport is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connection configuration.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        let timestamps = self.inner.timestamps.read();
        ConnectionStats {
            state: self.state(),
            messages_sent: self.inner.messages_sent.load(Ordering::Relaxed),
            messages_received: self.inner.messages_received.load(Ordering::Relaxed),
            reconnect_attempt: self.inner.reconnect_attempt.load(Ordering::Relaxed),
            total_reconnects: self.inner.total_reconnects.load(Ordering::Relaxed),
            last_connected_at: timestamps.last_connected_at,
            last_disconnected_at: timestamps.last_disconnected_at,
        }
    }

    /// Open the transport.
    ///
    /// No-op while already connecting (including an automatic reconnect in
    /// progress) or connected. A failed first open is not retried.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Connect` carrying the transport's original
    /// error if the transport cannot be opened.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return Ok(());
        }

        // A supervisor that gave up (max retries, reconnect disabled) is finished.
        if let Some(stale) = lifecycle.take() {
            stale.cancel.cancel();
            let _ = stale.handle.await;
        }

        let inner = &self.inner;
        let url = inner.config.url.clone();
        tracing::info!(connection = %inner.config.name, url = %url, "Connecting");
        inner.set_state(ConnectionState::Connecting);

        let transport = match inner.connector.connect(&url).await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(
                    connection = %inner.config.name,
                    error = %describe(&e),
                    "Connection failed"
                );
                inner.events.emit(ConnectionEvent::Error(describe(&e)));
                inner.set_state(ConnectionState::Disconnected);
                return Err(ConnectionError::Connect { url, source: e });
            }
        };

        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *inner.outbound.lock() = Some(outbound_tx);
        inner.on_open(0);

        let handle = tokio::spawn(Arc::clone(inner).supervise(
            transport,
            outbound_rx,
            cancel.clone(),
        ));
        *lifecycle = Some(Session { cancel, handle });
        Ok(())
    }

    /// Close the transport and stop reconnection.
    ///
    /// Idempotent: a second call is a no-op.
    pub async fn disconnect(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let Some(session) = lifecycle.take() else {
            return;
        };
        let inner = &self.inner;

        if session.handle.is_finished() && self.state() == ConnectionState::Disconnected {
            // The supervisor already settled (max retries or reconnect disabled).
            let _ = session.handle.await;
            *inner.outbound.lock() = None;
            return;
        }

        tracing::info!(connection = %inner.config.name, "Disconnecting");
        inner.set_state(ConnectionState::Disconnecting);
        session.cancel.cancel();
        if let Err(e) = session.handle.await {
            tracing::warn!(connection = %inner.config.name, error = %e, "Connection task failed");
        }

        *inner.outbound.lock() = None;
        inner.reconnect_attempt.store(0, Ordering::Relaxed);
        inner.timestamps.write().last_disconnected_at = Some(Utc::now());
        inner.set_state(ConnectionState::Disconnected);
        inner.events.emit(ConnectionEvent::Close {
            reason: "client disconnect".to_string(),
            explicit: true,
        });
    }

    /// Write a payload and wait until the transport accepted it.
    ///
    /// # Errors
    ///
    /// - `NotConnected` unless the connection is open
    /// - `Encode` if a JSON payload cannot be serialized
    /// - `Send` with the transport's error if the write failed
    pub async fn send(&self, payload: &OutboundPayload) -> Result<(), ConnectionError> {
        self.inner.ensure_connected()?;
        let frame = self.inner.codec.encode(payload)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner.enqueue(Outbound {
            frame,
            ack: Some(ack_tx),
        })?;
        match ack_rx.await {
            Ok(result) => result.map_err(ConnectionError::Send),
            Err(_) => Err(ConnectionError::NotConnected),
        }
    }

    /// Queue a payload without waiting for the write.
    ///
    /// # Errors
    ///
    /// Returns `NotConnected` unless the connection is open, or `Encode` if
    /// a JSON payload cannot be serialized.
    pub fn try_send(&self, payload: &OutboundPayload) -> Result<(), ConnectionError> {
        self.inner.ensure_connected()?;
        let frame = self.inner.codec.encode(payload)?;
        self.inner.enqueue(Outbound { frame, ack: None })
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous == next {
            return;
        }
        tracing::debug!(
            connection = %self.config.name,
            from = %previous,
            to = %next,
            "Connection state changed"
        );
        metrics::set_connection_state(&self.config.name, next);
        self.events.emit(ConnectionEvent::StateChange {
            previous,
            current: next,
        });
    }

    fn ensure_connected(&self) -> Result<(), ConnectionError> {
        if *self.state.read() == ConnectionState::Connected {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected)
        }
    }

    fn enqueue(&self, outbound: Outbound) -> Result<(), ConnectionError> {
        self.ensure_connected()?;
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(ConnectionError::NotConnected)?;
        tx.send(outbound).map_err(|_| ConnectionError::NotConnected)
    }

    fn on_open(&self, attempts: u32) {
        self.timestamps.write().last_connected_at = Some(Utc::now());
        self.reconnect_attempt.store(0, Ordering::Relaxed);
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        tracing::info!(connection = %self.config.name, attempts, "Connection open");
        self.events.emit(ConnectionEvent::Open);
        if attempts > 0 {
            self.total_reconnects.fetch_add(1, Ordering::Relaxed);
            self.events.emit(ConnectionEvent::Reconnected { attempts });
        }
    }

    fn on_lost(&self, reason: String) {
        tracing::warn!(connection = %self.config.name, reason = %reason, "Connection lost");
        self.timestamps.write().last_disconnected_at = Some(Utc::now());
        self.set_state(ConnectionState::Disconnected);
        self.events.emit(ConnectionEvent::Close {
            reason,
            explicit: false,
        });
    }

    /// Own the transport until cancelled or reconnection gives up.
    async fn supervise(
        self: Arc<Self>,
        mut transport: Box<dyn Transport>,
        mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
        cancel: CancellationToken,
    ) {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            let end = self.run_session(transport, &mut outbound_rx, &cancel).await;
            Self::fail_pending(&mut outbound_rx);

            let reason = match end {
                SessionEnd::Cancelled => return,
                SessionEnd::Lost(reason) => reason,
            };
            if cancel.is_cancelled() {
                return;
            }
            self.on_lost(reason);

            match self.reconnect(&mut policy, &cancel).await {
                Some(next) => transport = next,
                None => return,
            }
        }
    }

    /// Fail writes that were queued but never reached the transport.
    fn fail_pending(outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>) {
        while let Ok(outbound) = outbound_rx.try_recv() {
            if let Some(ack) = outbound.ack {
                let _ = ack.send(Err(TransportError::Closed));
            }
        }
    }

    /// Run the reconnect loop. Returns the new transport, or `None` when
    /// cancelled or out of attempts.
    async fn reconnect(
        &self,
        policy: &mut ReconnectPolicy,
        cancel: &CancellationToken,
    ) -> Option<Box<dyn Transport>> {
        if !policy.config().enabled {
            tracing::debug!(connection = %self.config.name, "Reconnect disabled");
            return None;
        }

        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let Some(delay) = policy.next_delay() else {
                let attempts = policy.attempt_count();
                tracing::error!(
                    connection = %self.config.name,
                    attempts,
                    "Maximum reconnection attempts exceeded"
                );
                self.reconnect_attempt.store(0, Ordering::Relaxed);
                self.set_state(ConnectionState::Disconnected);
                self.events
                    .emit(ConnectionEvent::MaxRetriesExceeded { attempts });
                return None;
            };

            let attempt = policy.attempt_count();
            self.reconnect_attempt.store(attempt, Ordering::Relaxed);
            self.set_state(ConnectionState::Connecting);
            tracing::info!(
                connection = %self.config.name,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting"
            );
            metrics::record_reconnect_attempt(&self.config.name);
            self.events
                .emit(ConnectionEvent::Reconnecting { attempt, delay });

            tokio::select! {
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                () = cancel.cancelled() => return None,
                result = self.connector.connect(&self.config.url) => result,
            };

            match result {
                Ok(transport) => {
                    policy.reset();
                    self.on_open(attempt);
                    return Some(transport);
                }
                Err(e) => {
                    tracing::warn!(
                        connection = %self.config.name,
                        attempt,
                        error = %describe(&e),
                        "Reconnect attempt failed"
                    );
                    self.events.emit(ConnectionEvent::Error(describe(&e)));
                }
            }
        }
    }

    /// Pump one open transport until it ends.
    async fn run_session(
        &self,
        transport: Box<dyn Transport>,
        outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let name = self.config.name.as_str();
        let heartbeat = &self.config.heartbeat;
        let (mut write, mut read) = transport.split();

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(8);
        let heartbeat_cancel = cancel.child_token();
        let _heartbeat_guard = heartbeat_cancel.clone().drop_guard();
        if heartbeat.enabled {
            tokio::spawn(
                HeartbeatManager::new(
                    heartbeat.clone(),
                    Arc::clone(&heartbeat_state),
                    heartbeat_tx,
                    heartbeat_cancel,
                )
                .run(),
            );
        } else {
            drop(heartbeat_tx);
        }

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    let close = write.send(Frame::Close(Some("client disconnect".to_string())));
                    if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
                        tracing::debug!(connection = %name, "Close handshake timed out");
                    }
                    return SessionEnd::Cancelled;
                }

                Some(event) = heartbeat_rx.recv(), if heartbeat.enabled => match event {
                    HeartbeatEvent::SendPing => {
                        let frame = match &heartbeat.ping_payload {
                            Some(payload) => match self.codec.encode(payload) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    tracing::warn!(connection = %name, error = %e, "Invalid ping payload, using native ping");
                                    Frame::Ping(Vec::new())
                                }
                            },
                            None => Frame::Ping(Vec::new()),
                        };
                        tracing::trace!(connection = %name, "Sending ping");
                        if let Err(e) = write.send(frame).await {
                            return SessionEnd::Lost(format!("ping failed: {}", describe(&e)));
                        }
                    }
                    HeartbeatEvent::Timeout => {
                        // Dropping the halves resets the transport without a close handshake.
                        metrics::record_heartbeat_timeout(name);
                        self.events.emit(ConnectionEvent::Error("heartbeat timeout".to_string()));
                        return SessionEnd::Lost("heartbeat timeout".to_string());
                    }
                },

                Some(outbound) = outbound_rx.recv() => {
                    match write.send(outbound.frame).await {
                        Ok(()) => {
                            self.messages_sent.fetch_add(1, Ordering::Relaxed);
                            metrics::record_message_sent(name);
                            if let Some(ack) = outbound.ack {
                                let _ = ack.send(Ok(()));
                            }
                        }
                        Err(e) => {
                            let reason = format!("write failed: {}", describe(&e));
                            if let Some(ack) = outbound.ack {
                                let _ = ack.send(Err(e));
                            }
                            return SessionEnd::Lost(reason);
                        }
                    }
                }

                frame = read.next() => match frame {
                    Some(Ok(frame)) => {
                        heartbeat_state.record_activity();
                        self.messages_received.fetch_add(1, Ordering::Relaxed);
                        metrics::record_message_received(name);

                        if let Frame::Close(reason) = frame {
                            let reason = reason
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "closed by peer".to_string());
                            return SessionEnd::Lost(reason);
                        }
                        if let Some(payload) = self.codec.decode(frame) {
                            tracing::trace!(connection = %name, raw = payload.is_raw(), "Frame received");
                            self.events.emit(ConnectionEvent::Message(payload));
                        }
                    }
                    Some(Err(e)) => {
                        let reason = describe(&e);
                        self.events.emit(ConnectionEvent::Error(reason.clone()));
                        return SessionEnd::Lost(format!("read failed: {reason}"));
                    }
                    None => return SessionEnd::Lost("stream ended".to_string()),
                },
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

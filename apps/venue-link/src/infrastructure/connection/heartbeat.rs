//! Heartbeat Manager
//!
//! Manages connection health through periodic pings and a pong watchdog.
//! Every ping arms a timeout; any inbound frame disarms it. If the timer
//! fires first the manager reports a timeout and exits, and the connection
//! loop tears the transport down without a close handshake.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::OutboundPayload;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    /// Whether the heartbeat runs at all.
    pub enabled: bool,
    /// Interval between pings.
    pub interval: Duration,
    /// Time allowed for a pong before the connection is considered dead.
    pub timeout: Duration,
    /// Application-level ping; `None` sends a transport-native ping.
    pub ping_payload: Option<OutboundPayload>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            ping_payload: None,
        }
    }
}

impl HeartbeatConfig {
    /// Create an enabled configuration with a native ping.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            enabled: true,
            interval,
            timeout,
            ping_payload: None,
        }
    }

    /// Configuration with the heartbeat turned off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Request to send a ping.
    SendPing,
    /// No frame arrived within the timeout; the connection must be reset.
    Timeout,
}

/// State shared between the heartbeat manager and the read loop.
#[derive(Debug)]
pub struct HeartbeatState {
    last_activity: RwLock<Instant>,
    waiting_for_pong: AtomicBool,
    activity: Notify,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
            waiting_for_pong: AtomicBool::new(false),
            activity: Notify::new(),
        }
    }

    /// Record inbound traffic; clears any pending pong timeout.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
        if self.waiting_for_pong.swap(false, Ordering::SeqCst) {
            self.activity.notify_one();
        }
    }

    /// Mark that a ping went out and a pong is expected.
    pub fn mark_ping_sent(&self) {
        self.waiting_for_pong.store(true, Ordering::SeqCst);
    }

    /// Check if a pong is outstanding.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong.load(Ordering::SeqCst)
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn time_since_activity(&self) -> Duration {
        self.last_activity.read().elapsed()
    }
}

/// Heartbeat manager that monitors connection health.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
/// use venue_link::infrastructure::connection::{
///     HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState,
/// };
///
/// async fn example() {
///     let state = Arc::new(HeartbeatState::new());
///     let (event_tx, mut event_rx) = mpsc::channel(8);
///     let cancel = CancellationToken::new();
///
///     let manager = HeartbeatManager::new(
///         HeartbeatConfig::default(),
///         state.clone(),
///         event_tx,
///         cancel.clone(),
///     );
///     tokio::spawn(manager.run());
///
///     while let Some(event) = event_rx.recv().await {
///         match event {
///             HeartbeatEvent::SendPing => { /* write a ping */ }
///             HeartbeatEvent::Timeout => break,
///         }
///     }
/// }
/// ```
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run the heartbeat loop until cancelled or a timeout is detected.
    pub async fn run(self) {
        let start = Instant::now() + self.config.interval;
        let mut interval = tokio::time::interval_at(start, self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    return;
                }
                _ = interval.tick() => {}
            }

            self.state.mark_ping_sent();
            if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
                tracing::debug!("Event channel closed, stopping heartbeat");
                return;
            }

            if !self.await_pong().await {
                return;
            }
        }
    }

    /// Wait for the outstanding pong.
    ///
    /// Returns `false` when the loop should exit (cancelled or timed out).
    async fn await_pong(&self) -> bool {
        let deadline = Instant::now() + self.config.timeout;

        while self.state.is_waiting_for_pong() {
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = self.state.activity.notified() => {}
                () = tokio::time::sleep_until(deadline) => {
                    if !self.state.is_waiting_for_pong() {
                        break;
                    }
                    tracing::warn!(
                        timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
                        idle_ms = u64::try_from(self.state.time_since_activity().as_millis()).unwrap_or(u64::MAX),
                        "Heartbeat timeout detected"
                    );
                    let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
                    return false;
                }
            }
        }
        true
    }
}

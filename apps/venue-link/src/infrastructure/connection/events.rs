//! Connection state, events and statistics.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::streaming::InboundPayload;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Opening the transport (first connect or a reconnect attempt).
    Connecting,
    /// Transport open.
    Connected,
    /// Explicit disconnect in progress.
    Disconnecting,
    /// No transport.
    Disconnected,
}

impl ConnectionState {
    /// Numeric code for the state gauge.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Connected => 2.0,
            Self::Disconnecting => 3.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Events emitted by the connection client.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// State transition.
    StateChange {
        /// Previous state.
        previous: ConnectionState,
        /// New state.
        current: ConnectionState,
    },
    /// Transport opened (first connect and every reconnect).
    Open,
    /// Transport re-opened after an unexpected close.
    Reconnected {
        /// Attempts it took, always at least one.
        attempts: u32,
    },
    /// Transport closed.
    Close {
        /// Close reason.
        reason: String,
        /// Whether the close followed an explicit disconnect.
        explicit: bool,
    },
    /// Transport or protocol error; the connection loop keeps running.
    Error(String),
    /// A reconnect attempt was scheduled.
    Reconnecting {
        /// Attempt number (1-based).
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Reconnect attempts exhausted; the client settled in `Disconnected`.
    MaxRetriesExceeded {
        /// Attempts made.
        attempts: u32,
    },
    /// Decoded inbound payload.
    Message(InboundPayload),
}

/// Snapshot of connection statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Current state.
    pub state: ConnectionState,
    /// Frames written.
    pub messages_sent: u64,
    /// Frames read.
    pub messages_received: u64,
    /// Reconnect attempt in progress (0 when none).
    pub reconnect_attempt: u32,
    /// Successful reconnects since creation.
    pub total_reconnects: u64,
    /// Last successful open.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Last close.
    pub last_disconnected_at: Option<DateTime<Utc>>,
}

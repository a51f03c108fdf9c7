//! Venue Connection
//!
//! Reconnecting, heartbeated connection to one venue endpoint:
//!
//! - **client**: Connection lifecycle, send path, supervisor task
//! - **reconnect**: Exponential backoff with jitter
//! - **heartbeat**: Ping timer and pong watchdog
//! - **events**: Observable state and event stream
//! - **websocket**: `tokio-tungstenite` transport adapter

pub mod client;
pub mod events;
pub mod heartbeat;
pub mod reconnect;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ConnectionClient, ConnectionConfig, ConnectionError};
pub use events::{ConnectionEvent, ConnectionState, ConnectionStats};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use websocket::{TungsteniteConnector, TungsteniteTransport};

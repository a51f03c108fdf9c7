//! Transport Port (Driven Port)
//!
//! A framed, bidirectional message transport to one venue endpoint.
//! The connection client only sees frames; which socket library sits
//! underneath is chosen by the injected connector.

use async_trait::async_trait;
use futures::{Sink, Stream};

/// Boxed error used to carry transport causes across the port boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A single transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Transport-native ping.
    Ping(Vec<u8>),
    /// Transport-native pong.
    Pong(Vec<u8>),
    /// Close frame with an optional reason.
    Close(Option<String>),
}

impl Frame {
    /// Check whether this is a transport control frame.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::Pong(_) | Self::Close(_))
    }
}

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport could not be opened.
    #[error("failed to open transport to {url}")]
    Open {
        /// Endpoint URL.
        url: String,
        /// Underlying cause.
        #[source]
        source: BoxError,
    },

    /// Read or write failure on an open transport.
    #[error("transport I/O error")]
    Io(#[source] BoxError),

    /// The transport is already closed.
    #[error("transport closed")]
    Closed,
}

/// An open transport: a stream of inbound frames and a sink for outbound ones.
pub trait Transport:
    Stream<Item = Result<Frame, TransportError>> + Sink<Frame, Error = TransportError> + Send + Unpin
{
}

impl<T> Transport for T where
    T: Stream<Item = Result<Frame, TransportError>>
        + Sink<Frame, Error = TransportError>
        + Send
        + Unpin
{
}

/// Factory for transports.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open a transport to `url`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Open` with the original cause if the
    /// transport cannot be constructed.
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn control_frames() {
        assert!(Frame::Ping(vec![]).is_control());
        assert!(Frame::Pong(vec![]).is_control());
        assert!(Frame::Close(None).is_control());
        assert!(!Frame::Text("x".to_string()).is_control());
        assert!(!Frame::Binary(vec![1]).is_control());
    }

    #[test]
    fn open_error_keeps_cause() {
        let err = TransportError::Open {
            url: "wss://venue.test".to_string(),
            source: "connection refused".into(),
        };
        assert!(err.to_string().contains("wss://venue.test"));
        assert_eq!(
            err.source().map(ToString::to_string),
            Some("connection refused".to_string())
        );
    }
}

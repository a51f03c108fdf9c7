//! WebSocket transport over `tokio-tungstenite`.
//!
//! Supports `ws://` and `wss://` (rustls with webpki roots).

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use futures::{Sink, Stream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::application::ports::{Frame, Transport, TransportConnector, TransportError};

/// Connector opening WebSocket transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    /// Create a new connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        tracing::debug!(url, "Opening WebSocket");
        let (stream, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::Open {
                url: url.to_string(),
                source: Box::new(e),
            })?;
        tracing::debug!(url, status = %response.status(), "WebSocket handshake complete");
        Ok(Box::new(TungsteniteTransport::new(stream)))
    }
}

/// An open WebSocket, adapted to the transport port.
pub struct TungsteniteTransport<S = MaybeTlsStream<TcpStream>> {
    inner: WebSocketStream<S>,
}

impl<S> TungsteniteTransport<S> {
    /// Wrap an already-open WebSocket stream.
    #[must_use]
    pub const fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }
}

fn io_error(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    TransportError::Io(Box::new(e))
}

fn into_frame(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_string())),
        Message::Binary(bytes) => Some(Frame::Binary(bytes.to_vec())),
        Message::Ping(bytes) => Some(Frame::Ping(bytes.to_vec())),
        Message::Pong(bytes) => Some(Frame::Pong(bytes.to_vec())),
        Message::Close(close) => Some(Frame::Close(close.map(|c| c.reason.as_str().to_string()))),
        Message::Frame(_) => None,
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Ping(bytes) => Message::Ping(bytes.into()),
        Frame::Pong(bytes) => Message::Pong(bytes.into()),
        Frame::Close(reason) => Message::Close(reason.map(|reason| CloseFrame {
            code: CloseCode::Normal,
            reason: reason.into(),
        })),
    }
}

impl<S> Stream for TungsteniteTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    type Item = Result<Frame, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(self.inner.poll_next_unpin(cx)) {
                None => return Poll::Ready(None),
                Some(Err(e)) => return Poll::Ready(Some(Err(io_error(e)))),
                Some(Ok(message)) => {
                    if let Some(frame) = into_frame(message) {
                        return Poll::Ready(Some(Ok(frame)));
                    }
                }
            }
        }
    }
}

impl<S> Sink<Frame> for TungsteniteTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    type Error = TransportError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready_unpin(cx).map_err(io_error)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        self.inner.start_send_unpin(into_message(item)).map_err(io_error)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_flush_unpin(cx).map_err(io_error)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_close_unpin(cx).map_err(io_error)
    }
}

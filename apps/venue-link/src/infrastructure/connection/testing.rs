//! In-memory transport for unit tests.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Sink, Stream};
use tokio::sync::mpsc;

use crate::application::ports::{Frame, Transport, TransportConnector, TransportError};

/// Client half of an in-memory transport.
pub struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    outbound: mpsc::UnboundedSender<Frame>,
    reject_writes: Arc<AtomicBool>,
}

impl Stream for ChannelTransport {
    type Item = Result<Frame, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_recv(cx)
    }
}

impl Sink<Frame> for ChannelTransport {
    type Error = TransportError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Io("write rejected".into()));
        }
        self.outbound.send(item).map_err(|_| TransportError::Closed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Server half of an in-memory transport.
pub struct Peer {
    to_client: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    from_client: mpsc::UnboundedReceiver<Frame>,
    reject_writes: Arc<AtomicBool>,
}

impl Peer {
    /// Make every later client write fail with an I/O error.
    pub fn fail_writes(&self) {
        self.reject_writes.store(true, Ordering::SeqCst);
    }

    /// Push a frame to the client.
    pub fn push(&self, frame: Frame) {
        let _ = self.to_client.send(Ok(frame));
    }

    /// Push a text frame to the client.
    pub fn push_text(&self, text: &str) {
        self.push(Frame::Text(text.to_string()));
    }

    /// Next frame written by the client.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Next text frame written by the client, skipping control frames.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            if let Frame::Text(text) = self.from_client.recv().await? {
                return Some(text);
            }
        }
    }

    /// Frames written so far, without waiting.
    pub fn drain(&mut self) -> Vec<Frame> {
        std::iter::from_fn(|| self.from_client.try_recv().ok()).collect()
    }
}

/// Connector handing out in-memory transports.
#[derive(Clone)]
pub struct MockConnector {
    peers: mpsc::UnboundedSender<Peer>,
    refuse: Arc<AtomicU32>,
    attempts: Arc<AtomicUsize>,
}

impl MockConnector {
    /// Create a connector and the receiver of server halves.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Peer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                refuse: Arc::new(AtomicU32::new(0)),
                attempts: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: u32) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    /// Total connection attempts seen.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Open {
                url: url.to_string(),
                source: "connection refused".into(),
            });
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        let reject_writes = Arc::new(AtomicBool::new(false));
        self.peers
            .send(Peer {
                to_client,
                from_client,
                reject_writes: Arc::clone(&reject_writes),
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(Box::new(ChannelTransport {
            inbound,
            outbound,
            reject_writes,
        }))
    }
}

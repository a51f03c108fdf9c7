//! Local WebSocket venue for integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use venue_link::infrastructure::broadcast::EventReceiver;
use venue_link::{ConnectionConfig, HeartbeatConfig, ReconnectConfig};

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// A venue endpoint accepting any number of WebSocket connections.
pub struct TestVenue {
    addr: SocketAddr,
    accepted: mpsc::UnboundedReceiver<VenueConnection>,
    accept_task: JoinHandle<()>,
}

impl TestVenue {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, accepted) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        let _ = tx.send(VenueConnection { ws });
                    }
                });
            }
        });

        Self {
            addr,
            accepted,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> VenueConnection {
        within(self.accepted.recv()).await.expect("venue stopped accepting")
    }

    /// Stop listening; later connection attempts are refused.
    pub async fn stop(self) {
        self.accept_task.abort();
        let _ = self.accept_task.await;
    }
}

/// Server side of one client connection.
pub struct VenueConnection {
    ws: WebSocketStream<TcpStream>,
}

impl VenueConnection {
    /// Next text frame, answering pings along the way.
    pub async fn recv_text(&mut self) -> Option<String> {
        within(async {
            while let Some(message) = self.ws.next().await {
                match message.ok()? {
                    Message::Text(text) => return Some(text.as_str().to_string()),
                    Message::Close(_) => return None,
                    _ => {}
                }
            }
            None
        })
        .await
    }

    /// Next text frame parsed as JSON.
    pub async fn recv_json(&mut self) -> Value {
        let text = self.recv_text().await.expect("connection closed");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }

    /// Wait until the client closes the connection.
    pub async fn closed(&mut self) {
        within(async {
            while let Some(Ok(message)) = self.ws.next().await {
                if message.is_close() {
                    break;
                }
            }
        })
        .await;
    }

    pub async fn send_json(&mut self, value: &Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    /// Drop the socket without a close handshake.
    pub fn kill(self) {
        drop(self.ws);
    }

    /// Keep the socket open and answer pings until the task is aborted.
    pub fn serve_pings(mut self) -> JoinHandle<()> {
        tokio::spawn(async move { while let Some(Ok(_)) = self.ws.next().await {} })
    }
}

/// Fast reconnects and no heartbeat.
pub fn config(url: String, max_attempts: u32) -> ConnectionConfig {
    ConnectionConfig::new(url)
        .with_name("test-venue")
        .with_heartbeat(HeartbeatConfig::disabled())
        .with_reconnect(ReconnectConfig {
            enabled: true,
            max_attempts,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.0,
        })
}

/// Fail the test if `future` does not finish within [`WAIT`].
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting")
}

/// Receive events until one matches `predicate`.
pub async fn wait_for<E, P>(events: &mut EventReceiver<E>, predicate: P) -> E
where
    E: Clone,
    P: Fn(&E) -> bool,
{
    within(async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
}

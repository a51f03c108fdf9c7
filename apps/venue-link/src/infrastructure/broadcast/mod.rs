//! Event Fan-out
//!
//! Distributes connection and subscription events to any number of
//! listeners.
//!
//! # Architecture
//!
//! Public listeners share one bounded tokio broadcast channel. A listener
//! that falls more than `capacity` events behind skips the oldest ones;
//! [`EventReceiver`] counts what it skipped and keeps going. Emission never
//! blocks and an idle listener never holds more than `capacity` events.
//!
//! Crate-internal consumers that must observe every event (the
//! subscription router must never miss an `Open`) register a lossless
//! listener instead. Lossless listeners whose receiver was dropped are
//! pruned on the next emit.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

/// Default number of events a public listener may fall behind.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Receiving half handed to a public listener.
///
/// Skips events it lagged past instead of failing.
#[derive(Debug)]
pub struct EventReceiver<E> {
    rx: broadcast::Receiver<E>,
    capacity: usize,
    lagged: u64,
}

impl<E: Clone> EventReceiver<E> {
    /// Wait for the next event.
    ///
    /// Returns `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => self.record_lag(n),
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is ready.
    ///
    /// # Errors
    ///
    /// Returns `Empty` when nothing is buffered and `Closed` once the hub
    /// is gone.
    pub fn try_recv(&mut self) -> Result<E, broadcast::error::TryRecvError> {
        loop {
            match self.rx.try_recv() {
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.record_lag(n),
                other => return other,
            }
        }
    }

    /// Events skipped because this listener fell behind.
    #[must_use]
    pub const fn lagged(&self) -> u64 {
        self.lagged
    }

    /// Events buffered for this listener.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.rx.len().min(self.capacity)
    }

    fn record_lag(&mut self, skipped: u64) {
        self.lagged += skipped;
        tracing::warn!(skipped, total = self.lagged, "Event listener lagged");
    }
}

/// Fan-out hub for one event type.
///
/// # Example
///
/// ```rust
/// use venue_link::infrastructure::broadcast::EventHub;
///
/// # tokio_test::block_on(async {
/// let hub = EventHub::new();
/// let mut rx = hub.subscribe();
///
/// assert_eq!(hub.emit("opened"), 1);
/// assert_eq!(rx.recv().await, Some("opened"));
/// # });
/// ```
#[derive(Debug)]
pub struct EventHub<E> {
    tx: broadcast::Sender<E>,
    capacity: usize,
    lossless: Mutex<Vec<mpsc::UnboundedSender<E>>>,
    emitted: AtomicU64,
}

impl<E: Clone> Default for EventHub<E> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl<E: Clone> EventHub<E> {
    /// Create a hub with the default listener capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a hub whose public listeners buffer at most `capacity` events,
    /// rounded up to a power of two.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            tx: broadcast::channel(capacity).0,
            capacity,
            lossless: Mutex::new(Vec::new()),
            emitted: AtomicU64::new(0),
        }
    }

    /// Register a bounded public listener.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver<E> {
        EventReceiver {
            rx: self.tx.subscribe(),
            capacity: self.capacity,
            lagged: 0,
        }
    }

    /// Register a listener that sees every event.
    ///
    /// The consumer must keep draining it.
    #[must_use]
    pub(crate) fn subscribe_lossless(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lossless.lock().push(tx);
        rx
    }

    /// Deliver an event to every live listener.
    ///
    /// Returns the number of listeners that received it.
    pub fn emit(&self, event: E) -> usize {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        let delivered = {
            let mut lossless = self.lossless.lock();
            lossless.retain(|tx| tx.send(event.clone()).is_ok());
            lossless.len()
        };
        delivered + self.tx.send(event).unwrap_or(0)
    }

    /// Number of live listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        let mut lossless = self.lossless.lock();
        lossless.retain(|tx| !tx.is_closed());
        lossless.len() + self.tx.receiver_count()
    }

    /// Statistics about the hub.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            listeners: self.listener_count(),
            events_emitted: self.emitted.load(Ordering::Relaxed),
        }
    }
}

/// Shared hub reference.
pub type SharedEventHub<E> = Arc<EventHub<E>>;

/// Statistics about an event hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Live listeners.
    pub listeners: usize,
    /// Events emitted since creation.
    pub events_emitted: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_starts_empty() {
        let hub: EventHub<u32> = EventHub::new();
        assert_eq!(hub.listener_count(), 0);
        assert_eq!(hub.stats(), BroadcastStats::default());
    }

    #[test]
    fn listener_count_tracks_drops() {
        let hub: EventHub<u32> = EventHub::new();
        let rx1 = hub.subscribe();
        let _rx2 = hub.subscribe();
        let internal = hub.subscribe_lossless();
        assert_eq!(hub.listener_count(), 3);

        drop(rx1);
        drop(internal);
        assert_eq!(hub.listener_count(), 1);
    }

    #[tokio::test]
    async fn every_listener_sees_every_event_in_order() {
        let hub = EventHub::new();
        let mut rx1 = hub.subscribe();
        let mut rx2 = hub.subscribe();

        for i in 0..100 {
            assert_eq!(hub.emit(i), 2);
        }

        for i in 0..100 {
            assert_eq!(rx1.recv().await, Some(i));
        }
        for i in 0..100 {
            assert_eq!(rx2.recv().await, Some(i));
        }
        assert_eq!(rx1.lagged(), 0);
    }

    #[tokio::test]
    async fn idle_listener_backlog_is_bounded() {
        let hub = EventHub::with_capacity(16);
        let mut idle = hub.subscribe();

        for i in 0..10_000 {
            hub.emit(i);
        }

        assert_eq!(idle.backlog(), 16);
        // Oldest events are skipped; the newest window is kept.
        assert_eq!(idle.recv().await, Some(10_000 - 16));
        assert_eq!(idle.lagged(), 10_000 - 16);
        assert_eq!(idle.backlog(), 15);
    }

    #[tokio::test]
    async fn lossless_listener_sees_every_event() {
        let hub = EventHub::with_capacity(4);
        let mut internal = hub.subscribe_lossless();

        for i in 0..100 {
            hub.emit(i);
        }

        for i in 0..100 {
            assert_eq!(internal.recv().await, Some(i));
        }
    }

    #[test]
    fn try_recv_skips_lag() {
        let hub = EventHub::with_capacity(2);
        let mut rx = hub.subscribe();
        for i in 0..5 {
            hub.emit(i);
        }

        assert_eq!(rx.try_recv().ok(), Some(3));
        assert_eq!(rx.try_recv().ok(), Some(4));
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert_eq!(rx.lagged(), 3);
    }

    #[tokio::test]
    async fn dropped_hub_closes_listeners() {
        let hub: EventHub<u32> = EventHub::new();
        let mut rx = hub.subscribe();
        drop(hub);
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn emit_without_listeners_is_counted() {
        let hub = EventHub::new();
        assert_eq!(hub.emit("x"), 0);
        assert_eq!(hub.stats().events_emitted, 1);
    }

    #[test]
    fn dropped_listener_is_pruned_on_emit() {
        let hub = EventHub::new();
        let rx = hub.subscribe_lossless();
        drop(rx);
        assert_eq!(hub.emit(1), 0);
    }
}

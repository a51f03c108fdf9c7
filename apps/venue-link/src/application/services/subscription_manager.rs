//! Subscription Manager
//!
//! Multiplexes channel subscriptions over one [`ConnectionClient`].
//!
//! # Routing
//!
//! A single router task consumes the client's events in order. Every
//! decoded payload is parsed into a [`StreamMessage`], handed to each
//! active subscription on exactly its channel, then re-emitted as
//! [`SubscriptionEvent::Message`]. Handler failures and panics are caught
//! per handler and reported as [`SubscriptionEvent::HandlerFailed`].
//!
//! # Resubscription
//!
//! Subscribe payloads registered while the connection is down are queued
//! and flushed, in enqueue order, when the transport opens. On every later
//! open (an automatic reconnect or an explicit connect after reconnects
//! gave up) the flush is followed by a replay of every active subscription
//! in creation order, skipping the ones the flush just sent. Both passes
//! run inside the router task, so they never interleave with each other.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::watch::{Watch, WatchQueue};
use crate::application::ports::MessageParser;
use crate::domain::streaming::{MAX_QUEUE_SIZE, OutboundPayload, StreamMessage};
use crate::domain::subscription::{
    Channel, HandlerError, MessageHandler, PendingOutbound, PendingQueue, SubscriptionId,
    SubscriptionRegistry,
};
use crate::infrastructure::broadcast::{EventHub, EventReceiver, SharedEventHub};
use crate::infrastructure::codec::JsonEnvelopeParser;
use crate::infrastructure::connection::{ConnectionClient, ConnectionError, ConnectionEvent};
use crate::infrastructure::metrics;

// =============================================================================
// Types
// =============================================================================

/// Subscription manager errors.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The subscribe payload could not be sent; nothing was registered.
    #[error("failed to subscribe to '{channel}'")]
    SubscriptionFailed {
        /// Requested channel.
        channel: Channel,
        /// Send failure.
        #[source]
        source: ConnectionError,
    },
}

/// Subscription manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionManagerConfig {
    /// Capacity of each watch queue.
    pub queue_capacity: usize,
}

impl Default for SubscriptionManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: MAX_QUEUE_SIZE,
        }
    }
}

/// Events emitted by the subscription manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A subscription was registered.
    Subscribed {
        /// Subscription id.
        id: SubscriptionId,
        /// Channel key.
        channel: Channel,
        /// Whether the subscribe payload waits for the connection to open.
        queued: bool,
    },
    /// A subscription was removed.
    Unsubscribed {
        /// Subscription id.
        id: SubscriptionId,
        /// Channel key.
        channel: Channel,
    },
    /// A routed message (emitted for every inbound payload).
    Message(StreamMessage),
    /// A watch queue was full and dropped its oldest message.
    QueueOverflow {
        /// Subscription id.
        id: SubscriptionId,
        /// Channel key.
        channel: Channel,
        /// Messages this watch has dropped so far.
        dropped: u64,
    },
    /// A subscriber callback failed or panicked.
    HandlerFailed {
        /// Subscription id.
        id: SubscriptionId,
        /// Channel key.
        channel: Channel,
        /// Failure.
        error: HandlerError,
    },
    /// Active subscriptions were resent after a reconnect.
    Resubscribed {
        /// Subscribe payloads resent.
        count: usize,
    },
}

/// Subscription statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    /// Active subscriptions.
    pub active: usize,
    /// Active subscriptions per channel.
    pub channels: HashMap<Channel, usize>,
    /// Live watches.
    pub watches: usize,
    /// Payloads waiting for the connection to open.
    pub pending_outbound: usize,
    /// Inbound messages routed.
    pub messages_routed: u64,
    /// Messages dropped from full watch queues.
    pub dropped_messages: u64,
    /// Handler failures and panics.
    pub handler_failures: u64,
}

#[derive(Debug, Default)]
struct ManagerState {
    registry: SubscriptionRegistry,
    pending: PendingQueue,
    watches: HashMap<SubscriptionId, Weak<WatchQueue>>,
    opened_before: bool,
    routed_opens: u64,
    router_started: bool,
}

/// Where a new subscribe payload goes.
#[derive(Debug, Clone, Copy)]
enum Placement {
    /// Registered and queued for the next open.
    Queued { id: SubscriptionId, active: usize },
    /// Send now on the transport opened `opens` times.
    SendNow { opens: u64 },
}

impl ManagerState {
    /// Whether the router has handled the `Open` of the current transport.
    const fn session_routed(&self, client_opens: u64) -> bool {
        self.routed_opens >= client_opens
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Channel subscription multiplexer over one connection.
///
/// # Example
///
/// ```rust,no_run
/// use venue_link::{ConnectionClient, ConnectionConfig, OutboundPayload, SubscriptionManager};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = SubscriptionManager::new(ConnectionClient::new(ConnectionConfig::new(
///     "wss://stream.example.com/ws",
/// )));
/// manager.connect().await?;
///
/// let mut trades = manager
///     .watch(
///         "trades:BTC-USD",
///         OutboundPayload::from(r#"{"op":"subscribe","channel":"trades:BTC-USD"}"#),
///         Some(OutboundPayload::from(r#"{"op":"unsubscribe","channel":"trades:BTC-USD"}"#)),
///     )
///     .await?;
///
/// while let Some(message) = trades.next().await {
///     println!("{}", message.data);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SubscriptionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("client", &self.shared.client)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

pub(crate) struct Shared {
    client: ConnectionClient,
    parser: Arc<dyn MessageParser>,
    config: SubscriptionManagerConfig,
    state: Mutex<ManagerState>,
    events: SharedEventHub<SubscriptionEvent>,
    opens_handled: tokio::sync::watch::Sender<u64>,
    shutdown: CancellationToken,
    messages_routed: AtomicU64,
    dropped_messages: Arc<AtomicU64>,
    handler_failures: AtomicU64,
}

impl SubscriptionManager {
    /// Create a manager with the JSON envelope parser.
    #[must_use]
    pub fn new(client: ConnectionClient) -> Self {
        Self::with_parser(
            client,
            SubscriptionManagerConfig::default(),
            Arc::new(JsonEnvelopeParser::new()),
        )
    }

    /// Create a manager with a venue-specific parser.
    #[must_use]
    pub fn with_parser(
        client: ConnectionClient,
        config: SubscriptionManagerConfig,
        parser: Arc<dyn MessageParser>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                parser,
                config,
                state: Mutex::new(ManagerState::default()),
                events: Arc::new(EventHub::new()),
                opens_handled: tokio::sync::watch::channel(0).0,
                shutdown: CancellationToken::new(),
                messages_routed: AtomicU64::new(0),
                dropped_messages: Arc::new(AtomicU64::new(0)),
                handler_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Underlying connection.
    #[must_use]
    pub fn client(&self) -> &ConnectionClient {
        &self.shared.client
    }

    /// Check if the connection is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.client.is_connected()
    }

    /// Register a listener for subscription events.
    #[must_use]
    pub fn events(&self) -> EventReceiver<SubscriptionEvent> {
        self.shared.events.subscribe()
    }

    /// Open the connection and start routing.
    ///
    /// Returns once queued subscribe payloads have been flushed on the new
    /// transport, so later subscribes are sent directly.
    ///
    /// # Errors
    ///
    /// Returns the client's error if the transport cannot be opened.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.start_router();
        self.shared.client.connect().await?;

        let target = self.shared.client.open_count();
        let mut handled = self.shared.opens_handled.subscribe();
        // Only fails once the manager is being torn down.
        let _ = handled.wait_for(|opens| *opens >= target).await;
        Ok(())
    }

    /// Close the connection and drop every subscription, pending payload
    /// and watch. Calling it again is a no-op.
    pub async fn disconnect(&self) {
        self.shared.client.disconnect().await;

        let (removed, watches) = {
            let mut state = self.shared.state.lock();
            state.pending.clear();
            state.opened_before = false;
            let watches: Vec<_> = state.watches.drain().map(|(_, w)| w).collect();
            (state.registry.drain(), watches)
        };

        for queue in watches.iter().filter_map(Weak::upgrade) {
            queue.close();
        }
        if !removed.is_empty() {
            tracing::info!(
                connection = %self.shared.client.config().name,
                subscriptions = removed.len(),
                "Cleared subscriptions"
            );
        }
        for subscription in removed {
            self.shared.events.emit(SubscriptionEvent::Unsubscribed {
                id: subscription.id,
                channel: subscription.channel,
            });
        }
        metrics::set_active_subscriptions(0);
    }

    /// Register `handler` for `channel`.
    ///
    /// When connected the subscribe payload is sent first and the
    /// subscription is registered only if that succeeds. Otherwise it is
    /// registered now and its payload is sent when the connection opens.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionFailed` if the payload could not be sent.
    pub async fn subscribe<H>(
        &self,
        channel: impl Into<Channel>,
        subscribe_message: impl Into<OutboundPayload>,
        handler: H,
    ) -> Result<SubscriptionId, SubscriptionError>
    where
        H: Fn(&StreamMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.shared
            .subscribe(channel.into(), subscribe_message.into(), Arc::new(handler))
            .await
    }

    /// Remove a subscription, sending `unsubscribe_message` when connected.
    ///
    /// Send failures are logged and do not prevent removal. Returns `false`
    /// if the id was unknown or already removed.
    pub async fn unsubscribe(
        &self,
        id: SubscriptionId,
        unsubscribe_message: Option<OutboundPayload>,
    ) -> bool {
        let Some(channel) = self.shared.remove(id) else {
            return false;
        };

        if let Some(payload) = unsubscribe_message {
            if self.shared.client.is_connected() {
                if let Err(error) = self.shared.client.send(&payload).await {
                    tracing::warn!(
                        subscription = %id,
                        channel = %channel,
                        error = %error,
                        "Unsubscribe payload not sent"
                    );
                }
            }
        }
        true
    }

    /// Subscribe to `channel` and return a pull-based stream of its messages.
    ///
    /// Each watch owns a queue of `queue_capacity` messages that drops its
    /// oldest entry when the consumer falls behind.
    ///
    /// # Errors
    ///
    /// Returns `SubscriptionFailed` if the payload could not be sent.
    pub async fn watch(
        &self,
        channel: impl Into<Channel>,
        subscribe_message: impl Into<OutboundPayload>,
        unsubscribe_message: Option<OutboundPayload>,
    ) -> Result<Watch, SubscriptionError> {
        let channel = channel.into();
        let queue = Arc::new(WatchQueue::new(self.shared.config.queue_capacity));
        let id_slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let handler: MessageHandler = {
            let queue = Arc::clone(&queue);
            let events = Arc::clone(&self.shared.events);
            let dropped_total = Arc::clone(&self.shared.dropped_messages);
            let id_slot = Arc::clone(&id_slot);
            let channel = channel.clone();
            Arc::new(move |message: &StreamMessage| -> Result<(), HandlerError> {
                if let Some(dropped) = queue.push(message.clone()) {
                    dropped_total.fetch_add(1, Ordering::Relaxed);
                    metrics::record_queue_overflow(&channel);
                    if dropped == 1 {
                        tracing::warn!(channel = %channel, "Watch queue full, dropping oldest messages");
                    }
                    if let Some(id) = *id_slot.lock() {
                        events.emit(SubscriptionEvent::QueueOverflow {
                            id,
                            channel: channel.clone(),
                            dropped,
                        });
                    }
                }
                Ok(())
            })
        };

        let id = self
            .shared
            .subscribe(channel.clone(), subscribe_message.into(), handler)
            .await?;
        *id_slot.lock() = Some(id);

        {
            let mut state = self.shared.state.lock();
            if state.registry.get(id).is_some() {
                state.watches.insert(id, Arc::downgrade(&queue));
            } else {
                queue.close();
            }
        }

        Ok(Watch::new(
            id,
            channel,
            queue,
            Arc::downgrade(&self.shared),
            unsubscribe_message,
        ))
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let state = self.shared.state.lock();
        SubscriptionStats {
            active: state.registry.active_count(),
            channels: state.registry.channel_counts(),
            watches: state.watches.len(),
            pending_outbound: state.pending.len(),
            messages_routed: self.shared.messages_routed.load(Ordering::Relaxed),
            dropped_messages: self.shared.dropped_messages.load(Ordering::Relaxed),
            handler_failures: self.shared.handler_failures.load(Ordering::Relaxed),
        }
    }

    fn start_router(&self) {
        let mut state = self.shared.state.lock();
        if state.router_started {
            return;
        }
        state.router_started = true;

        // Register before reading the count so no later open is missed.
        let events = self.shared.client.lossless_events();
        state.routed_opens = self.shared.client.open_count();
        self.shared.opens_handled.send_replace(state.routed_opens);
        drop(state);

        let shutdown = self.shared.shutdown.clone();
        tokio::spawn(route(Arc::downgrade(&self.shared), events, shutdown));
    }
}

// =============================================================================
// Router
// =============================================================================

async fn route(
    shared: Weak<Shared>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.on_connection_event(event).await;
    }
    tracing::debug!("Subscription router stopped");
}

impl Shared {
    async fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message(payload) => self.dispatch(&self.parser.parse(&payload)),
            ConnectionEvent::Open => self.on_open().await,
            ConnectionEvent::Reconnected { attempts } => {
                tracing::debug!(attempts, "Connection restored");
            }
            ConnectionEvent::StateChange { .. }
            | ConnectionEvent::Close { .. }
            | ConnectionEvent::Error(_)
            | ConnectionEvent::Reconnecting { .. }
            | ConnectionEvent::MaxRetriesExceeded { .. } => {}
        }
    }

    async fn on_open(&self) {
        // Subscribers decide between sending now and queueing under this
        // same lock, so each subscription lands in exactly one of the
        // pending batch, the replay plan, or a direct send.
        let (entries, replay) = {
            let mut state = self.state.lock();
            state.routed_opens += 1;
            let reopened = std::mem::replace(&mut state.opened_before, true);
            let replay = reopened.then(|| state.registry.replay_plan());
            (state.pending.take_all(), replay)
        };
        let flushed = self.flush_pending(entries).await;
        if let Some(plan) = replay {
            self.resubscribe(plan, &flushed).await;
        }
        self.opens_handled.send_modify(|opens| *opens += 1);
    }

    /// Send payloads queued while disconnected, in enqueue order.
    async fn flush_pending(&self, entries: Vec<PendingOutbound>) -> HashSet<SubscriptionId> {
        let mut flushed = HashSet::new();
        let mut entries = entries.into_iter();

        while let Some(entry) = entries.next() {
            if let Some(id) = entry.subscription {
                if self.state.lock().registry.get(id).is_none() {
                    continue;
                }
            }
            match self.client.send(&entry.payload).await {
                Ok(()) => {
                    if let Some(id) = entry.subscription {
                        flushed.insert(id);
                    }
                }
                Err(error) => {
                    tracing::warn!(error = %error, "Pending flush interrupted");
                    let mut rest = vec![entry];
                    rest.extend(entries);
                    self.state.lock().pending.restore(rest);
                    break;
                }
            }
        }

        if !flushed.is_empty() {
            tracing::debug!(count = flushed.len(), "Flushed queued subscriptions");
        }
        flushed
    }

    /// Resend every planned subscription not just flushed, in creation order.
    async fn resubscribe(
        &self,
        plan: Vec<(SubscriptionId, Channel, OutboundPayload)>,
        flushed: &HashSet<SubscriptionId>,
    ) {
        let mut count = 0;

        for (id, channel, payload) in plan {
            if flushed.contains(&id) || self.state.lock().registry.get(id).is_none() {
                continue;
            }
            match self.client.send(&payload).await {
                Ok(()) => count += 1,
                Err(ConnectionError::NotConnected) => {
                    tracing::warn!(subscription = %id, "Connection lost during resubscription");
                    break;
                }
                Err(error) => {
                    tracing::warn!(
                        subscription = %id,
                        channel = %channel,
                        error = %error,
                        "Resubscribe failed"
                    );
                }
            }
        }

        tracing::info!(
            connection = %self.client.config().name,
            resubscribed = count,
            "Resubscribed after reconnect"
        );
        self.events.emit(SubscriptionEvent::Resubscribed { count });
    }

    fn dispatch(&self, message: &StreamMessage) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);

        if let Some(channel) = message.channel.as_deref() {
            let handlers = self.state.lock().registry.handlers_for(channel);
            for (id, handler) in handlers {
                let failure = match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                    Ok(Ok(())) => continue,
                    Ok(Err(error)) => error,
                    Err(panic) => HandlerError::new(panic_message(panic.as_ref())),
                };
                self.handler_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_handler_failure(channel);
                tracing::warn!(
                    subscription = %id,
                    channel,
                    error = %failure,
                    "Subscriber handler failed"
                );
                self.events.emit(SubscriptionEvent::HandlerFailed {
                    id,
                    channel: channel.to_string(),
                    error: failure,
                });
            }
        } else {
            tracing::trace!(kind = %message.kind, "Message without channel not routed");
        }

        self.events.emit(SubscriptionEvent::Message(message.clone()));
    }

    async fn subscribe(
        &self,
        channel: Channel,
        subscribe_message: OutboundPayload,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, SubscriptionError> {
        let placement = {
            let mut state = self.state.lock();
            let opens = self.client.open_count();
            if self.client.is_connected() && state.session_routed(opens) {
                Placement::SendNow { opens }
            } else {
                let id = state.registry.insert(
                    channel.clone(),
                    subscribe_message.clone(),
                    Arc::clone(&handler),
                );
                state.pending.push(Some(id), subscribe_message.clone());
                Placement::Queued {
                    id,
                    active: state.registry.active_count(),
                }
            }
        };

        let (id, active) = match placement {
            Placement::Queued { id, active } => (id, active),
            Placement::SendNow { opens } => {
                self.client.send(&subscribe_message).await.map_err(|source| {
                    SubscriptionError::SubscriptionFailed {
                        channel: channel.clone(),
                        source,
                    }
                })?;
                let (id, active, missed_replay) = {
                    let mut state = self.state.lock();
                    let id = state.registry.insert(
                        channel.clone(),
                        subscribe_message.clone(),
                        handler,
                    );
                    (id, state.registry.active_count(), state.routed_opens != opens)
                };
                // The transport reopened while the payload was in flight and
                // the replay ran before this record existed.
                if missed_replay {
                    if let Err(error) = self.client.send(&subscribe_message).await {
                        tracing::warn!(
                            subscription = %id,
                            channel = %channel,
                            error = %error,
                            "Subscribe payload not resent on new connection"
                        );
                    }
                }
                (id, active)
            }
        };

        let queued = matches!(placement, Placement::Queued { .. });
        tracing::debug!(subscription = %id, channel = %channel, queued, "Subscribed");
        metrics::set_active_subscriptions(active);
        self.events
            .emit(SubscriptionEvent::Subscribed { id, channel, queued });
        Ok(id)
    }

    /// Remove a subscription and its pending payload. Returns its channel.
    fn remove(&self, id: SubscriptionId) -> Option<Channel> {
        let (subscription, watch, active) = {
            let mut state = self.state.lock();
            state.pending.forget(id);
            let watch = state.watches.remove(&id);
            let subscription = state.registry.remove(id);
            (subscription, watch, state.registry.active_count())
        };

        if let Some(queue) = watch.as_ref().and_then(Weak::upgrade) {
            queue.close();
        }
        let subscription = subscription?;

        tracing::debug!(subscription = %id, channel = %subscription.channel, "Unsubscribed");
        metrics::set_active_subscriptions(active);
        self.events.emit(SubscriptionEvent::Unsubscribed {
            id,
            channel: subscription.channel.clone(),
        });
        Some(subscription.channel)
    }

    /// Release a dropped watch without waiting for the unsubscribe write.
    pub(crate) fn release(&self, id: SubscriptionId, unsubscribe_message: Option<OutboundPayload>) {
        if self.remove(id).is_none() {
            return;
        }
        let Some(payload) = unsubscribe_message else {
            return;
        };
        if self.client.is_connected() {
            if let Err(error) = self.client.try_send(&payload) {
                tracing::debug!(subscription = %id, error = %error, "Unsubscribe payload not sent");
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for queue in self.state.get_mut().watches.values().filter_map(Weak::upgrade) {
            queue.close();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

// =============================================================================
// Tests
// =============================================================================

//! Subscription Records
//!
//! Domain types for tracking channel subscriptions on one connection.
//!
//! # Design
//!
//! The registry tracks:
//! - Every subscription with its original subscribe payload
//! - Creation order, so resubscription replays in the same order
//! - Exact channel keys for routing
//!
//! Several subscriptions may share a channel key; each one receives every
//! message routed to that key.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::streaming::{OutboundPayload, StreamMessage};

// =============================================================================
// Types
// =============================================================================

/// Unique subscription identifier, increasing in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) const fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A channel key (e.g. `orderbook:BTC-USD`).
pub type Channel = String;

/// Error raised by a subscriber callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler error: {message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Create a handler error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Callback sink for routed messages.
pub type MessageHandler = Arc<dyn Fn(&StreamMessage) -> Result<(), HandlerError> + Send + Sync>;

/// One channel subscription.
#[derive(Clone)]
pub struct Subscription {
    /// Unique identifier.
    pub id: SubscriptionId,
    /// Channel key, matched exactly.
    pub channel: Channel,
    /// Message sink.
    pub handler: MessageHandler,
    /// Whether the subscription still receives messages.
    pub active: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Payload replayed after every reconnect.
    pub subscribe_message: OutboundPayload,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("active", &self.active)
            .field("created_at", &self.created_at)
            .field("subscribe_message", &self.subscribe_message)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Ordered set of subscriptions for one connection.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use venue_link::domain::streaming::OutboundPayload;
/// use venue_link::domain::subscription::SubscriptionRegistry;
///
/// let mut registry = SubscriptionRegistry::new();
/// let id = registry.insert(
///     "trades:BTC-USD".to_string(),
///     OutboundPayload::from("subscribe trades"),
///     Arc::new(|_msg: &venue_link::StreamMessage| Ok(())),
/// );
///
/// assert_eq!(registry.handlers_for("trades:BTC-USD").len(), 1);
/// assert!(registry.remove(id).is_some());
/// assert!(registry.remove(id).is_none());
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    next_id: u64,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new active subscription.
    pub fn insert(
        &mut self,
        channel: Channel,
        subscribe_message: OutboundPayload,
        handler: MessageHandler,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscriptions.insert(
            id,
            Subscription {
                id,
                channel,
                handler,
                active: true,
                created_at: Utc::now(),
                subscribe_message,
            },
        );
        id
    }

    /// Mark a subscription inactive and remove it.
    ///
    /// Returns `None` when the id is unknown or already removed.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<Subscription> {
        let mut subscription = self.subscriptions.remove(&id)?;
        subscription.active = false;
        Some(subscription)
    }

    /// Look up a subscription.
    #[must_use]
    pub fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.subscriptions.get(&id)
    }

    /// Handlers of every active subscription on `channel`, in creation order.
    #[must_use]
    pub fn handlers_for(&self, channel: &str) -> Vec<(SubscriptionId, MessageHandler)> {
        self.subscriptions
            .values()
            .filter(|s| s.active && s.channel == channel)
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect()
    }

    /// Subscribe payloads of every active subscription, in creation order.
    #[must_use]
    pub fn replay_plan(&self) -> Vec<(SubscriptionId, Channel, OutboundPayload)> {
        self.subscriptions
            .values()
            .filter(|s| s.active)
            .map(|s| (s.id, s.channel.clone(), s.subscribe_message.clone()))
            .collect()
    }

    /// Remove every subscription, returning them in creation order.
    pub fn drain(&mut self) -> Vec<Subscription> {
        std::mem::take(&mut self.subscriptions)
            .into_values()
            .map(|mut s| {
                s.active = false;
                s
            })
            .collect()
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.subscriptions.values().filter(|s| s.active).count()
    }

    /// Active subscription count per channel.
    #[must_use]
    pub fn channel_counts(&self) -> HashMap<Channel, usize> {
        let mut counts = HashMap::new();
        for subscription in self.subscriptions.values().filter(|s| s.active) {
            *counts.entry(subscription.channel.clone()).or_insert(0) += 1;
        }
        counts
    }
}

// =============================================================================
// Pending Outbound
// =============================================================================

/// A payload waiting for the connection to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOutbound {
    /// Subscription that produced the payload, if any.
    pub subscription: Option<SubscriptionId>,
    /// Payload to send.
    pub payload: OutboundPayload,
}

/// FIFO of payloads queued while disconnected.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: VecDeque<PendingOutbound>,
}

impl PendingQueue {
    /// Append a payload.
    pub fn push(&mut self, subscription: Option<SubscriptionId>, payload: OutboundPayload) {
        self.entries.push_back(PendingOutbound {
            subscription,
            payload,
        });
    }

    /// Drop the queued payload of a subscription that went away before flush.
    pub fn forget(&mut self, id: SubscriptionId) {
        self.entries.retain(|e| e.subscription != Some(id));
    }

    /// Take every entry in enqueue order.
    pub fn take_all(&mut self) -> Vec<PendingOutbound> {
        self.entries.drain(..).collect()
    }

    /// Put entries back at the front, preserving their order.
    pub fn restore(&mut self, entries: Vec<PendingOutbound>) {
        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
    }

    /// Number of queued payloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discard every queued payload.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> MessageHandler {
        Arc::new(|_msg: &StreamMessage| Ok(()))
    }

    fn payload(text: &str) -> OutboundPayload {
        OutboundPayload::Text(text.to_string())
    }

    #[test]
    fn ids_increase_in_creation_order() {
        let mut registry = SubscriptionRegistry::new();
        let a = registry.insert("a".to_string(), payload("a"), noop());
        let b = registry.insert("b".to_string(), payload("b"), noop());
        assert!(a < b);
        assert_ne!(a, b);
    }

    #[test]
    fn handlers_for_matches_channel_exactly() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("trades:BTC".to_string(), payload("1"), noop());
        registry.insert("trades:BTC".to_string(), payload("2"), noop());
        registry.insert("trades:BTC-USD".to_string(), payload("3"), noop());

        assert_eq!(registry.handlers_for("trades:BTC").len(), 2);
        assert_eq!(registry.handlers_for("trades:BTC-USD").len(), 1);
        assert!(registry.handlers_for("trades").is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut registry = SubscriptionRegistry::new();
        let id = registry.insert("a".to_string(), payload("a"), noop());

        let removed = registry.remove(id).unwrap();
        assert!(!removed.active);
        assert!(registry.remove(id).is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn replay_plan_keeps_creation_order() {
        let mut registry = SubscriptionRegistry::new();
        let first = registry.insert("z".to_string(), payload("z"), noop());
        let second = registry.insert("a".to_string(), payload("a"), noop());
        let third = registry.insert("m".to_string(), payload("m"), noop());
        registry.remove(second);

        let plan: Vec<_> = registry.replay_plan().into_iter().map(|(id, _, _)| id).collect();
        assert_eq!(plan, vec![first, third]);
    }

    #[test]
    fn drain_empties_registry() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("a".to_string(), payload("a"), noop());
        registry.insert("b".to_string(), payload("b"), noop());

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|s| !s.active));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn channel_counts_are_accurate() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert("a".to_string(), payload("1"), noop());
        registry.insert("a".to_string(), payload("2"), noop());
        registry.insert("b".to_string(), payload("3"), noop());

        let counts = registry.channel_counts();
        assert_eq!(counts.get("a"), Some(&2));
        assert_eq!(counts.get("b"), Some(&1));
    }

    #[test]
    fn pending_queue_preserves_order_and_forgets() {
        let mut queue = PendingQueue::default();
        let mut registry = SubscriptionRegistry::new();
        let a = registry.insert("a".to_string(), payload("a"), noop());
        let b = registry.insert("b".to_string(), payload("b"), noop());

        queue.push(Some(a), payload("a"));
        queue.push(None, payload("raw"));
        queue.push(Some(b), payload("b"));
        queue.forget(a);

        let entries = queue.take_all();
        assert_eq!(
            entries.iter().map(|e| e.payload.clone()).collect::<Vec<_>>(),
            vec![payload("raw"), payload("b")]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn pending_queue_restore_puts_entries_first() {
        let mut queue = PendingQueue::default();
        queue.push(None, payload("late"));
        queue.restore(vec![
            PendingOutbound {
                subscription: None,
                payload: payload("first"),
            },
            PendingOutbound {
                subscription: None,
                payload: payload("second"),
            },
        ]);

        let order: Vec<_> = queue.take_all().into_iter().map(|e| e.payload).collect();
        assert_eq!(order, vec![payload("first"), payload("second"), payload("late")]);
    }

    #[test]
    fn subscription_debug_omits_handler() {
        let mut registry = SubscriptionRegistry::new();
        let id = registry.insert("a".to_string(), payload("a"), noop());
        let debug = format!("{:?}", registry.get(id).unwrap());
        assert!(debug.contains("channel"));
        assert!(!debug.contains("handler"));
    }
}

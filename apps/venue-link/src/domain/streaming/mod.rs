//! Streaming Types
//!
//! Inbound payloads as they leave the connection client, the normalized
//! message shape routed to subscribers, and the bounded queue that sits
//! between a router and a slow consumer.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Maximum number of unread messages held for one consumer.
pub const MAX_QUEUE_SIZE: usize = 1000;

// =============================================================================
// Inbound Payload
// =============================================================================

/// A decoded inbound frame.
///
/// Structured decode is attempted first; frames that do not decode are
/// still delivered in their raw form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum InboundPayload {
    /// Frame decoded into a JSON value (from JSON text/bytes or MessagePack).
    Json(serde_json::Value),
    /// Text frame that is not valid JSON.
    Text(String),
    /// Binary frame that decoded as neither JSON nor MessagePack.
    Binary(Vec<u8>),
}

impl InboundPayload {
    /// Get the JSON value, if the frame decoded structurally.
    #[must_use]
    pub const fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Text(_) | Self::Binary(_) => None,
        }
    }

    /// Check whether the frame was delivered raw.
    #[must_use]
    pub const fn is_raw(&self) -> bool {
        !matches!(self, Self::Json(_))
    }
}

// =============================================================================
// Outbound Payload
// =============================================================================

/// A caller-supplied outbound payload.
///
/// The core does not interpret payloads; it only serializes them onto the
/// transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPayload {
    /// JSON value, written as a text frame.
    Json(serde_json::Value),
    /// Text frame written verbatim.
    Text(String),
    /// Binary frame written verbatim.
    Binary(Vec<u8>),
}

impl OutboundPayload {
    /// Serialize any `Serialize` value into a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if `value` cannot be represented as JSON.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::Json)
    }
}

impl From<serde_json::Value> for OutboundPayload {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<String> for OutboundPayload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for OutboundPayload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for OutboundPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

// =============================================================================
// Stream Message
// =============================================================================

/// Message shape routed to per-channel subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamMessage {
    /// Message type as reported by the venue (`"raw"` for undecodable frames).
    pub kind: String,
    /// Channel key used for routing; `None` means the message is not routed.
    pub channel: Option<String>,
    /// Message body.
    pub data: serde_json::Value,
    /// Venue timestamp when present, otherwise the local receive time.
    pub timestamp: DateTime<Utc>,
    /// Venue sequence number when present.
    pub sequence_id: Option<u64>,
    /// The payload this message was parsed from.
    #[serde(skip)]
    pub raw: InboundPayload,
}

impl StreamMessage {
    /// Build an unrouted message around a raw payload.
    #[must_use]
    pub fn unrouted(raw: InboundPayload) -> Self {
        let data = match &raw {
            InboundPayload::Json(value) => value.clone(),
            InboundPayload::Text(text) => serde_json::Value::String(text.clone()),
            InboundPayload::Binary(bytes) => serde_json::Value::Array(
                bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
            ),
        };
        Self {
            kind: "raw".to_string(),
            channel: None,
            data,
            timestamp: Utc::now(),
            sequence_id: None,
            raw,
        }
    }

    /// Check whether this message belongs to `channel` (exact match).
    #[must_use]
    pub fn is_for(&self, channel: &str) -> bool {
        self.channel.as_deref() == Some(channel)
    }
}

// =============================================================================
// Bounded Queue
// =============================================================================

/// FIFO with a hard capacity that drops its oldest entry on overflow.
///
/// Surviving entries are never reordered. Every overflow increments
/// [`BoundedQueue::dropped`] by exactly one.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> Default for BoundedQueue<T> {
    fn default() -> Self {
        Self::new(MAX_QUEUE_SIZE)
    }
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            dropped: 0,
        }
    }

    /// Push an item, returning the evicted oldest item on overflow.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity {
            self.dropped += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Pop the oldest item.
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total items dropped through overflow.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Discard every queued item. The dropped counter is unchanged.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn push_and_pop_preserve_order() {
        let mut queue = BoundedQueue::new(3);
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut queue = BoundedQueue::new(2);
        assert!(queue.push("a").is_none());
        assert!(queue.push("b").is_none());

        let evicted = queue.push("c");

        assert_eq!(evicted, Some("a"));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), Some("c"));
    }

    #[test]
    fn default_capacity_is_max_queue_size() {
        let queue: BoundedQueue<u8> = BoundedQueue::default();
        assert_eq!(queue.capacity(), MAX_QUEUE_SIZE);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut queue = BoundedQueue::new(0);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn clear_keeps_dropped_count() {
        let mut queue = BoundedQueue::new(1);
        queue.push(1);
        queue.push(2);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn outbound_payload_conversions() {
        assert_eq!(
            OutboundPayload::from("ping"),
            OutboundPayload::Text("ping".to_string())
        );
        assert_eq!(
            OutboundPayload::from(serde_json::json!({"op": "ping"})),
            OutboundPayload::Json(serde_json::json!({"op": "ping"}))
        );
        assert_eq!(
            OutboundPayload::from(vec![1u8, 2]),
            OutboundPayload::Binary(vec![1, 2])
        );
    }

    #[test]
    fn unrouted_message_wraps_text() {
        let msg = StreamMessage::unrouted(InboundPayload::Text("hello".to_string()));
        assert_eq!(msg.kind, "raw");
        assert!(msg.channel.is_none());
        assert_eq!(msg.data, serde_json::json!("hello"));
        assert!(msg.raw.is_raw());
    }

    #[test]
    fn channel_match_is_exact() {
        let mut msg = StreamMessage::unrouted(InboundPayload::Json(serde_json::json!({})));
        msg.channel = Some("trades:BTC-USD".to_string());
        assert!(msg.is_for("trades:BTC-USD"));
        assert!(!msg.is_for("trades:BTC"));
        assert!(!msg.is_for("TRADES:BTC-USD"));
    }

    proptest! {
        #[test]
        fn queue_never_exceeds_capacity(capacity in 1usize..64, pushes in 0usize..256) {
            let mut queue = BoundedQueue::new(capacity);
            for i in 0..pushes {
                queue.push(i);
                prop_assert!(queue.len() <= capacity);
            }
            let expected_dropped = pushes.saturating_sub(capacity) as u64;
            prop_assert_eq!(queue.dropped(), expected_dropped);

            // Survivors are the newest items, still in arrival order.
            let survivors: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
            let expected: Vec<_> = (pushes.saturating_sub(capacity)..pushes).collect();
            prop_assert_eq!(survivors, expected);
        }
    }
}

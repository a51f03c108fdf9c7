//! Pull-based message stream for one subscription.
//!
//! The subscription handler pushes into a per-watch [`BoundedQueue`]; the
//! consumer pulls with [`Watch::next`] and is woken by a `Notify` when the
//! queue was empty. Dropping the watch releases the subscription.

use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::subscription_manager::Shared;
use crate::domain::streaming::{BoundedQueue, OutboundPayload, StreamMessage};
use crate::domain::subscription::SubscriptionId;

/// Queue and wake-up state shared by a watch and its handler.
#[derive(Debug)]
pub(crate) struct WatchQueue {
    queue: Mutex<BoundedQueue<StreamMessage>>,
    notify: Notify,
    closed: AtomicBool,
}

impl WatchQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(BoundedQueue::new(capacity)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a message. Returns the dropped total when the oldest entry was evicted.
    pub(crate) fn push(&self, message: StreamMessage) -> Option<u64> {
        let overflowed = {
            let mut queue = self.queue.lock();
            queue.push(message).map(|_| queue.dropped())
        };
        self.notify.notify_one();
        overflowed
    }

    /// End the stream once the queue drains.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<StreamMessage> {
        self.queue.lock().pop()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A live subscription yielding routed messages for one channel.
///
/// Closing the stream is the only way to stop watching: dropping the value
/// (or the stream from [`Watch::into_stream`]) removes the subscription and
/// sends the unsubscribe payload when the connection is open.
pub struct Watch {
    id: SubscriptionId,
    channel: String,
    queue: std::sync::Arc<WatchQueue>,
    manager: Weak<Shared>,
    unsubscribe_message: Option<OutboundPayload>,
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("queued", &self.len())
            .finish_non_exhaustive()
    }
}

impl Watch {
    pub(crate) const fn new(
        id: SubscriptionId,
        channel: String,
        queue: std::sync::Arc<WatchQueue>,
        manager: Weak<Shared>,
        unsubscribe_message: Option<OutboundPayload>,
    ) -> Self {
        Self {
            id,
            channel,
            queue,
            manager,
            unsubscribe_message,
        }
    }

    /// Subscription identifier.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Watched channel.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Messages waiting to be pulled.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.queue.lock().len()
    }

    /// Check if no message is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages dropped because this consumer fell behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.queue.queue.lock().dropped()
    }

    /// Next message, waiting if none is queued.
    ///
    /// Returns `None` once the manager disconnected or the subscription was
    /// removed, after every queued message has been yielded.
    pub async fn next(&mut self) -> Option<StreamMessage> {
        loop {
            if let Some(message) = self.queue.pop() {
                return Some(message);
            }
            if self.queue.is_closed() {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Next message if one is queued, without waiting.
    pub fn try_next(&mut self) -> Option<StreamMessage> {
        self.queue.pop()
    }

    /// Turn the watch into a [`Stream`]. Dropping the stream releases the subscription.
    pub fn into_stream(self) -> impl Stream<Item = StreamMessage> + Send {
        futures::stream::unfold(self, |mut watch| async move {
            let message = watch.next().await?;
            Some((message, watch))
        })
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(manager) = self.manager.upgrade() {
            manager.release(self.id, self.unsubscribe_message.take());
        }
    }
}

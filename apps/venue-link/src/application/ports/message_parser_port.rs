//! Message Parser Port (Driven Port)
//!
//! Maps a decoded inbound payload onto the routed message shape. Venue
//! adapters supply their own parser when the default envelope layout
//! does not match their channel naming.

use crate::domain::streaming::{InboundPayload, StreamMessage};

/// Parses decoded payloads into routable messages.
///
/// Parsing never fails: payloads that carry no recognizable envelope are
/// returned as unrouted messages (`channel == None`).
pub trait MessageParser: Send + Sync {
    /// Parse one inbound payload.
    fn parse(&self, payload: &InboundPayload) -> StreamMessage;
}

impl<F> MessageParser for F
where
    F: Fn(&InboundPayload) -> StreamMessage + Send + Sync,
{
    fn parse(&self, payload: &InboundPayload) -> StreamMessage {
        self(payload)
    }
}

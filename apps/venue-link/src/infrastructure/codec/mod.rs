//! Frame Codec Module
//!
//! Decoding and encoding between transport frames and payloads.
//!
//! - **Text frames**: JSON when they parse, otherwise raw text
//! - **Binary frames**: a JSON or `MessagePack` map or array, otherwise raw
//!   bytes. Scalar documents stay raw so opaque payloads such as a single
//!   byte are never reinterpreted.
//! - **Outbound**: JSON values are written as text frames
//!
//! The codec never rejects an inbound data frame. Anything that does not
//! decode structurally is delivered in its raw form.

mod envelope;

pub use envelope::JsonEnvelopeParser;

use serde::Deserialize;

use crate::application::ports::Frame;
use crate::domain::streaming::{InboundPayload, OutboundPayload};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stateless frame codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a data frame.
    ///
    /// Returns `None` for control frames, which carry no payload for
    /// subscribers.
    #[must_use]
    pub fn decode(&self, frame: Frame) -> Option<InboundPayload> {
        match frame {
            Frame::Text(text) => Some(Self::decode_text(text)),
            Frame::Binary(bytes) => Some(Self::decode_binary(bytes)),
            Frame::Ping(_) | Frame::Pong(_) | Frame::Close(_) => None,
        }
    }

    /// Encode an outbound payload into a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if a JSON value cannot be serialized.
    pub fn encode(&self, payload: &OutboundPayload) -> Result<Frame, CodecError> {
        Ok(match payload {
            OutboundPayload::Json(value) => Frame::Text(serde_json::to_string(value)?),
            OutboundPayload::Text(text) => Frame::Text(text.clone()),
            OutboundPayload::Binary(bytes) => Frame::Binary(bytes.clone()),
        })
    }

    fn decode_text(text: String) -> InboundPayload {
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) => InboundPayload::Json(value),
            Err(_) => InboundPayload::Text(text),
        }
    }

    fn decode_binary(bytes: Vec<u8>) -> InboundPayload {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes)
            && (value.is_object() || value.is_array())
        {
            return InboundPayload::Json(value);
        }
        match Self::decode_msgpack(&bytes) {
            Some(value) => InboundPayload::Json(value),
            None => InboundPayload::Binary(bytes),
        }
    }

    /// Decode a complete `MessagePack` map or array. Trailing bytes reject the frame.
    fn decode_msgpack(bytes: &[u8]) -> Option<serde_json::Value> {
        // fixmap, fixarray, array 16/32, map 16/32
        if !matches!(bytes.first()?, 0x80..=0x9f | 0xdc..=0xdf) {
            return None;
        }
        let mut cursor = std::io::Cursor::new(bytes);
        let value = {
            let mut deserializer = rmp_serde::Deserializer::new(&mut cursor);
            serde_json::Value::deserialize(&mut deserializer).ok()?
        };
        let consumed = usize::try_from(cursor.position()).ok()?;
        (consumed == bytes.len()).then_some(value)
    }
}

// =============================================================================
// Tests
// =============================================================================

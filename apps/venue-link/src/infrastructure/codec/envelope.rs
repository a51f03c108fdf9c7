//! Default JSON envelope parser.
//!
//! Recognizes the field names most venues use for their stream envelopes:
//!
//! | Field        | Keys (first match wins)                       |
//! |--------------|-----------------------------------------------|
//! | type         | `type`, `event`, `e`                          |
//! | channel      | `channel`, `topic`, `stream`, `arg.channel`   |
//! | data         | `data`, otherwise the whole object            |
//! | timestamp    | `timestamp`, `ts`, `T` (epoch ms or RFC 3339) |
//! | sequence id  | `sequenceId`, `seq`, `sequence`, `u`          |

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::application::ports::MessageParser;
use crate::domain::streaming::{InboundPayload, StreamMessage};

const TYPE_KEYS: [&str; 3] = ["type", "event", "e"];
const CHANNEL_KEYS: [&str; 3] = ["channel", "topic", "stream"];
const TIMESTAMP_KEYS: [&str; 3] = ["timestamp", "ts", "T"];
const SEQUENCE_KEYS: [&str; 4] = ["sequenceId", "seq", "sequence", "u"];

/// Default message type for JSON objects without a type field.
const DEFAULT_KIND: &str = "message";

/// Parser for `{type, channel, data, timestamp, sequenceId}`-style envelopes.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEnvelopeParser;

impl JsonEnvelopeParser {
    /// Create a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl MessageParser for JsonEnvelopeParser {
    fn parse(&self, payload: &InboundPayload) -> StreamMessage {
        let Some(Value::Object(object)) = payload.as_json() else {
            let mut message = StreamMessage::unrouted(payload.clone());
            if payload.as_json().is_some() {
                message.kind = DEFAULT_KIND.to_string();
            }
            return message;
        };

        let kind = first_str(object, &TYPE_KEYS).unwrap_or(DEFAULT_KIND);
        let channel = first_str(object, &CHANNEL_KEYS)
            .or_else(|| {
                object
                    .get("arg")
                    .and_then(|arg| arg.get("channel"))
                    .and_then(Value::as_str)
            })
            .map(str::to_string);
        let data = object
            .get("data")
            .cloned()
            .unwrap_or_else(|| Value::Object(object.clone()));
        let timestamp = TIMESTAMP_KEYS
            .iter()
            .find_map(|key| object.get(*key).and_then(parse_timestamp))
            .unwrap_or_else(Utc::now);
        let sequence_id = SEQUENCE_KEYS
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_u64));

        StreamMessage {
            kind: kind.to_string(),
            channel,
            data,
            timestamp,
            sequence_id,
            raw: payload.clone(),
        }
    }
}

fn first_str<'a>(object: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    fn parse(value: Value) -> StreamMessage {
        JsonEnvelopeParser::new().parse(&InboundPayload::Json(value))
    }

    #[test_case(json!({"type": "trade", "channel": "trades:BTC-USD"}), "trade", Some("trades:BTC-USD"); "type and channel")]
    #[test_case(json!({"event": "update", "topic": "book.ETH"}), "update", Some("book.ETH"); "event and topic")]
    #[test_case(json!({"e": "depthUpdate", "stream": "btcusdt@depth"}), "depthUpdate", Some("btcusdt@depth"); "short keys")]
    #[test_case(json!({"arg": {"channel": "tickers"}, "data": []}), "message", Some("tickers"); "nested arg channel")]
    #[test_case(json!({"result": null, "id": 1}), "message", None; "no envelope")]
    fn envelope_fields(value: Value, kind: &str, channel: Option<&str>) {
        let message = parse(value);
        assert_eq!(message.kind, kind);
        assert_eq!(message.channel.as_deref(), channel);
    }

    #[test]
    fn data_field_is_extracted() {
        let message = parse(json!({"channel": "c", "data": {"px": 1}}));
        assert_eq!(message.data, json!({"px": 1}));
    }

    #[test]
    fn whole_object_is_data_when_missing() {
        let value = json!({"channel": "c", "px": 1});
        let message = parse(value.clone());
        assert_eq!(message.data, value);
    }

    #[test]
    fn timestamp_from_epoch_millis() {
        let message = parse(json!({"ts": 1_700_000_000_000_i64}));
        assert_eq!(message.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn timestamp_from_rfc3339() {
        let message = parse(json!({"timestamp": "2024-03-15T14:30:00Z"}));
        assert_eq!(message.timestamp.to_rfc3339(), "2024-03-15T14:30:00+00:00");
    }

    #[test]
    fn sequence_id_is_read() {
        assert_eq!(parse(json!({"sequenceId": 7})).sequence_id, Some(7));
        assert_eq!(parse(json!({"u": 99})).sequence_id, Some(99));
        assert_eq!(parse(json!({})).sequence_id, None);
    }

    #[test]
    fn raw_text_is_unrouted() {
        let message = JsonEnvelopeParser::new().parse(&InboundPayload::Text("hello".to_string()));
        assert_eq!(message.kind, "raw");
        assert!(message.channel.is_none());
    }

    #[test]
    fn json_array_is_unrouted_message() {
        let message = parse(json!([1, 2]));
        assert_eq!(message.kind, "message");
        assert!(message.channel.is_none());
        assert_eq!(message.data, json!([1, 2]));
    }
}

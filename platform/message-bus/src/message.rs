//! # Message Envelope
//!
//! Platform-wide message envelope for everything that crosses a stream:
//! domain events, commands, and subscription position markers.
//!
//! ## Envelope Fields
//!
//! - `id`: globally unique identifier (idempotency anchor)
//! - `message_type`: fully qualified name with version suffix,
//!   e.g. `Ordering.OrderPlaced.v1`
//! - `kind`: EVENT | COMMAND | READ_POSITION
//! - `stream`: `<domain>::<category>-<aggregate_id>` instance stream
//! - `origin_stream`: stream of the causing command, for causality filtering
//! - `sequence_id`: `<aggregate_version>.<event_index>` for delta events, or
//!   a plain position integer for event-sourced streams
//! - `payload`: message-specific data
//! - `headers`: trace and idempotency metadata
//!
//! A message is immutable after creation; the builder methods consume and
//! return `self` and are only used before the message is first published.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminates what a message represents on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Event,
    Command,
    ReadPosition,
}

/// Trace and idempotency metadata carried with every message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    /// Correlates all trace events of one message lifecycle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// Deduplication key for command submission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// The unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: String,

    /// Fully qualified type name including version suffix.
    #[serde(rename = "type")]
    pub message_type: String,

    /// What this message represents.
    pub kind: MessageKind,

    /// Instance stream the message belongs to.
    pub stream: String,

    /// Stream in which the causing command originated, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_stream: Option<String>,

    /// UTC creation timestamp.
    pub timestamp: DateTime<Utc>,

    /// Schema version of the payload.
    pub version: u32,

    /// Ordering token within the stream.
    pub sequence_id: String,

    /// Message-specific data.
    pub payload: serde_json::Value,

    /// Trace and idempotency metadata.
    #[serde(default)]
    pub headers: MessageHeaders,
}

impl Message {
    fn new(kind: MessageKind, stream: &str, message_type: &str, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: message_type.to_string(),
            kind,
            stream: stream.to_string(),
            origin_stream: None,
            timestamp: Utc::now(),
            version: 1,
            sequence_id: String::new(),
            payload,
            headers: MessageHeaders::default(),
        }
    }

    /// Create a domain event for `stream`.
    pub fn event(stream: &str, message_type: &str, payload: serde_json::Value) -> Self {
        Self::new(MessageKind::Event, stream, message_type, payload)
    }

    /// Create a command addressed to `stream`.
    pub fn command(stream: &str, message_type: &str, payload: serde_json::Value) -> Self {
        Self::new(MessageKind::Command, stream, message_type, payload)
    }

    /// Create a position marker recording `position` as committed.
    pub fn read_position(stream: &str, position: u64) -> Self {
        Self::new(
            MessageKind::ReadPosition,
            stream,
            "ReadPosition",
            serde_json::json!({ "position": position }),
        )
    }

    /// Set an explicit message id (useful for testing).
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    /// Set the origin stream for causality filtering.
    pub fn with_origin_stream(mut self, origin_stream: &str) -> Self {
        self.origin_stream = Some(origin_stream.to_string());
        self
    }

    /// Set the ordering token.
    pub fn with_sequence_id(mut self, sequence_id: &str) -> Self {
        self.sequence_id = sequence_id.to_string();
        self
    }

    /// Set the payload schema version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Set the trace id header.
    pub fn with_trace_id(mut self, trace_id: &str) -> Self {
        self.headers.trace_id = Some(trace_id.to_string());
        self
    }

    /// Set the idempotency key header.
    pub fn with_idempotency_key(mut self, key: &str) -> Self {
        self.headers.idempotency_key = Some(key.to_string());
        self
    }

    /// The committed position carried by a READ_POSITION marker.
    pub fn read_position_value(&self) -> Option<u64> {
        if self.kind != MessageKind::ReadPosition {
            return None;
        }
        self.payload.get("position").and_then(|v| v.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_construction() {
        let msg = Message::event(
            "ordering::order-ord-1",
            "Ordering.OrderPlaced.v1",
            serde_json::json!({"order_id": "ord-1"}),
        )
        .with_sequence_id("3.0")
        .with_trace_id("trace-1");

        assert_eq!(msg.kind, MessageKind::Event);
        assert_eq!(msg.stream, "ordering::order-ord-1");
        assert_eq!(msg.sequence_id, "3.0");
        assert_eq!(msg.headers.trace_id.as_deref(), Some("trace-1"));
        assert!(msg.origin_stream.is_none());
    }

    #[test]
    fn test_kind_wire_format() {
        let msg = Message::read_position("position-proj-user", 42);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "READ_POSITION");
        assert_eq!(json["type"], "ReadPosition");
    }

    #[test]
    fn test_read_position_value() {
        let msg = Message::read_position("position-proj-user", 42);
        assert_eq!(msg.read_position_value(), Some(42));

        let event = Message::event("s", "T.v1", serde_json::json!({"position": 7}));
        assert_eq!(event.read_position_value(), None);
    }
}

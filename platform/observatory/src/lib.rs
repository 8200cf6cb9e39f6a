//! # Observatory
//!
//! Structured trace emission for the message processing runtime.
//!
//! Every lifecycle transition — handler invocation, ack/nack/DLQ transfer,
//! outbox publish — emits a [`TraceEvent`] through the [`TraceEmitter`],
//! which fans it out on two channels:
//!
//! - a **live channel** (broadcast) consumed by the SSE endpoint and any
//!   in-process observers;
//! - a **history channel**, a retention-bounded store backing the trace
//!   query API and windowed stats.
//!
//! Emission is gated *before the event is built*: when nobody subscribes to
//! the live channel and retention is disabled, `emit` returns without
//! constructing the event. The subscriber count is refreshed at most every
//! two seconds.
//!
//! A failure anywhere on the tracing path is logged at debug level and
//! swallowed; tracing must never interrupt message processing.

mod activity;
mod emitter;
mod metrics;

pub use activity::Activity;
pub use emitter::{TraceEmitter, TraceQuery, TraceStats};
pub use metrics::Metrics;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stage tags carried in [`TraceEvent::event`].
pub mod stage {
    pub const HANDLER_STARTED: &str = "handler.started";
    pub const HANDLER_COMPLETED: &str = "handler.completed";
    pub const HANDLER_FAILED: &str = "handler.failed";
    pub const MESSAGE_ACKED: &str = "message.acked";
    pub const MESSAGE_NACKED: &str = "message.nacked";
    pub const MESSAGE_DLQ: &str = "message.dlq";
    pub const OUTBOX_PUBLISHED: &str = "outbox.published";
    pub const OUTBOX_FAILED: &str = "outbox.failed";
}

/// Outcome classification of a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Ok,
    Error,
    Retry,
}

/// One structured record of a lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Stage tag, e.g. `handler.completed` (see [`stage`]).
    pub event: String,

    /// Domain the worker is processing.
    pub domain: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,

    pub status: TraceStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,

    /// ISO 8601 UTC timestamp.
    pub timestamp: DateTime<Utc>,
}

impl TraceEvent {
    /// Create a trace event with status `ok` and the current timestamp.
    pub fn new(event: &str, domain: &str) -> Self {
        Self {
            event: event.to_string(),
            domain: domain.to_string(),
            stream: None,
            message_id: None,
            message_type: None,
            status: TraceStatus::Ok,
            handler: None,
            duration_ms: None,
            error: None,
            metadata: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_stream(mut self, stream: &str) -> Self {
        self.stream = Some(stream.to_string());
        self
    }

    pub fn with_message(mut self, message_id: &str, message_type: &str) -> Self {
        self.message_id = Some(message_id.to_string());
        self.message_type = Some(message_type.to_string());
        self
    }

    pub fn with_status(mut self, status: TraceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_handler(mut self, handler: &str) -> Self {
        self.handler = Some(handler.to_string());
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self.status = TraceStatus::Error;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Glob matching with `*` spanning any run of characters.
///
/// Used by the trace query API for `event` and `message_type` filters,
/// e.g. `handler.*` or `Ordering.*.v1`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("handler.*", "handler.started"));
        assert!(glob_match("*.failed", "handler.failed"));
        assert!(glob_match("Ordering.*.v1", "Ordering.OrderPlaced.v1"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("handler.*", "message.acked"));
        assert!(!glob_match("exact", "exactly"));
    }

    #[test]
    fn test_trace_event_builder() {
        let ev = TraceEvent::new(stage::HANDLER_FAILED, "ordering")
            .with_stream("ordering::order-1")
            .with_message("m1", "Ordering.OrderPlaced.v1")
            .with_handler("InventoryHandler")
            .with_error("boom");

        assert_eq!(ev.status, TraceStatus::Error);
        assert_eq!(ev.error.as_deref(), Some("boom"));
        assert_eq!(ev.handler.as_deref(), Some("InventoryHandler"));
    }

    #[test]
    fn test_trace_event_wire_format() {
        let ev = TraceEvent::new(stage::MESSAGE_ACKED, "ordering");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "message.acked");
        assert_eq!(json["status"], "ok");
        assert!(json.get("error").is_none());
        assert!(json.get("metadata").is_none());
    }
}

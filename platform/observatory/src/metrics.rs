//! Prometheus metric registry for the runtime's operational surfaces.

use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// Typed handle over the runtime's Prometheus metrics.
///
/// Gauges are set by the Observatory HTTP surface right before each scrape,
/// from the broker's `health_stats()` and the outbox's status counts.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub outbox_messages: IntGaugeVec,
    pub broker_up: IntGauge,
    pub broker_memory_bytes: IntGauge,
    pub stream_messages_total: IntGaugeVec,
    pub stream_pending: IntGaugeVec,
    pub streams_count: IntGauge,
    pub consumer_groups_count: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let outbox_messages = IntGaugeVec::new(
            Opts::new("outbox_messages", "Outbox entries by status"),
            &["domain", "status"],
        )
        .expect("metric");

        let broker_up = IntGauge::new("broker_up", "Whether the broker responds to ping").expect("metric");

        let broker_memory_bytes =
            IntGauge::new("broker_memory_bytes", "Approximate broker memory usage").expect("metric");

        let stream_messages_total = IntGaugeVec::new(
            Opts::new("stream_messages_total", "Messages per stream"),
            &["stream"],
        )
        .expect("metric");

        let stream_pending = IntGaugeVec::new(
            Opts::new("stream_pending", "Pending (delivered, unacked) messages per stream"),
            &["stream"],
        )
        .expect("metric");

        let streams_count =
            IntGauge::new("streams_count", "Number of known streams").expect("metric");

        let consumer_groups_count =
            IntGauge::new("consumer_groups_count", "Number of consumer groups").expect("metric");

        registry.register(Box::new(outbox_messages.clone())).expect("metric");
        registry.register(Box::new(broker_up.clone())).expect("metric");
        registry.register(Box::new(broker_memory_bytes.clone())).expect("metric");
        registry.register(Box::new(stream_messages_total.clone())).expect("metric");
        registry.register(Box::new(stream_pending.clone())).expect("metric");
        registry.register(Box::new(streams_count.clone())).expect("metric");
        registry.register(Box::new(consumer_groups_count.clone())).expect("metric");

        Self {
            registry,
            outbox_messages,
            broker_up,
            broker_memory_bytes,
            stream_messages_total,
            stream_pending,
            streams_count,
            consumer_groups_count,
        }
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::debug!(error = %err, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_exposes_gauges() {
        let metrics = Metrics::new();
        metrics.broker_up.set(1);
        metrics
            .outbox_messages
            .with_label_values(&["ordering", "PENDING"])
            .set(3);

        let text = metrics.render();
        assert!(text.contains("broker_up 1"));
        assert!(text.contains("outbox_messages{domain=\"ordering\",status=\"PENDING\"} 3"));
    }
}

//! In-memory implementation of the Broker port for testing and development.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::stream::category_of;
use crate::{
    Broker, BrokerCapability, BrokerError, BrokerResult, BrokerStats, Delivery, Message,
    StreamStats,
};

use async_trait::async_trait;

const ALL_CAPABILITIES: &[BrokerCapability] = &[
    BrokerCapability::BasicPubsub,
    BrokerCapability::SimpleQueuing,
    BrokerCapability::ReliableMessaging,
    BrokerCapability::OrderedMessaging,
    BrokerCapability::EnterpriseStreaming,
];

/// Broker implementation backed by in-process data structures.
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that need fast, isolated brokers
///
/// It keeps one append-only log per *category*; a publish to an instance
/// stream lands in its category's log, which is what consumer groups read.
/// Pending lists track delivery counts and nack redelivery times per group,
/// so retry semantics match a real consumer-group broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct Inner {
    /// Append-only log per category.
    logs: HashMap<String, Vec<Message>>,
    /// Consumer-group state keyed by (category, group).
    groups: HashMap<(String, String), GroupState>,
}

#[derive(Default)]
struct GroupState {
    /// Next index in the category log not yet delivered to this group.
    cursor: usize,
    /// Delivered-but-unacknowledged messages, keyed by message id.
    pending: HashMap<String, PendingEntry>,
}

struct PendingEntry {
    message: Message,
    delivery_count: u32,
    /// `None` while the delivery is outstanding; `Some(t)` after a nack,
    /// meaning "redeliver no earlier than t".
    not_before: Option<Instant>,
    /// Position in the category log, used to keep redelivery in order.
    position: usize,
}

impl InMemoryBroker {
    /// Create a new, empty in-memory broker.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn capabilities(&self) -> &[BrokerCapability] {
        ALL_CAPABILITIES
    }

    async fn publish(&self, stream: &str, message: &Message) -> BrokerResult<String> {
        let category = category_of(stream).to_string();
        let mut message = message.clone();
        message.stream = stream.to_string();

        let mut inner = self.inner.lock().await;
        inner.logs.entry(category).or_default().push(message.clone());
        drop(inner);

        self.notify.notify_waiters();
        Ok(message.id)
    }

    async fn read(&self, stream: &str, from: u64, count: usize) -> BrokerResult<Vec<Message>> {
        let category = category_of(stream);
        let inner = self.inner.lock().await;
        let Some(log) = inner.logs.get(category) else {
            return Ok(Vec::new());
        };

        let whole_category = category == stream;
        let skip = from.saturating_sub(1) as usize;
        Ok(log
            .iter()
            .filter(|m| whole_category || m.stream == stream)
            .skip(skip)
            .take(count)
            .cloned()
            .collect())
    }

    async fn read_blocking(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        self.require(BrokerCapability::ReliableMessaging)?;

        let category = category_of(stream).to_string();
        let key = (category.clone(), group.to_string());
        let deadline = Instant::now() + timeout;

        loop {
            // Arm the notification before inspecting state so a publish
            // between the check and the wait is not missed.
            let notified = self.notify.notified();

            let next_ready: Option<Instant> = {
                let mut inner = self.inner.lock().await;
                let Inner { logs, groups } = &mut *inner;
                let state = groups.get_mut(&key).ok_or_else(|| {
                    BrokerError::UnknownConsumerGroup {
                        stream: stream.to_string(),
                        group: group.to_string(),
                    }
                })?;

                let now = Instant::now();
                let mut out = Vec::new();

                // Redeliveries come first, in original log order.
                let mut ready: Vec<&String> = state
                    .pending
                    .iter()
                    .filter(|(_, e)| e.not_before.is_some_and(|t| t <= now))
                    .map(|(id, _)| id)
                    .collect();
                ready.sort_by_key(|id| state.pending[*id].position);
                let ready: Vec<String> = ready.into_iter().cloned().collect();

                for id in ready {
                    if out.len() >= count {
                        break;
                    }
                    let entry = state
                        .pending
                        .get_mut(&id)
                        .ok_or_else(|| BrokerError::Internal("pending entry vanished".into()))?;
                    entry.delivery_count += 1;
                    entry.not_before = None;
                    out.push(Delivery {
                        message: entry.message.clone(),
                        delivery_count: entry.delivery_count,
                    });
                }

                // Then new messages from the category log.
                let log = logs.entry(category.clone()).or_default();
                while out.len() < count && state.cursor < log.len() {
                    let message = log[state.cursor].clone();
                    state.pending.insert(
                        message.id.clone(),
                        PendingEntry {
                            message: message.clone(),
                            delivery_count: 1,
                            not_before: None,
                            position: state.cursor,
                        },
                    );
                    state.cursor += 1;
                    out.push(Delivery {
                        message,
                        delivery_count: 1,
                    });
                }

                if !out.is_empty() {
                    tracing::trace!(
                        stream = %stream,
                        group = %group,
                        consumer = %consumer,
                        delivered = out.len(),
                        "delivered batch"
                    );
                    return Ok(out);
                }

                state
                    .pending
                    .values()
                    .filter_map(|e| e.not_before)
                    .filter(|t| *t > now)
                    .min()
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake = next_ready.map(|t| t.min(deadline)).unwrap_or(deadline);

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> BrokerResult<()> {
        let key = (category_of(stream).to_string(), group.to_string());
        let mut inner = self.inner.lock().await;
        let state = inner
            .groups
            .get_mut(&key)
            .ok_or_else(|| BrokerError::UnknownConsumerGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        state.pending.remove(message_id);
        Ok(())
    }

    async fn nack(
        &self,
        stream: &str,
        group: &str,
        message_id: &str,
        delay: Duration,
    ) -> BrokerResult<()> {
        let key = (category_of(stream).to_string(), group.to_string());
        let mut inner = self.inner.lock().await;
        let state = inner
            .groups
            .get_mut(&key)
            .ok_or_else(|| BrokerError::UnknownConsumerGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        if let Some(entry) = state.pending.get_mut(message_id) {
            entry.not_before = Some(Instant::now() + delay);
        }
        drop(inner);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> BrokerResult<()> {
        let key = (category_of(stream).to_string(), group.to_string());
        let mut inner = self.inner.lock().await;
        inner.groups.entry(key).or_default();
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }

    async fn health_stats(&self) -> BrokerResult<BrokerStats> {
        let inner = self.inner.lock().await;

        let mut stats = BrokerStats {
            consumer_groups_count: inner.groups.len(),
            ..Default::default()
        };

        for log in inner.logs.values() {
            for message in log {
                stats.messages_total += 1;
                // Rough per-message footprint: payload plus envelope overhead.
                stats.memory_bytes += message.payload.to_string().len() as u64 + 128;
                stats
                    .streams
                    .entry(message.stream.clone())
                    .or_insert_with(StreamStats::default)
                    .messages += 1;
            }
        }

        for ((category, _), state) in &inner.groups {
            stats.pending_total += state.pending.len() as u64;
            stats
                .streams
                .entry(category.clone())
                .or_insert_with(StreamStats::default)
                .pending += state.pending.len() as u64;
        }

        stats.streams_count = stats.streams.len();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(stream: &str, n: u32) -> Message {
        Message::event(stream, "Test.Happened.v1", serde_json::json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_group_read_from_instance_streams() {
        let broker = InMemoryBroker::new();
        broker
            .ensure_consumer_group("test::order", "inventory")
            .await
            .unwrap();

        broker.publish("test::order-ord-1", &msg("test::order-ord-1", 1)).await.unwrap();
        broker.publish("test::order-ord-2", &msg("test::order-ord-2", 2)).await.unwrap();

        let batch = broker
            .read_blocking("test::order", "inventory", "c1", Duration::from_millis(100), 10)
            .await
            .unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].message.stream, "test::order-ord-1");
        assert_eq!(batch[1].message.stream, "test::order-ord-2");
        assert_eq!(batch[0].delivery_count, 1);
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let broker = InMemoryBroker::new();
        broker.ensure_consumer_group("test::empty", "g").await.unwrap();

        let start = Instant::now();
        let batch = broker
            .read_blocking("test::empty", "g", "c1", Duration::from_millis(80), 10)
            .await
            .unwrap();

        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        broker.ensure_consumer_group("test::wake", "g").await.unwrap();

        let reader = broker.clone();
        let handle = tokio::spawn(async move {
            reader
                .read_blocking("test::wake", "g", "c1", Duration::from_secs(5), 10)
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish("test::wake-1", &msg("test::wake-1", 1)).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reader timed out")
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_ack_removes_pending() {
        let broker = InMemoryBroker::new();
        broker.ensure_consumer_group("test::ack", "g").await.unwrap();
        broker.publish("test::ack-1", &msg("test::ack-1", 1)).await.unwrap();

        let batch = broker
            .read_blocking("test::ack", "g", "c1", Duration::from_millis(100), 10)
            .await
            .unwrap();
        broker.ack("test::ack", "g", &batch[0].message.id).await.unwrap();

        let stats = broker.health_stats().await.unwrap();
        assert_eq!(stats.pending_total, 0);
    }

    #[tokio::test]
    async fn test_nack_schedules_redelivery_with_count() {
        let broker = InMemoryBroker::new();
        broker.ensure_consumer_group("test::retry", "g").await.unwrap();
        broker.publish("test::retry-1", &msg("test::retry-1", 1)).await.unwrap();

        let first = broker
            .read_blocking("test::retry", "g", "c1", Duration::from_millis(100), 10)
            .await
            .unwrap();
        assert_eq!(first[0].delivery_count, 1);

        broker
            .nack("test::retry", "g", &first[0].message.id, Duration::from_millis(50))
            .await
            .unwrap();

        // Not redeliverable before the delay elapses.
        let early = broker
            .read_blocking("test::retry", "g", "c1", Duration::from_millis(10), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        let second = broker
            .read_blocking("test::retry", "g", "c1", Duration::from_millis(500), 10)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_count, 2);
        assert_eq!(second[0].message.id, first[0].message.id);
    }

    #[tokio::test]
    async fn test_consumer_group_load_balances() {
        let broker = InMemoryBroker::new();
        broker.ensure_consumer_group("test::lb", "g").await.unwrap();
        for n in 0..4 {
            broker
                .publish(&format!("test::lb-{n}"), &msg(&format!("test::lb-{n}"), n))
                .await
                .unwrap();
        }

        let a = broker
            .read_blocking("test::lb", "g", "c1", Duration::from_millis(100), 2)
            .await
            .unwrap();
        let b = broker
            .read_blocking("test::lb", "g", "c2", Duration::from_millis(100), 10)
            .await
            .unwrap();

        // Each message is delivered exactly once per group.
        assert_eq!(a.len() + b.len(), 4);
        let mut ids: Vec<String> = a.iter().chain(b.iter()).map(|d| d.message.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn test_independent_groups_each_see_all() {
        let broker = InMemoryBroker::new();
        broker.ensure_consumer_group("test::fan", "g1").await.unwrap();
        broker.ensure_consumer_group("test::fan", "g2").await.unwrap();
        broker.publish("test::fan-1", &msg("test::fan-1", 1)).await.unwrap();

        let a = broker
            .read_blocking("test::fan", "g1", "c", Duration::from_millis(100), 10)
            .await
            .unwrap();
        let b = broker
            .read_blocking("test::fan", "g2", "c", Duration::from_millis(100), 10)
            .await
            .unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn test_positional_read_by_instance_stream() {
        let broker = InMemoryBroker::new();
        broker.publish("test::pos-1", &msg("test::pos-1", 1)).await.unwrap();
        broker.publish("test::pos-2", &msg("test::pos-2", 2)).await.unwrap();
        broker.publish("test::pos-1", &msg("test::pos-1", 3)).await.unwrap();

        let all = broker.read("test::pos", 1, 10).await.unwrap();
        assert_eq!(all.len(), 3);

        let one = broker.read("test::pos-1", 1, 10).await.unwrap();
        assert_eq!(one.len(), 2);
        assert_eq!(one[1].payload["n"], 3);

        let tail = broker.read("test::pos", 3, 10).await.unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn test_read_blocking_unknown_group_errors() {
        let broker = InMemoryBroker::new();
        let err = broker
            .read_blocking("test::nogroup", "missing", "c", Duration::from_millis(10), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownConsumerGroup { .. }));
    }

    #[tokio::test]
    async fn test_ensure_consumer_group_idempotent() {
        let broker = InMemoryBroker::new();
        broker.ensure_consumer_group("test::idem", "g").await.unwrap();
        broker.publish("test::idem-1", &msg("test::idem-1", 1)).await.unwrap();
        // Re-creating must not reset the cursor or drop pending state.
        broker.ensure_consumer_group("test::idem", "g").await.unwrap();

        let batch = broker
            .read_blocking("test::idem", "g", "c", Duration::from_millis(100), 10)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);

        broker.ensure_consumer_group("test::idem", "g").await.unwrap();
        let again = broker
            .read_blocking("test::idem", "g", "c", Duration::from_millis(20), 10)
            .await
            .unwrap();
        assert!(again.is_empty());
    }
}

//! Integration tests for the outbox claim protocol and relay processor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use message_bus::{
    Broker, BrokerCapability, BrokerResult, BrokerStats, Delivery, InMemoryBroker, Message,
};
use observatory::{stage, TraceEmitter, TraceQuery};
use outbox::{
    ClaimOutcome, InMemoryOutboxStore, OutboxEntry, OutboxProcessor, OutboxProcessorConfig,
    OutboxStatus, OutboxStore, RetryPolicy,
};

fn message(n: u32) -> Message {
    Message::event(
        &format!("dom::order-ord-{n}"),
        "Dom.OrderPlaced.v1",
        serde_json::json!({ "order_id": format!("ord-{n}") }),
    )
}

fn emitter() -> Arc<TraceEmitter> {
    Arc::new(TraceEmitter::new(Duration::from_secs(3600)))
}

fn fast_config(max_attempts: u32) -> OutboxProcessorConfig {
    OutboxProcessorConfig {
        messages_per_tick: 100,
        tick_interval: Duration::from_millis(10),
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(10),
            jitter: false,
            jitter_factor: 0.25,
        },
        ..Default::default()
    }
}

/// Broker double whose first `fail_times` publishes fail.
struct FlakyBroker {
    inner: InMemoryBroker,
    failures_left: AtomicU32,
}

impl FlakyBroker {
    fn new(fail_times: u32) -> Self {
        Self {
            inner: InMemoryBroker::new(),
            failures_left: AtomicU32::new(fail_times),
        }
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    fn capabilities(&self) -> &[BrokerCapability] {
        self.inner.capabilities()
    }

    async fn publish(&self, stream: &str, message: &Message) -> BrokerResult<String> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(message_bus::BrokerError::Connection("broker down".into()));
        }
        self.inner.publish(stream, message).await
    }

    async fn read(&self, stream: &str, from: u64, count: usize) -> BrokerResult<Vec<Message>> {
        self.inner.read(stream, from, count).await
    }

    async fn read_blocking(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>> {
        self.inner.read_blocking(stream, group, consumer, timeout, count).await
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> BrokerResult<()> {
        self.inner.ack(stream, group, message_id).await
    }

    async fn nack(
        &self,
        stream: &str,
        group: &str,
        message_id: &str,
        delay: Duration,
    ) -> BrokerResult<()> {
        self.inner.nack(stream, group, message_id, delay).await
    }

    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> BrokerResult<()> {
        self.inner.ensure_consumer_group(stream, group).await
    }

    async fn ping(&self) -> bool {
        self.inner.ping().await
    }

    async fn health_stats(&self) -> BrokerResult<BrokerStats> {
        self.inner.health_stats().await
    }
}

#[tokio::test]
async fn test_concurrent_claims_exactly_one_wins() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let entry = OutboxEntry::new(message(1));
    let id = entry.id;
    store.enqueue(entry).await.unwrap();

    let lock_timeout = Duration::from_secs(60);
    let (a, b) = tokio::join!(
        store.start_processing(id, "w1", lock_timeout),
        store.start_processing(id, "w2", lock_timeout),
    );

    let wins = [a.unwrap(), b.unwrap()]
        .iter()
        .filter(|o| matches!(o, ClaimOutcome::Claimed(_)))
        .count();
    assert_eq!(wins, 1, "exactly one concurrent claim may succeed");
}

#[tokio::test]
async fn test_entry_progresses_to_published() {
    let store: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let emitter = emitter();

    let entry = OutboxEntry::new(message(1));
    let id = entry.id;
    store.enqueue(entry).await.unwrap();

    let processor = OutboxProcessor::new(
        "dom",
        store.clone(),
        broker.clone(),
        emitter.clone(),
        fast_config(3),
    );
    let published = processor.tick().await.unwrap();
    assert_eq!(published, 1);

    let entry = store.get(id).await.unwrap().unwrap();
    assert_eq!(entry.status, OutboxStatus::Published);

    let messages = broker.read("dom::order-ord-1", 1, 10).await.unwrap();
    assert_eq!(messages.len(), 1);

    let traces = emitter.query(&TraceQuery {
        event: Some(stage::OUTBOX_PUBLISHED.to_string()),
        ..Default::default()
    });
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].stream.as_deref(), Some("dom::order-ord-1"));
}

#[tokio::test]
async fn test_failed_publish_retries_then_succeeds() {
    let store: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
    let broker = Arc::new(FlakyBroker::new(2));
    let emitter = emitter();

    let entry = OutboxEntry::new(message(1));
    let id = entry.id;
    store.enqueue(entry).await.unwrap();

    let processor =
        OutboxProcessor::new("dom", store.clone(), broker.clone(), emitter.clone(), fast_config(5));

    // Two failing attempts, each scheduling a retry.
    for expected_attempts in 1..=2u32 {
        processor.tick().await.unwrap();
        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Failed);
        assert_eq!(entry.attempt_count, expected_attempts);
        assert!(entry.next_attempt_at.is_some());
        assert!(entry.last_error.as_deref().unwrap_or("").contains("broker down"));
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    // Third attempt goes through.
    processor.tick().await.unwrap();
    let entry = store.get(id).await.unwrap().unwrap();
    assert_eq!(entry.status, OutboxStatus::Published);

    let failed = emitter.query(&TraceQuery {
        event: Some(stage::OUTBOX_FAILED.to_string()),
        ..Default::default()
    });
    assert_eq!(failed.len(), 2);
}

#[tokio::test]
async fn test_permanently_failing_entry_is_abandoned() {
    let store: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
    let broker = Arc::new(FlakyBroker::new(u32::MAX));
    let emitter = emitter();

    let entry = OutboxEntry::new(message(1));
    let id = entry.id;
    store.enqueue(entry).await.unwrap();

    let processor =
        OutboxProcessor::new("dom", store.clone(), broker, emitter.clone(), fast_config(3));

    for _ in 0..5 {
        processor.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    let entry = store.get(id).await.unwrap().unwrap();
    assert_eq!(entry.status, OutboxStatus::Abandoned);
    assert_eq!(entry.attempt_count, 3, "abandoned exactly at max_attempts");
    assert!(entry.next_attempt_at.is_none());
}

#[tokio::test]
async fn test_two_processors_publish_each_entry_once() {
    let store: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let emitter = emitter();

    const ENTRIES: usize = 100;
    for n in 0..ENTRIES {
        store.enqueue(OutboxEntry::new(message(n as u32))).await.unwrap();
    }

    let p1 = OutboxProcessor::new("dom", store.clone(), broker.clone(), emitter.clone(), fast_config(3));
    let p2 = OutboxProcessor::new("dom", store.clone(), broker.clone(), emitter.clone(), fast_config(3));
    assert_ne!(p1.worker_id(), p2.worker_id());

    let (a, b) = tokio::join!(
        async {
            let mut total = 0;
            while total < ENTRIES {
                let n = p1.tick().await.unwrap();
                if n == 0 {
                    break;
                }
                total += n;
            }
            total
        },
        async {
            let mut total = 0;
            while total < ENTRIES {
                let n = p2.tick().await.unwrap();
                if n == 0 {
                    break;
                }
                total += n;
            }
            total
        },
    );

    assert_eq!(a + b, ENTRIES, "every entry published exactly once across workers");

    let stats = broker.health_stats().await.unwrap();
    assert_eq!(stats.messages_total as usize, ENTRIES, "no duplicate publishes");

    let counts = store.counts_by_status().await.unwrap();
    assert_eq!(counts.get(&OutboxStatus::Published), Some(&(ENTRIES as u64)));

    let published_traces = emitter.query(&TraceQuery {
        event: Some(stage::OUTBOX_PUBLISHED.to_string()),
        count: 0,
        ..Default::default()
    });
    assert_eq!(published_traces.len(), ENTRIES);
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown() {
    let store: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
    let broker = Arc::new(InMemoryBroker::new());
    let processor = OutboxProcessor::new("dom", store, broker, emitter(), fast_config(3));

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move { processor.run(rx).await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("processor should stop promptly")
        .unwrap();
}

//! Background task that relays claimed outbox entries to the broker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use message_bus::Broker;
use observatory::{stage, Activity, TraceEmitter, TraceEvent, TraceStatus};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{ClaimOutcome, CleanupPolicy, OutboxResult, OutboxStore, RetryPolicy};

/// Configuration for one outbox processor.
#[derive(Debug, Clone)]
pub struct OutboxProcessorConfig {
    pub messages_per_tick: usize,
    pub tick_interval: Duration,
    pub retry: RetryPolicy,
    pub cleanup: CleanupPolicy,
    /// PROCESSING claims older than this are presumed orphaned and become
    /// reclaimable. Keep it at several multiples of the worst-case publish
    /// latency.
    pub lock_timeout: Duration,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            messages_per_tick: 100,
            tick_interval: Duration::from_millis(1000),
            retry: RetryPolicy::default(),
            cleanup: CleanupPolicy::default(),
            lock_timeout: Duration::from_secs(60),
        }
    }
}

/// Relays outbox entries to the broker.
///
/// One processor runs per (database provider, target broker) pair. Several
/// processors may poll the same table — from the same worker or from other
/// worker processes — and coordinate only through the store's atomic claim.
pub struct OutboxProcessor {
    domain: String,
    worker_id: String,
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    emitter: Arc<TraceEmitter>,
    activity: Option<Arc<Activity>>,
    config: OutboxProcessorConfig,
}

impl OutboxProcessor {
    pub fn new(
        domain: &str,
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        emitter: Arc<TraceEmitter>,
        config: OutboxProcessorConfig,
    ) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        let nonce = Uuid::new_v4().simple().to_string();
        Self {
            domain: domain.to_string(),
            worker_id: format!("outbox-{host}-{}-{}", std::process::id(), &nonce[..8]),
            store,
            broker,
            emitter,
            activity: None,
            config,
        }
    }

    /// Attach a shared activity tracker (used by test-mode quiescence).
    pub fn with_activity(mut self, activity: Arc<Activity>) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Poll-process-sleep loop until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            domain = %self.domain,
            worker_id = %self.worker_id,
            "outbox processor started"
        );

        let mut ticks: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(published) if published > 0 => {
                    tracing::debug!(published, "outbox tick published entries");
                    if let Some(activity) = &self.activity {
                        activity.touch();
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "outbox tick failed");
                }
            }

            ticks = ticks.wrapping_add(1);
            if self.config.cleanup.interval_ticks > 0
                && ticks % self.config.cleanup.interval_ticks == 0
            {
                self.cleanup_sweep().await;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender means the engine is gone; stop too.
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }
        }

        tracing::info!(worker_id = %self.worker_id, "outbox processor stopped");
    }

    /// Claim and publish one batch of due entries.
    ///
    /// Returns how many entries were published this tick.
    pub async fn tick(&self) -> OutboxResult<usize> {
        let ids = self
            .store
            .due_entry_ids(Utc::now(), self.config.lock_timeout, self.config.messages_per_tick)
            .await?;

        let mut published = 0;
        for id in ids {
            match self
                .store
                .start_processing(id, &self.worker_id, self.config.lock_timeout)
                .await?
            {
                ClaimOutcome::Claimed(entry) => {
                    if self.publish_entry(entry).await {
                        published += 1;
                    }
                }
                // Lost the race to another worker; move on.
                ClaimOutcome::AlreadyLocked | ClaimOutcome::NotDue | ClaimOutcome::Terminal => {}
            }
        }
        Ok(published)
    }

    async fn publish_entry(&self, entry: crate::OutboxEntry) -> bool {
        match self.broker.publish(&entry.stream_name, &entry.message).await {
            Ok(_) => {
                if let Err(err) = self.store.mark_published(entry.id, &self.worker_id).await {
                    // The publish happened; the stale claim will be retried
                    // and deduplicated by consumer idempotency.
                    tracing::error!(
                        entry_id = %entry.id,
                        error = %err,
                        "published but failed to mark entry"
                    );
                    return false;
                }

                self.emitter.emit(|| {
                    TraceEvent::new(stage::OUTBOX_PUBLISHED, &self.domain)
                        .with_stream(&entry.stream_name)
                        .with_message(&entry.message.id, &entry.message.message_type)
                        .with_metadata(serde_json::json!({ "attempts": entry.attempt_count + 1 }))
                });
                true
            }
            Err(err) => {
                let attempts = entry.attempt_count + 1;
                let abandon = attempts >= self.config.retry.max_attempts;
                let next_attempt_at = if abandon {
                    None
                } else {
                    let delay = self.config.retry.delay_for(attempts);
                    Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default())
                };

                tracing::warn!(
                    entry_id = %entry.id,
                    stream = %entry.stream_name,
                    attempts,
                    abandon,
                    error = %err,
                    "outbox publish failed"
                );

                if let Err(mark_err) = self
                    .store
                    .mark_failed(entry.id, &self.worker_id, &err.to_string(), next_attempt_at, abandon)
                    .await
                {
                    tracing::error!(entry_id = %entry.id, error = %mark_err, "failed to mark entry failed");
                }

                self.emitter.emit(|| {
                    TraceEvent::new(stage::OUTBOX_FAILED, &self.domain)
                        .with_stream(&entry.stream_name)
                        .with_message(&entry.message.id, &entry.message.message_type)
                        .with_error(&err.to_string())
                        .with_status(if abandon { TraceStatus::Error } else { TraceStatus::Retry })
                        .with_metadata(serde_json::json!({
                            "attempt": attempts,
                            "abandoned": abandon,
                        }))
                });
                false
            }
        }
    }

    /// Drop terminal entries past retention. Failures are logged and
    /// swallowed; the sweep runs again next interval.
    async fn cleanup_sweep(&self) {
        let now = Utc::now();
        let published_before = now
            - chrono::Duration::from_std(self.config.cleanup.published_retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let abandoned_before = now
            - chrono::Duration::from_std(self.config.cleanup.abandoned_retention)
                .unwrap_or_else(|_| chrono::Duration::days(7));

        match self.store.cleanup(published_before, abandoned_before).await {
            Ok(removed) if removed > 0 => {
                tracing::debug!(removed, "outbox cleanup removed entries");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "outbox cleanup failed");
            }
        }
    }
}

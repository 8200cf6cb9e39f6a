//! In-memory implementation of the OutboxStore port for testing and development.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{ClaimOutcome, OutboxEntry, OutboxError, OutboxResult, OutboxStatus, OutboxStore};

/// Outbox store backed by a single in-process map.
///
/// One mutex serializes every mutation, which makes the conditional claim
/// exactly as atomic as the `UPDATE ... WHERE status = 'PENDING'` it
/// stands in for.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    entries: Arc<Mutex<HashMap<Uuid, OutboxEntry>>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_claimable(entry: &OutboxEntry, now: DateTime<Utc>, lock_timeout: Duration) -> bool {
    let due = entry.next_attempt_at.map(|t| t <= now).unwrap_or(true);
    match entry.status {
        OutboxStatus::Pending | OutboxStatus::Failed => due,
        OutboxStatus::Processing => entry
            .locked_at
            .map(|t| now - t >= chrono::Duration::from_std(lock_timeout).unwrap_or_default())
            .unwrap_or(true),
        _ => false,
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, entry: OutboxEntry) -> OutboxResult<()> {
        self.entries.lock().await.insert(entry.id, entry);
        Ok(())
    }

    async fn due_entry_ids(
        &self,
        now: DateTime<Utc>,
        lock_timeout: Duration,
        limit: usize,
    ) -> OutboxResult<Vec<Uuid>> {
        let entries = self.entries.lock().await;
        let mut due: Vec<&OutboxEntry> = entries
            .values()
            .filter(|e| is_claimable(e, now, lock_timeout))
            .collect();
        due.sort_by_key(|e| e.created_at);
        Ok(due.into_iter().take(limit).map(|e| e.id).collect())
    }

    async fn start_processing(
        &self,
        id: Uuid,
        worker_id: &str,
        lock_timeout: Duration,
    ) -> OutboxResult<ClaimOutcome> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&id).ok_or(OutboxError::EntryNotFound(id))?;
        let now = Utc::now();

        if entry.status.is_terminal() {
            return Ok(ClaimOutcome::Terminal);
        }
        if !is_claimable(entry, now, lock_timeout) {
            return Ok(match entry.status {
                OutboxStatus::Processing => ClaimOutcome::AlreadyLocked,
                _ => ClaimOutcome::NotDue,
            });
        }

        entry.status = OutboxStatus::Processing;
        entry.locked_by = Some(worker_id.to_string());
        entry.locked_at = Some(now);
        Ok(ClaimOutcome::Claimed(entry.clone()))
    }

    async fn mark_published(&self, id: Uuid, worker_id: &str) -> OutboxResult<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&id).ok_or(OutboxError::EntryNotFound(id))?;
        if entry.status == OutboxStatus::Processing && entry.locked_by.as_deref() == Some(worker_id)
        {
            entry.status = OutboxStatus::Published;
            entry.locked_by = None;
            entry.locked_at = None;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
        abandon: bool,
    ) -> OutboxResult<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&id).ok_or(OutboxError::EntryNotFound(id))?;
        if entry.locked_by.as_deref() != Some(worker_id) {
            return Ok(());
        }
        entry.attempt_count += 1;
        entry.last_error = Some(error.to_string());
        entry.next_attempt_at = next_attempt_at;
        entry.locked_by = None;
        entry.locked_at = None;
        entry.status = if abandon {
            OutboxStatus::Abandoned
        } else {
            OutboxStatus::Failed
        };
        Ok(())
    }

    async fn release(&self, id: Uuid, worker_id: &str) -> OutboxResult<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(&id).ok_or(OutboxError::EntryNotFound(id))?;
        if entry.status == OutboxStatus::Processing && entry.locked_by.as_deref() == Some(worker_id)
        {
            entry.status = OutboxStatus::Pending;
            entry.locked_by = None;
            entry.locked_at = None;
        }
        Ok(())
    }

    async fn cleanup(
        &self,
        published_before: DateTime<Utc>,
        abandoned_before: DateTime<Utc>,
    ) -> OutboxResult<u64> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| match e.status {
            OutboxStatus::Published => e.created_at >= published_before,
            OutboxStatus::Abandoned => e.created_at >= abandoned_before,
            _ => true,
        });
        Ok((before - entries.len()) as u64)
    }

    async fn counts_by_status(&self) -> OutboxResult<HashMap<OutboxStatus, u64>> {
        let entries = self.entries.lock().await;
        let mut counts = HashMap::new();
        for entry in entries.values() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn get(&self, id: Uuid) -> OutboxResult<Option<OutboxEntry>> {
        Ok(self.entries.lock().await.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message_bus::Message;

    fn entry() -> OutboxEntry {
        OutboxEntry::new(Message::event(
            "dom::order-ord-1",
            "Dom.OrderPlaced.v1",
            serde_json::json!({"order_id": "ord-1"}),
        ))
    }

    const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_claim_then_relock_is_refused() {
        let store = InMemoryOutboxStore::new();
        let e = entry();
        let id = e.id;
        store.enqueue(e).await.unwrap();

        assert!(matches!(
            store.start_processing(id, "w1", LOCK_TIMEOUT).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
        assert!(matches!(
            store.start_processing(id, "w2", LOCK_TIMEOUT).await.unwrap(),
            ClaimOutcome::AlreadyLocked
        ));
    }

    #[tokio::test]
    async fn test_terminal_entries_are_not_claimable() {
        let store = InMemoryOutboxStore::new();
        let e = entry();
        let id = e.id;
        store.enqueue(e).await.unwrap();

        store.start_processing(id, "w1", LOCK_TIMEOUT).await.unwrap();
        store.mark_published(id, "w1").await.unwrap();

        assert!(matches!(
            store.start_processing(id, "w2", LOCK_TIMEOUT).await.unwrap(),
            ClaimOutcome::Terminal
        ));
        assert!(store
            .due_entry_ids(Utc::now(), LOCK_TIMEOUT, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_retry_is_not_due_until_time() {
        let store = InMemoryOutboxStore::new();
        let e = entry();
        let id = e.id;
        store.enqueue(e).await.unwrap();

        store.start_processing(id, "w1", LOCK_TIMEOUT).await.unwrap();
        store
            .mark_failed(id, "w1", "boom", Some(Utc::now() + chrono::Duration::seconds(30)), false)
            .await
            .unwrap();

        let got = store.get(id).await.unwrap().unwrap();
        assert_eq!(got.status, OutboxStatus::Failed);
        assert_eq!(got.attempt_count, 1);
        assert_eq!(got.last_error.as_deref(), Some("boom"));
        assert!(got.locked_by.is_none());

        assert!(matches!(
            store.start_processing(id, "w2", LOCK_TIMEOUT).await.unwrap(),
            ClaimOutcome::NotDue
        ));
    }

    #[tokio::test]
    async fn test_failed_entry_claimable_once_due() {
        let store = InMemoryOutboxStore::new();
        let e = entry();
        let id = e.id;
        store.enqueue(e).await.unwrap();

        store.start_processing(id, "w1", LOCK_TIMEOUT).await.unwrap();
        store
            .mark_failed(id, "w1", "boom", Some(Utc::now() - chrono::Duration::seconds(1)), false)
            .await
            .unwrap();

        assert_eq!(
            store.due_entry_ids(Utc::now(), LOCK_TIMEOUT, 10).await.unwrap(),
            vec![id]
        );
        match store.start_processing(id, "w2", LOCK_TIMEOUT).await.unwrap() {
            ClaimOutcome::Claimed(e) => {
                assert_eq!(e.attempt_count, 1);
                assert_eq!(e.locked_by.as_deref(), Some("w2"));
            }
            other => panic!("expected claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimable() {
        let store = InMemoryOutboxStore::new();
        let e = entry();
        let id = e.id;
        store.enqueue(e).await.unwrap();

        store.start_processing(id, "w1", LOCK_TIMEOUT).await.unwrap();

        // With a zero lock timeout every PROCESSING lock is already stale.
        let outcome = store.start_processing(id, "w2", Duration::ZERO).await.unwrap();
        match outcome {
            ClaimOutcome::Claimed(e) => assert_eq!(e.locked_by.as_deref(), Some("w2")),
            other => panic!("expected reclaim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_release_returns_entry_to_pending() {
        let store = InMemoryOutboxStore::new();
        let e = entry();
        let id = e.id;
        store.enqueue(e).await.unwrap();

        store.start_processing(id, "w1", LOCK_TIMEOUT).await.unwrap();
        store.release(id, "w1").await.unwrap();

        let got = store.get(id).await.unwrap().unwrap();
        assert_eq!(got.status, OutboxStatus::Pending);
        assert_eq!(got.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_old_terminal_entries() {
        let store = InMemoryOutboxStore::new();

        let mut published = entry();
        published.status = OutboxStatus::Published;
        published.created_at = Utc::now() - chrono::Duration::hours(48);
        let mut abandoned = entry();
        abandoned.status = OutboxStatus::Abandoned;
        abandoned.created_at = Utc::now() - chrono::Duration::hours(48);
        let pending = entry();

        store.enqueue(published).await.unwrap();
        store.enqueue(abandoned).await.unwrap();
        store.enqueue(pending.clone()).await.unwrap();

        let removed = store
            .cleanup(
                Utc::now() - chrono::Duration::hours(24),
                Utc::now() - chrono::Duration::hours(24),
            )
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let counts = store.counts_by_status().await.unwrap();
        assert_eq!(counts.get(&OutboxStatus::Pending), Some(&1));
        assert_eq!(counts.get(&OutboxStatus::Published), None);
    }
}

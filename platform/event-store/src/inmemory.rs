//! In-memory implementation of the EventStore port for testing and development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use message_bus::stream::category_of;
use message_bus::Message;
use tokio::sync::Mutex;

use crate::{EventStore, ExpectedVersion, Recorded, StoreError, StoreResult};

/// Event store backed by in-process data structures.
///
/// One append-only log per category; per-stream versions are tracked
/// separately so expected-version checks apply to the instance stream an
/// aggregate writes to, while positional reads cover the whole category.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    /// Category log: messages in append order.
    logs: HashMap<String, Vec<Message>>,
    /// Message count per exact stream name.
    versions: HashMap<String, u64>,
}

impl InMemoryEventStore {
    /// Create a new, empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream: &str,
        message: Message,
        expected_version: ExpectedVersion,
    ) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let actual = inner.versions.get(stream).copied().unwrap_or(0);

        match expected_version {
            ExpectedVersion::Any => {}
            ExpectedVersion::NoStream if actual == 0 => {}
            ExpectedVersion::NoStream => {
                return Err(StoreError::VersionConflict {
                    stream: stream.to_string(),
                    expected: "no stream".to_string(),
                    actual,
                });
            }
            ExpectedVersion::Exact(expected) if expected == actual => {}
            ExpectedVersion::Exact(expected) => {
                return Err(StoreError::VersionConflict {
                    stream: stream.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let category = category_of(stream).to_string();
        let mut message = message;
        message.stream = stream.to_string();

        let log = inner.logs.entry(category).or_default();
        log.push(message);
        let position = log.len() as u64;
        *inner.versions.entry(stream.to_string()).or_insert(0) += 1;

        Ok(position)
    }

    async fn read(
        &self,
        stream_or_category: &str,
        from_position: u64,
        count: usize,
    ) -> StoreResult<Vec<Recorded>> {
        let category = category_of(stream_or_category);
        let inner = self.inner.lock().await;
        let Some(log) = inner.logs.get(category) else {
            return Ok(Vec::new());
        };

        let whole_category = category == stream_or_category;
        let from = from_position.max(1);

        Ok(log
            .iter()
            .enumerate()
            .map(|(i, m)| Recorded {
                position: i as u64 + 1,
                message: m.clone(),
            })
            .filter(|r| {
                r.position >= from && (whole_category || r.message.stream == stream_or_category)
            })
            .take(count)
            .collect())
    }

    async fn read_last(&self, stream: &str) -> StoreResult<Option<Recorded>> {
        let category = category_of(stream);
        let inner = self.inner.lock().await;
        let Some(log) = inner.logs.get(category) else {
            return Ok(None);
        };

        let whole_category = category == stream;
        Ok(log
            .iter()
            .enumerate()
            .rev()
            .find(|(_, m)| whole_category || m.stream == stream)
            .map(|(i, m)| Recorded {
                position: i as u64 + 1,
                message: m.clone(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(stream: &str, n: u32) -> Message {
        Message::event(stream, "Test.Happened.v1", serde_json::json!({ "n": n }))
    }

    #[tokio::test]
    async fn test_append_and_read_category() {
        let store = InMemoryEventStore::new();
        store
            .append("user::profile-u1", msg("user::profile-u1", 1), ExpectedVersion::Any)
            .await
            .unwrap();
        store
            .append("user::profile-u2", msg("user::profile-u2", 2), ExpectedVersion::Any)
            .await
            .unwrap();

        let all = store.read("user::profile", 1, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].position, 1);
        assert_eq!(all[1].position, 2);

        let tail = store.read("user::profile", 2, 10).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].message.payload["n"], 2);
    }

    #[tokio::test]
    async fn test_expected_version_enforced() {
        let store = InMemoryEventStore::new();
        let s = "user::profile-u1";

        store
            .append(s, msg(s, 1), ExpectedVersion::NoStream)
            .await
            .unwrap();

        let err = store
            .append(s, msg(s, 2), ExpectedVersion::NoStream)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        store
            .append(s, msg(s, 2), ExpectedVersion::Exact(1))
            .await
            .unwrap();

        let err = store
            .append(s, msg(s, 3), ExpectedVersion::Exact(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { actual: 2, .. }));
    }

    #[tokio::test]
    async fn test_read_last_per_stream() {
        let store = InMemoryEventStore::new();
        store
            .append("position-proj-user", Message::read_position("position-proj-user", 10), ExpectedVersion::Any)
            .await
            .unwrap();
        store
            .append("position-proj-user", Message::read_position("position-proj-user", 25), ExpectedVersion::Any)
            .await
            .unwrap();

        let last = store.read_last("position-proj-user").await.unwrap().unwrap();
        assert_eq!(last.message.read_position_value(), Some(25));
        assert_eq!(last.position, 2);

        assert!(store.read_last("position-proj-order").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_positions_are_stable_across_streams() {
        let store = InMemoryEventStore::new();
        for n in 0..5u32 {
            let s = format!("user::profile-u{}", n % 2);
            store.append(&s, msg(&s, n), ExpectedVersion::Any).await.unwrap();
        }

        let page1 = store.read("user::profile", 1, 3).await.unwrap();
        let page2 = store.read("user::profile", 4, 3).await.unwrap();
        assert_eq!(page1.len(), 3);
        assert_eq!(page2.len(), 2);
        assert_eq!(page2[0].position, 4);
    }
}

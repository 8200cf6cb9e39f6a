//! # Event Store Abstraction
//!
//! Port over an append-only event log. Aggregates append to instance
//! streams with an expected-version check; subscriptions read a whole
//! category by ascending position and track their own position with
//! READ_POSITION markers (there are no consumer groups here).
//!
//! ## Implementations
//!
//! - **InMemoryEventStore**: dev/test implementation
//!
//! Real store adapters implement [`EventStore`] out of tree.

mod inmemory;

pub use inmemory::InMemoryEventStore;

use std::fmt;

use async_trait::async_trait;
use message_bus::Message;

/// Expected stream version for an optimistic-concurrency append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No check; append unconditionally.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream must have exactly this many messages.
    Exact(u64),
}

/// A message read back from the log, with its category-level position.
///
/// Positions are 1-based and strictly increasing within a category.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub position: u64,
    pub message: Message,
}

/// Errors returned by event store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("version conflict on stream '{stream}': expected {expected}, actual {actual}")]
    VersionConflict {
        stream: String,
        expected: String,
        actual: u64,
    },

    #[error("internal store error: {0}")]
    Internal(String),
}

/// Result type for event store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Port over an append-only event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a message to `stream`, enforcing `expected_version`.
    ///
    /// Returns the message's category-level position.
    async fn append(
        &self,
        stream: &str,
        message: Message,
        expected_version: ExpectedVersion,
    ) -> StoreResult<u64>;

    /// Read up to `count` messages from a stream or category, starting at
    /// 1-based position `from_position`.
    async fn read(
        &self,
        stream_or_category: &str,
        from_position: u64,
        count: usize,
    ) -> StoreResult<Vec<Recorded>>;

    /// Read the last message of a stream, if any.
    async fn read_last(&self, stream: &str) -> StoreResult<Option<Recorded>>;
}

impl fmt::Debug for dyn EventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventStore")
    }
}

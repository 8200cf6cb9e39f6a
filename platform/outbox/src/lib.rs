//! # Transactional Outbox
//!
//! Bridges a relational store to the streaming broker. A write-side
//! operation enqueues messages to the outbox in the same transaction as its
//! state change; the [`OutboxProcessor`] claims entries with an exclusive
//! compare-and-set lock, publishes them, and retries failures with
//! exponential backoff and jitter until they are published or abandoned.
//!
//! ## Multi-worker coordination
//!
//! There is no IPC between workers. Correctness rests entirely on the
//! atomic claim in [`OutboxStore::start_processing`]: a conditional update
//! that succeeds for exactly one caller per entry. Stale claims left by
//! crashed workers become reclaimable after `lock_timeout`.
//!
//! ## Implementations
//!
//! - **InMemoryOutboxStore**: dev/test implementation
//! - **PostgresOutboxStore**: production implementation over sqlx

mod inmemory;
mod postgres;
mod processor;

pub use inmemory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use processor::{OutboxProcessor, OutboxProcessorConfig};

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use message_bus::Message;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an outbox entry.
///
/// `PUBLISHED` and `ABANDONED` are terminal and never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Published,
    Failed,
    Abandoned,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
            OutboxStatus::Abandoned => "ABANDONED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OutboxStatus::Pending),
            "PROCESSING" => Some(OutboxStatus::Processing),
            "PUBLISHED" => Some(OutboxStatus::Published),
            "FAILED" => Some(OutboxStatus::Failed),
            "ABANDONED" => Some(OutboxStatus::Abandoned),
            _ => None,
        }
    }

    /// Whether the status can never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::Abandoned)
    }
}

/// Persistent record enqueued transactionally with aggregate state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub stream_name: String,
    pub message: Message,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Create a PENDING entry for `message`, addressed to its stream.
    pub fn new(message: Message) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream_name: message.stream.clone(),
            message,
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            locked_by: None,
            locked_at: None,
            attempt_count: 0,
            last_error: None,
            next_attempt_at: None,
        }
    }
}

/// Result of an exclusive claim attempt.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The caller now holds the PROCESSING lock.
    Claimed(OutboxEntry),
    /// Another worker holds a live PROCESSING lock.
    AlreadyLocked,
    /// The entry exists but its retry is scheduled in the future.
    NotDue,
    /// The entry is PUBLISHED or ABANDONED.
    Terminal,
}

/// Errors returned by outbox operations.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("outbox entry {0} not found")]
    EntryNotFound(Uuid),

    #[error("outbox storage error: {0}")]
    Storage(String),

    #[error("failed to decode outbox entry {id}: {source}")]
    Decode {
        id: Uuid,
        #[source]
        source: serde_json::Error,
    },
}

impl From<sqlx::Error> for OutboxError {
    fn from(err: sqlx::Error) -> Self {
        OutboxError::Storage(err.to_string())
    }
}

/// Result type for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Port over the outbox table.
///
/// Claimable entries are: PENDING or FAILED entries whose `next_attempt_at`
/// is unset or due, plus PROCESSING entries whose lock is older than the
/// configured `lock_timeout` (their worker is presumed dead).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a new PENDING entry.
    async fn enqueue(&self, entry: OutboxEntry) -> OutboxResult<()>;

    /// Ids of claimable entries, oldest first, up to `limit`.
    async fn due_entry_ids(
        &self,
        now: DateTime<Utc>,
        lock_timeout: Duration,
        limit: usize,
    ) -> OutboxResult<Vec<Uuid>>;

    /// Atomically claim an entry for `worker_id`.
    ///
    /// At most one concurrent caller receives [`ClaimOutcome::Claimed`] for
    /// a given entry; everyone else learns why they lost.
    async fn start_processing(
        &self,
        id: Uuid,
        worker_id: &str,
        lock_timeout: Duration,
    ) -> OutboxResult<ClaimOutcome>;

    /// Transition a claimed entry to PUBLISHED and release the lock.
    async fn mark_published(&self, id: Uuid, worker_id: &str) -> OutboxResult<()>;

    /// Record a failed attempt on a claimed entry: increments
    /// `attempt_count`, stores the error, schedules the next attempt (or
    /// abandons when `abandon` is set), and releases the lock.
    async fn mark_failed(
        &self,
        id: Uuid,
        worker_id: &str,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
        abandon: bool,
    ) -> OutboxResult<()>;

    /// Return a claimed entry to PENDING without counting an attempt
    /// (used on graceful shutdown).
    async fn release(&self, id: Uuid, worker_id: &str) -> OutboxResult<()>;

    /// Remove PUBLISHED entries older than `published_before` and
    /// ABANDONED entries older than `abandoned_before`.
    async fn cleanup(
        &self,
        published_before: DateTime<Utc>,
        abandoned_before: DateTime<Utc>,
    ) -> OutboxResult<u64>;

    /// Entry counts per status, for operational surfaces.
    async fn counts_by_status(&self) -> OutboxResult<HashMap<OutboxStatus, u64>>;

    /// Fetch a single entry.
    async fn get(&self, id: Uuid) -> OutboxResult<Option<OutboxEntry>>;
}

impl fmt::Debug for dyn OutboxStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutboxStore")
    }
}

/// Exponential backoff with uniform jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before an entry is abandoned.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    pub jitter: bool,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(60),
            jitter: true,
            jitter_factor: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based):
    /// `base × multiplier^(attempt-1)`, capped at `max_backoff`, then
    /// multiplied by `uniform(1 − jitter_factor, 1 + jitter_factor)` and
    /// clamped to `max_backoff` again.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff.as_secs_f64());
        let jittered = if self.jitter {
            let factor = rand::thread_rng()
                .gen_range((1.0 - self.jitter_factor)..=(1.0 + self.jitter_factor));
            (capped * factor).min(self.max_backoff.as_secs_f64())
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Retention-based cleanup configuration.
#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    /// The sweep runs every this many processor ticks.
    pub interval_ticks: u32,
    pub published_retention: Duration,
    pub abandoned_retention: Duration,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            interval_ticks: 60,
            published_retention: Duration::from_secs(24 * 3600),
            abandoned_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

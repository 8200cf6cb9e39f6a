//! # Message Bus Abstraction
//!
//! A platform-level abstraction for reliable, stream-oriented messaging.
//!
//! ## Why This Lives in Tier 1
//!
//! The broker port is a **shared runtime capability** that subscriptions,
//! the outbox processor, and the engine all depend on. Placing it in
//! `platform/` allows:
//! - Higher layers to depend on the port without knowing the provider
//! - Config-driven swap between a real broker and `InMemoryBroker` (dev/test)
//! - Capability gating: a consumer only calls operations the provider supports
//!
//! ## Implementations
//!
//! - **InMemoryBroker**: dev/test implementation with full consumer-group
//!   semantics (per-category logs, pending lists, delivery counts)
//!
//! Real broker adapters implement [`Broker`] out of tree and sit beside the
//! in-memory one the same way.

mod inmemory;
mod message;
pub mod stream;

pub use inmemory::InMemoryBroker;
pub use message::{Message, MessageHeaders, MessageKind};

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Capabilities a broker provider may support.
///
/// Subscriptions gate their operations on these: a provider that lacks
/// `RELIABLE_MESSAGING` cannot back a consumer-group subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BrokerCapability {
    /// Fire-and-forget publish/subscribe.
    BasicPubsub,
    /// Point-to-point queues without acknowledgement.
    SimpleQueuing,
    /// Consumer groups with ack/nack and redelivery.
    ReliableMessaging,
    /// Per-stream ordering guarantees.
    OrderedMessaging,
    /// Retention, replay, and positional reads.
    EnterpriseStreaming,
}

/// Errors that can occur when using the broker port.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("operation requires capability {0:?} which this broker does not support")]
    UnsupportedCapability(BrokerCapability),

    #[error("consumer group '{group}' does not exist on stream '{stream}'")]
    UnknownConsumerGroup { stream: String, group: String },

    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal broker error: {0}")]
    Internal(String),
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// A message handed to a consumer by a blocking group read.
///
/// `delivery_count` is the broker-maintained attempt counter: 1 on first
/// delivery, incremented on every redelivery after a nack. The retry policy
/// in the subscription layer reads it instead of keeping its own side-store.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub delivery_count: u32,
}

/// Aggregate broker statistics for health surfaces and metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerStats {
    pub streams_count: usize,
    pub consumer_groups_count: usize,
    pub messages_total: u64,
    pub pending_total: u64,
    pub memory_bytes: u64,
    pub streams: HashMap<String, StreamStats>,
}

/// Per-stream statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStats {
    pub messages: u64,
    pub pending: u64,
}

/// Core broker port for stream-oriented messaging.
///
/// Streams are named, ordered, append-only sequences of [`Message`]s.
/// Consumer groups attach at the *category* level (see [`stream`]): a
/// publish to `dom::order-ord-1` is visible to a group reading the
/// `dom::order` category.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Capabilities this provider supports.
    fn capabilities(&self) -> &[BrokerCapability];

    /// Append a message to a stream, returning the broker-assigned id.
    async fn publish(&self, stream: &str, message: &Message) -> BrokerResult<String>;

    /// Read up to `count` messages starting at 1-based position `from`.
    ///
    /// Accepts either an instance stream name or a category name.
    async fn read(&self, stream: &str, from: u64, count: usize) -> BrokerResult<Vec<Message>>;

    /// Blocking group read: return up to `count` deliveries for `consumer`
    /// in `group`, waiting up to `timeout` when nothing is available.
    ///
    /// Returns an empty vector after the timeout elapses. The group must
    /// have been created with [`Broker::ensure_consumer_group`] first.
    async fn read_blocking(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        timeout: Duration,
        count: usize,
    ) -> BrokerResult<Vec<Delivery>>;

    /// Acknowledge a delivered message, removing it from the pending list.
    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> BrokerResult<()>;

    /// Negative-acknowledge a delivered message: schedule it for redelivery
    /// to the group no earlier than `delay` from now.
    async fn nack(
        &self,
        stream: &str,
        group: &str,
        message_id: &str,
        delay: Duration,
    ) -> BrokerResult<()>;

    /// Create the consumer group if it does not exist. Creating an existing
    /// group is not an error.
    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> BrokerResult<()>;

    /// Liveness probe.
    async fn ping(&self) -> bool;

    /// Aggregate statistics for health endpoints and metrics.
    async fn health_stats(&self) -> BrokerResult<BrokerStats>;

    /// Gate an operation on a capability.
    fn require(&self, capability: BrokerCapability) -> BrokerResult<()> {
        if self.capabilities().contains(&capability) {
            Ok(())
        } else {
            Err(BrokerError::UnsupportedCapability(capability))
        }
    }
}

impl fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker")
    }
}

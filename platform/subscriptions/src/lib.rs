//! # Subscriptions
//!
//! The delivery layer between streams and application handlers.
//!
//! Two subscription families exist:
//!
//! - [`StreamSubscription`] consumes a stream category through a broker
//!   consumer group: blocking reads, per-message ack/nack, a retry budget
//!   driven by the broker's delivery counts, and dead-letter routing.
//! - [`EventStoreSubscription`] polls an append-only log by ascending
//!   position with caller-tracked positions. No groups, no retries, no
//!   DLQ; failures are logged and the subscription moves on. Intended for
//!   projections and other idempotent read-model builders.
//!
//! Command handlers never get their own subscription: all command handlers
//! of a category are consolidated behind one [`CommandDispatcher`], which
//! fronts a single stream subscription and routes by command type.
//!
//! Handlers are registered explicitly at construction time; there is no
//! registration by side effect.

pub mod config;
mod dispatcher;
mod identity;
mod stream_subscription;
mod store_subscription;

pub use config::{
    DomainSubscriptionDefaults, SubscriptionOptions, SubscriptionOverrides, SubscriptionPreferences,
    SubscriptionProfile, SubscriptionType,
};
pub use dispatcher::CommandDispatcher;
pub use identity::ConsumerIdentity;
pub use store_subscription::EventStoreSubscription;
pub use stream_subscription::StreamSubscription;

use std::sync::Arc;

use async_trait::async_trait;
use event_store::EventStore;
use message_bus::{Broker, Message};

/// Error raised by a handler while processing one message.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failure(String),
}

impl HandlerError {
    pub fn failure(message: impl Into<String>) -> Self {
        HandlerError::Failure(message.into())
    }
}

/// Everything a handler may need while processing a message.
///
/// Passed explicitly on every dispatch; there is no ambient "current
/// domain" state.
#[derive(Clone)]
pub struct HandlerContext {
    pub domain: String,
    pub broker: Arc<dyn Broker>,
    pub event_store: Arc<dyn EventStore>,
}

impl HandlerContext {
    pub fn new(domain: &str, broker: Arc<dyn Broker>, event_store: Arc<dyn EventStore>) -> Self {
        Self {
            domain: domain.to_string(),
            broker,
            event_store,
        }
    }
}

/// Capability interface implemented by every message handler: event
/// handlers, command handlers, projectors, and external subscribers.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Stable handler name; doubles as the consumer-group name.
    fn name(&self) -> &str;

    /// Stream category this handler subscribes to (e.g. `ordering::order`).
    fn stream_category(&self) -> &str;

    /// Message types this handler serves. Empty means "every type on the
    /// category". Command handlers must list their command types so the
    /// dispatcher can route.
    fn handled_types(&self) -> Vec<String> {
        Vec::new()
    }

    /// Subscription configuration preferences. Merged with domain-level
    /// overrides and framework defaults at engine construction.
    fn subscription_config(&self) -> SubscriptionPreferences {
        SubscriptionPreferences::default()
    }

    /// Process one message.
    async fn dispatch(&self, ctx: &HandlerContext, message: &Message) -> Result<(), HandlerError>;

    /// Optional error hook, invoked after a failed `dispatch`. A failure
    /// inside the hook is caught and logged by the subscription.
    async fn handle_error(&self, _error: &HandlerError, _message: &Message) {}
}

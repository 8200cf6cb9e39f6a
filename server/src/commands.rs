//! Command submission: the sync/async dual path over one handler body.
//!
//! The "sync" path invokes the command handler directly and surfaces its
//! outcome to the caller; the "async" path enqueues the command to the
//! outbox and acknowledges with a positional receipt. Either way the same
//! handler body runs — asynchronously it is reached through the command
//! dispatcher's subscription.
//!
//! Submissions carrying an idempotency key are deduplicated through the
//! idempotency-cache port: a repeat within the TTL never reaches the
//! handler again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use message_bus::{Message, MessageKind};
use outbox::{OutboxEntry, OutboxError, OutboxStore};
use serde::{Deserialize, Serialize};
use subscriptions::{Handler, HandlerContext};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

/// A cached submission outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CachedOutcome {
    Success(serde_json::Value),
    Failure(String),
}

/// Keyed store with TTL used to deduplicate command submissions.
#[async_trait]
pub trait IdempotencyCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CachedOutcome>;
    async fn put(&self, key: &str, outcome: CachedOutcome, ttl: Duration);
}

/// In-process idempotency cache with per-entry expiry.
#[derive(Default)]
pub struct InMemoryIdempotencyCache {
    entries: Mutex<HashMap<String, (CachedOutcome, Instant)>>,
}

impl InMemoryIdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyCache for InMemoryIdempotencyCache {
    async fn get(&self, key: &str) -> Option<CachedOutcome> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((outcome, expires_at)) if *expires_at > Instant::now() => Some(outcome.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn put(&self, key: &str, outcome: CachedOutcome, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), (outcome, Instant::now() + ttl));
    }
}

/// How a duplicate submission is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Return the cached outcome of the first submission.
    ReturnCached,
    /// Raise [`CommandError::Duplicate`].
    Raise,
}

/// Positional receipt for an asynchronously submitted command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReceipt {
    pub entry_id: Uuid,
    pub stream: String,
    pub message_id: String,
}

/// What a mode-routed [`CommandBus::submit`] produced.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Sync mode: the handler ran inline.
    Processed(serde_json::Value),
    /// Async mode: the command sits in the outbox.
    Enqueued(CommandReceipt),
}

/// Errors surfaced to command submitters.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("message is not a command: {0}")]
    NotACommand(String),

    #[error("no command handler registered for '{0}'")]
    NoHandler(String),

    #[error("command handler failed: {0}")]
    Handler(String),

    #[error("duplicate submission for idempotency key '{0}'")]
    Duplicate(String),

    #[error("failed to enqueue command: {0}")]
    Enqueue(#[from] OutboxError),
}

/// Routes submitted commands to their handlers, through the cache and the
/// outbox.
pub struct CommandBus {
    ctx: HandlerContext,
    routes: HashMap<String, Arc<dyn Handler>>,
    outbox_store: Arc<dyn OutboxStore>,
    cache: Arc<dyn IdempotencyCache>,
    mode: crate::config::ProcessingMode,
    ttl: Duration,
    error_ttl: Duration,
}

impl CommandBus {
    pub fn new(
        ctx: HandlerContext,
        command_handlers: &[Arc<dyn Handler>],
        outbox_store: Arc<dyn OutboxStore>,
        cache: Arc<dyn IdempotencyCache>,
        mode: crate::config::ProcessingMode,
        ttl: Duration,
        error_ttl: Duration,
    ) -> Self {
        let mut routes: HashMap<String, Arc<dyn Handler>> = HashMap::new();
        for handler in command_handlers {
            for command_type in handler.handled_types() {
                routes.entry(command_type).or_insert_with(|| handler.clone());
            }
        }
        Self {
            ctx,
            routes,
            outbox_store,
            cache,
            mode,
            ttl,
            error_ttl,
        }
    }

    /// Submit along the path selected by `command_processing` in the
    /// configuration. Both paths run the same handler body.
    pub async fn submit(
        &self,
        command: Message,
        on_duplicate: DuplicatePolicy,
    ) -> Result<SubmitOutcome, CommandError> {
        match self.mode {
            crate::config::ProcessingMode::Sync => self
                .submit_sync(&command, on_duplicate)
                .await
                .map(SubmitOutcome::Processed),
            crate::config::ProcessingMode::Async => self
                .submit_async(command, on_duplicate)
                .await
                .map(SubmitOutcome::Enqueued),
        }
    }

    /// Invoke the command handler inline and return its outcome.
    pub async fn submit_sync(
        &self,
        command: &Message,
        on_duplicate: DuplicatePolicy,
    ) -> Result<serde_json::Value, CommandError> {
        if command.kind != MessageKind::Command {
            return Err(CommandError::NotACommand(command.message_type.clone()));
        }

        if let Some(key) = command.headers.idempotency_key.clone() {
            if let Some(cached) = self.cache.get(&key).await {
                return match on_duplicate {
                    DuplicatePolicy::Raise => Err(CommandError::Duplicate(key)),
                    DuplicatePolicy::ReturnCached => match cached {
                        CachedOutcome::Success(value) => Ok(value),
                        CachedOutcome::Failure(error) => Err(CommandError::Handler(error)),
                    },
                };
            }
        }

        let handler = self
            .routes
            .get(&command.message_type)
            .ok_or_else(|| CommandError::NoHandler(command.message_type.clone()))?;

        match handler.dispatch(&self.ctx, command).await {
            Ok(()) => {
                let value = serde_json::json!({
                    "status": "processed",
                    "message_id": command.id,
                });
                self.remember(command, CachedOutcome::Success(value.clone()), self.ttl)
                    .await;
                Ok(value)
            }
            Err(err) => {
                self.remember(command, CachedOutcome::Failure(err.to_string()), self.error_ttl)
                    .await;
                Err(CommandError::Handler(err.to_string()))
            }
        }
    }

    /// Enqueue the command to the outbox and return a positional receipt.
    ///
    /// The handler runs later, behind the command dispatcher's
    /// subscription, once the outbox relay publishes the message.
    pub async fn submit_async(
        &self,
        command: Message,
        on_duplicate: DuplicatePolicy,
    ) -> Result<CommandReceipt, CommandError> {
        if command.kind != MessageKind::Command {
            return Err(CommandError::NotACommand(command.message_type.clone()));
        }

        if let Some(key) = command.headers.idempotency_key.clone() {
            if let Some(cached) = self.cache.get(&key).await {
                return match (on_duplicate, cached) {
                    (DuplicatePolicy::Raise, _) => Err(CommandError::Duplicate(key)),
                    (DuplicatePolicy::ReturnCached, CachedOutcome::Success(value)) => {
                        serde_json::from_value(value)
                            .map_err(|e| CommandError::Handler(e.to_string()))
                    }
                    (DuplicatePolicy::ReturnCached, CachedOutcome::Failure(error)) => {
                        Err(CommandError::Handler(error))
                    }
                };
            }
        }

        let entry = OutboxEntry::new(command);
        let receipt = CommandReceipt {
            entry_id: entry.id,
            stream: entry.stream_name.clone(),
            message_id: entry.message.id.clone(),
        };
        let key = entry.message.headers.idempotency_key.clone();
        self.outbox_store.enqueue(entry).await?;

        if let Some(key) = key {
            let value = serde_json::to_value(&receipt)
                .unwrap_or_else(|_| serde_json::json!({ "entry_id": receipt.entry_id }));
            self.cache
                .put(&key, CachedOutcome::Success(value), self.ttl)
                .await;
        }

        Ok(receipt)
    }

    async fn remember(&self, command: &Message, outcome: CachedOutcome, ttl: Duration) {
        if let Some(key) = &command.headers.idempotency_key {
            self.cache.put(key, outcome, ttl).await;
        }
    }
}

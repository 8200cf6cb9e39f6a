//! Positional subscription over the event store.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use event_store::ExpectedVersion;
use futures::FutureExt;
use message_bus::{stream, Message};
use observatory::{stage, Activity, TraceEmitter, TraceEvent};
use tokio::sync::watch;

use crate::{Handler, HandlerContext, HandlerError, SubscriptionOptions};

/// Polls an event-store category by ascending position.
///
/// The last processed position is persisted as a READ_POSITION marker on
/// `position-<handler>-<category>` every `position_update_interval`
/// messages, when a batch completes, and on shutdown. A failing handler is
/// logged and the subscription continues — there is no retry loop and no
/// DLQ here, which is why handlers behind this variant are expected to be
/// idempotent projections.
pub struct EventStoreSubscription {
    handler: Arc<dyn Handler>,
    ctx: HandlerContext,
    emitter: Arc<TraceEmitter>,
    activity: Option<Arc<Activity>>,
    options: SubscriptionOptions,
    category: String,
    position_stream: String,
    /// When set, a startup warning flags the missing reliability features.
    production: bool,
}

impl EventStoreSubscription {
    pub fn new(
        handler: Arc<dyn Handler>,
        ctx: HandlerContext,
        emitter: Arc<TraceEmitter>,
        options: SubscriptionOptions,
    ) -> Self {
        let category = handler.stream_category().to_string();
        let position_stream = stream::position_stream(handler.name(), &category);
        Self {
            handler,
            ctx,
            emitter,
            activity: None,
            options,
            category,
            position_stream,
            production: false,
        }
    }

    /// Attach a shared activity tracker (used by test-mode quiescence).
    pub fn with_activity(mut self, activity: Arc<Activity>) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Mark that the hosting engine runs in a production environment.
    pub fn in_production(mut self) -> Self {
        self.production = true;
        self
    }

    pub fn handler_name(&self) -> &str {
        self.handler.name()
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Poll until `shutdown` flips to true; persists the position on exit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if self.production {
            tracing::warn!(
                handler = %self.handler.name(),
                stream = %self.category,
                "event-store subscription in production: no DLQ, no retries, no horizontal scaling"
            );
        }

        let mut position = self.load_position().await;
        let mut since_persist = 0usize;

        tracing::info!(
            handler = %self.handler.name(),
            stream = %self.category,
            position,
            "event-store subscription started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = match self
                .ctx
                .event_store
                .read(&self.category, position + 1, self.options.messages_per_tick)
                .await
            {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!(
                        handler = %self.handler.name(),
                        error = %err,
                        "event store read failed; backing off"
                    );
                    Vec::new()
                }
            };

            if batch.is_empty() {
                if since_persist > 0 {
                    self.persist_position(position).await;
                    since_persist = 0;
                }
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.options.tick_interval) => {}
                }
                continue;
            }

            if let Some(activity) = &self.activity {
                activity.touch();
            }

            for recorded in batch {
                position = recorded.position;
                self.deliver(&recorded.message).await;
                since_persist += 1;
                if since_persist >= self.options.position_update_interval {
                    self.persist_position(position).await;
                    since_persist = 0;
                }
                if *shutdown.borrow() {
                    break;
                }
            }

            // Batch completed.
            if since_persist > 0 {
                self.persist_position(position).await;
                since_persist = 0;
            }
        }

        if since_persist > 0 {
            self.persist_position(position).await;
        }
        tracing::info!(handler = %self.handler.name(), position, "event-store subscription stopped");
    }

    /// Deliver one message, honoring the origin-stream filter.
    pub async fn deliver(&self, message: &Message) {
        if let Some(expected) = &self.options.origin_stream {
            if message.origin_stream.as_deref() != Some(expected.as_str()) {
                tracing::trace!(
                    handler = %self.handler.name(),
                    message_id = %message.id,
                    "skipped by origin-stream filter"
                );
                return;
            }
        }

        self.emitter.emit(|| {
            TraceEvent::new(stage::HANDLER_STARTED, &self.ctx.domain)
                .with_stream(&message.stream)
                .with_message(&message.id, &message.message_type)
                .with_handler(self.handler.name())
        });

        let started = Instant::now();
        let outcome = match AssertUnwindSafe(self.handler.dispatch(&self.ctx, message))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(HandlerError::failure("handler panicked")),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                self.emitter.emit(|| {
                    TraceEvent::new(stage::HANDLER_COMPLETED, &self.ctx.domain)
                        .with_stream(&message.stream)
                        .with_message(&message.id, &message.message_type)
                        .with_handler(self.handler.name())
                        .with_duration_ms(duration_ms)
                });
            }
            Err(err) => {
                // Log-and-continue policy: the position still advances.
                tracing::error!(
                    handler = %self.handler.name(),
                    message_id = %message.id,
                    error = %err,
                    "projection handler failed; continuing"
                );
                self.emitter.emit(|| {
                    TraceEvent::new(stage::HANDLER_FAILED, &self.ctx.domain)
                        .with_stream(&message.stream)
                        .with_message(&message.id, &message.message_type)
                        .with_handler(self.handler.name())
                        .with_duration_ms(duration_ms)
                        .with_error(&err.to_string())
                });

                if AssertUnwindSafe(self.handler.handle_error(&err, message))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    tracing::error!(
                        handler = %self.handler.name(),
                        message_id = %message.id,
                        "handle_error hook panicked"
                    );
                }
            }
        }
    }

    /// Last committed position, or 0 for a fresh subscription.
    pub async fn load_position(&self) -> u64 {
        match self.ctx.event_store.read_last(&self.position_stream).await {
            Ok(Some(recorded)) => recorded.message.read_position_value().unwrap_or(0),
            Ok(None) => 0,
            Err(err) => {
                tracing::warn!(
                    handler = %self.handler.name(),
                    error = %err,
                    "failed to load position; starting from 0"
                );
                0
            }
        }
    }

    async fn persist_position(&self, position: u64) {
        let marker = Message::read_position(&self.position_stream, position);
        if let Err(err) = self
            .ctx
            .event_store
            .append(&self.position_stream, marker, ExpectedVersion::Any)
            .await
        {
            tracing::error!(
                handler = %self.handler.name(),
                position,
                error = %err,
                "failed to persist position"
            );
        }
    }
}

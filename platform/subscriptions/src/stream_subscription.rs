//! Consumer-group subscription over the broker.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use message_bus::{stream, BrokerCapability, Delivery, Message};
use observatory::{stage, Activity, TraceEmitter, TraceEvent, TraceStatus};
use tokio::sync::watch;

use crate::{ConsumerIdentity, Handler, HandlerContext, HandlerError, SubscriptionOptions};

/// Delivers a stream category to one handler through a consumer group.
///
/// Protocol per message: deserialize → dispatch → ack on success; on
/// failure, nack within the retry budget, then dead-letter (or drop when
/// DLQ is disabled). The attempt counter is the broker's delivery count,
/// so redelivery after a worker crash keeps counting where it left off.
pub struct StreamSubscription {
    handler: Arc<dyn Handler>,
    ctx: HandlerContext,
    emitter: Arc<TraceEmitter>,
    activity: Option<Arc<Activity>>,
    options: SubscriptionOptions,
    category: String,
    group: String,
    consumer: ConsumerIdentity,
}

impl StreamSubscription {
    pub fn new(
        handler: Arc<dyn Handler>,
        ctx: HandlerContext,
        emitter: Arc<TraceEmitter>,
        options: SubscriptionOptions,
    ) -> Self {
        let category = handler.stream_category().to_string();
        let group = handler.name().to_string();
        let consumer = ConsumerIdentity::new(handler.name());
        Self {
            handler,
            ctx,
            emitter,
            activity: None,
            options,
            category,
            group,
            consumer,
        }
    }

    /// Attach a shared activity tracker (used by test-mode quiescence).
    pub fn with_activity(mut self, activity: Arc<Activity>) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn handler_name(&self) -> &str {
        self.handler.name()
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Consume until `shutdown` flips to true. The in-flight message is
    /// finished; the rest of its batch is returned to the pending list.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.ctx.broker.require(BrokerCapability::ReliableMessaging) {
            tracing::error!(
                handler = %self.group,
                error = %err,
                "broker cannot back a stream subscription"
            );
            return;
        }

        if let Err(err) = self
            .ctx
            .broker
            .ensure_consumer_group(&self.category, &self.group)
            .await
        {
            tracing::error!(
                handler = %self.group,
                stream = %self.category,
                error = %err,
                "failed to create consumer group"
            );
            return;
        }

        tracing::info!(
            handler = %self.group,
            stream = %self.category,
            consumer = %self.consumer,
            "stream subscription started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                batch = self.ctx.broker.read_blocking(
                    &self.category,
                    &self.group,
                    self.consumer.as_str(),
                    self.options.blocking_timeout,
                    self.options.messages_per_tick,
                ) => batch,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!(
                        handler = %self.group,
                        stream = %self.category,
                        error = %err,
                        "blocking read failed; backing off"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    continue;
                }
            };

            if !batch.is_empty() {
                if let Some(activity) = &self.activity {
                    activity.touch();
                }
            }

            let mut batch = batch.into_iter();
            for delivery in batch.by_ref() {
                self.process(delivery).await;
                if *shutdown.borrow() {
                    break;
                }
            }

            // Whatever we fetched but never processed goes back for
            // immediate redelivery.
            for delivery in batch {
                let _ = self
                    .ctx
                    .broker
                    .nack(
                        &self.category,
                        &self.group,
                        &delivery.message.id,
                        std::time::Duration::ZERO,
                    )
                    .await;
            }
        }

        tracing::info!(handler = %self.group, "stream subscription stopped");
    }

    /// Process one delivery end to end, including the ack/nack/DLQ decision.
    pub async fn process(&self, delivery: Delivery) {
        let message = &delivery.message;

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
            Err(panic) => Err(HandlerError::failure(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
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
                self.ack(message).await;
            }
            Err(err) => {
                tracing::warn!(
                    handler = %self.group,
                    message_id = %message.id,
                    attempt = delivery.delivery_count,
                    error = %err,
                    "handler failed"
                );
                self.emitter.emit(|| {
                    TraceEvent::new(stage::HANDLER_FAILED, &self.ctx.domain)
                        .with_stream(&message.stream)
                        .with_message(&message.id, &message.message_type)
                        .with_handler(self.handler.name())
                        .with_duration_ms(duration_ms)
                        .with_error(&err.to_string())
                        .with_metadata(serde_json::json!({ "attempt": delivery.delivery_count }))
                });

                // The hook is best-effort: a failure inside it is contained.
                if AssertUnwindSafe(self.handler.handle_error(&err, message))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    tracing::error!(
                        handler = %self.group,
                        message_id = %message.id,
                        "handle_error hook panicked"
                    );
                }

                self.apply_retry_policy(&delivery, &err).await;
            }
        }
    }

    async fn apply_retry_policy(&self, delivery: &Delivery, err: &HandlerError) {
        let message = &delivery.message;
        let prior_attempts = delivery.delivery_count.saturating_sub(1);

        if prior_attempts < self.options.max_retries {
            match self
                .ctx
                .broker
                .nack(&self.category, &self.group, &message.id, self.options.retry_delay)
                .await
            {
                Ok(()) => {
                    self.emitter.emit(|| {
                        TraceEvent::new(stage::MESSAGE_NACKED, &self.ctx.domain)
                            .with_stream(&message.stream)
                            .with_message(&message.id, &message.message_type)
                            .with_handler(self.handler.name())
                            .with_status(TraceStatus::Retry)
                            .with_metadata(serde_json::json!({
                                "attempt": delivery.delivery_count,
                                "retry_delay_ms": self.options.retry_delay.as_millis() as u64,
                            }))
                    });
                }
                Err(nack_err) => {
                    tracing::error!(
                        message_id = %message.id,
                        error = %nack_err,
                        "failed to nack message"
                    );
                }
            }
        } else if self.options.enable_dlq {
            self.send_to_dlq(message, delivery.delivery_count, err).await;
        } else {
            tracing::warn!(
                handler = %self.group,
                message_id = %message.id,
                retries = prior_attempts,
                "retries exhausted and DLQ disabled; dropping message"
            );
            self.ack(message).await;
        }
    }

    async fn send_to_dlq(&self, message: &Message, retry_count: u32, err: &HandlerError) {
        let dlq = stream::dlq_stream(&message.stream);
        let dlq_message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            message_type: message.message_type.clone(),
            kind: message.kind,
            stream: dlq.clone(),
            origin_stream: message.origin_stream.clone(),
            timestamp: chrono::Utc::now(),
            version: message.version,
            sequence_id: message.sequence_id.clone(),
            payload: serde_json::json!({
                "message": message,
                "original_stream": message.stream,
                "original_id": message.id,
                "consumer_group": self.group,
                "consumer": self.consumer.as_str(),
                "failed_at": chrono::Utc::now(),
                "retry_count": retry_count,
                "error": err.to_string(),
            }),
            headers: message.headers.clone(),
        };

        match self.ctx.broker.publish(&dlq, &dlq_message).await {
            Ok(_) => {
                // The original leaves the main stream only after the DLQ
                // copy is durable.
                self.ack_silent(message).await;
                self.emitter.emit(|| {
                    TraceEvent::new(stage::MESSAGE_DLQ, &self.ctx.domain)
                        .with_stream(&message.stream)
                        .with_message(&message.id, &message.message_type)
                        .with_handler(self.handler.name())
                        .with_status(TraceStatus::Error)
                        .with_metadata(serde_json::json!({
                            "dlq_stream": dlq,
                            "retry_count": retry_count,
                        }))
                });
                tracing::error!(
                    handler = %self.group,
                    message_id = %message.id,
                    dlq = %dlq,
                    retry_count,
                    "message moved to DLQ after retries exhausted"
                );
            }
            Err(publish_err) => {
                tracing::error!(
                    message_id = %message.id,
                    dlq = %dlq,
                    error = %publish_err,
                    "failed to publish to DLQ; scheduling redelivery"
                );
                let _ = self
                    .ctx
                    .broker
                    .nack(&self.category, &self.group, &message.id, self.options.retry_delay)
                    .await;
            }
        }
    }

    async fn ack(&self, message: &Message) {
        self.ack_silent(message).await;
        self.emitter.emit(|| {
            TraceEvent::new(stage::MESSAGE_ACKED, &self.ctx.domain)
                .with_stream(&message.stream)
                .with_message(&message.id, &message.message_type)
                .with_handler(self.handler.name())
        });
    }

    async fn ack_silent(&self, message: &Message) {
        if let Err(err) = self
            .ctx
            .broker
            .ack(&self.category, &self.group, &message.id)
            .await
        {
            tracing::error!(message_id = %message.id, error = %err, "failed to ack message");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

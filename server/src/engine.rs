//! The per-worker engine: builds the subscription set from the handler
//! registry and runs everything under one cooperative scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use observatory::{Activity, TraceEmitter};
use outbox::OutboxProcessor;
use subscriptions::{
    config::resolve_options, CommandDispatcher, EventStoreSubscription, Handler, HandlerContext,
    StreamSubscription, SubscriptionProfile, SubscriptionType,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::commands::CommandBus;
use crate::config::ConfigError;
use crate::domain::{Domain, Ports};
use crate::observatory_api;

/// Errors raised while constructing or running an engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Runtime options for one engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Exit once all sources are quiet instead of waiting for a signal.
    pub test_mode: bool,
    pub debug: bool,
    /// Test mode: how long the runtime must stay idle before exiting.
    /// Long enough for cascading messages (event → handler → new event)
    /// to keep resetting the clock while work remains.
    pub quiescence_idle: Duration,
    /// How long `run` waits for tasks to drain after shutdown is signalled.
    pub shutdown_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            test_mode: false,
            debug: false,
            quiescence_idle: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl EngineOptions {
    pub fn test_mode() -> Self {
        Self {
            test_mode: true,
            ..Default::default()
        }
    }
}

/// Cooperative stop signal for a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl EngineHandle {
    /// Ask the engine to stop: subscriptions finish their in-flight
    /// message, persist positions, and exit.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// One engine per worker process.
///
/// Construction walks the handler registry: event handlers, projectors,
/// and external subscribers each get their own subscription; command
/// handlers are consolidated per category behind a [`CommandDispatcher`]
/// — separate subscriptions would compete for the same command messages.
pub struct Engine {
    domain_name: String,
    options: EngineOptions,
    emitter: Arc<TraceEmitter>,
    activity: Arc<Activity>,
    ports: Ports,
    observatory_config: crate::config::ObservatoryConfig,
    stream_subscriptions: Vec<Arc<StreamSubscription>>,
    store_subscriptions: Vec<Arc<EventStoreSubscription>>,
    processors: Vec<Arc<OutboxProcessor>>,
    command_bus: Arc<CommandBus>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Engine {
    pub fn new(domain: Domain, ports: Ports, options: EngineOptions) -> Result<Self, EngineError> {
        domain.config.validate()?;

        let emitter = Arc::new(TraceEmitter::new(domain.config.observatory.trace_retention()));
        let activity = Arc::new(Activity::new());
        let ctx = HandlerContext::new(
            &domain.name,
            ports.broker.clone(),
            ports.event_store.clone(),
        );
        let defaults = &domain.config.server;
        let production = !options.test_mode && !options.debug;

        let registered = domain.registry.handler_names();
        for name in defaults.override_names() {
            if !registered.contains(&name) {
                tracing::warn!(
                    handler = %name,
                    "subscription override names no registered handler"
                );
            }
        }

        let mut stream_subscriptions = Vec::new();
        let mut store_subscriptions = Vec::new();

        let plain_handlers = domain
            .registry
            .event_handlers
            .iter()
            .chain(&domain.registry.subscribers)
            .map(|h| (h.clone(), None))
            .chain(
                domain
                    .registry
                    .projectors
                    .iter()
                    .map(|h| (h.clone(), Some(SubscriptionProfile::Projection))),
            );

        for (handler, fallback_profile) in plain_handlers {
            let mut prefs = handler.subscription_config();
            if prefs.profile.is_none() {
                prefs.profile = fallback_profile;
            }
            let opts = resolve_options(handler.name(), &prefs, defaults);
            match opts.subscription_type {
                SubscriptionType::Stream => {
                    stream_subscriptions.push(Arc::new(
                        StreamSubscription::new(handler, ctx.clone(), emitter.clone(), opts)
                            .with_activity(activity.clone()),
                    ));
                }
                SubscriptionType::EventStore => {
                    let mut subscription =
                        EventStoreSubscription::new(handler, ctx.clone(), emitter.clone(), opts)
                            .with_activity(activity.clone());
                    if production {
                        subscription = subscription.in_production();
                    }
                    store_subscriptions.push(Arc::new(subscription));
                }
            }
        }

        // Command handlers: one dispatcher (and one subscription) per
        // category, never one per handler.
        let mut dispatchers: BTreeMap<String, CommandDispatcher> = BTreeMap::new();
        for handler in &domain.registry.command_handlers {
            dispatchers
                .entry(handler.stream_category().to_string())
                .or_insert_with(|| CommandDispatcher::new(handler.stream_category()))
                .register(handler.clone());
        }
        for (category, dispatcher) in dispatchers {
            let prefs = dispatcher.subscription_config();
            let mut opts = resolve_options(dispatcher.name(), &prefs, defaults);
            if opts.subscription_type == SubscriptionType::EventStore {
                tracing::warn!(
                    category = %category,
                    "commands require consumer groups; forcing a stream subscription"
                );
                opts.subscription_type = SubscriptionType::Stream;
            }
            stream_subscriptions.push(Arc::new(
                StreamSubscription::new(Arc::new(dispatcher), ctx.clone(), emitter.clone(), opts)
                    .with_activity(activity.clone()),
            ));
        }

        let mut processors = Vec::new();
        if domain.config.outbox_enabled() {
            processors.push(Arc::new(
                OutboxProcessor::new(
                    &domain.name,
                    ports.outbox_store.clone(),
                    ports.broker.clone(),
                    emitter.clone(),
                    domain.config.outbox.processor_config(),
                )
                .with_activity(activity.clone()),
            ));
        }

        let command_bus = Arc::new(CommandBus::new(
            ctx,
            &domain.registry.command_handlers,
            ports.outbox_store.clone(),
            ports.idempotency.clone(),
            domain.config.command_processing,
            domain.config.idempotency_ttl(),
            domain.config.idempotency_error_ttl(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            domain_name: domain.name,
            options,
            emitter,
            activity,
            ports,
            observatory_config: domain.config.observatory.clone(),
            stream_subscriptions,
            store_subscriptions,
            processors,
            command_bus,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn emitter(&self) -> Arc<TraceEmitter> {
        self.emitter.clone()
    }

    pub fn command_bus(&self) -> Arc<CommandBus> {
        self.command_bus.clone()
    }

    /// Handler names behind stream and event-store subscriptions, in that
    /// order.
    pub fn subscription_names(&self) -> Vec<String> {
        self.stream_subscriptions
            .iter()
            .map(|s| s.handler_name().to_string())
            .chain(
                self.store_subscriptions
                    .iter()
                    .map(|s| s.handler_name().to_string()),
            )
            .collect()
    }

    /// Run until [`EngineHandle::stop`] is called — or, in test mode, until
    /// the runtime has been quiet for the configured idle interval.
    pub async fn run(self) -> Result<(), EngineError> {
        tracing::info!(
            domain = %self.domain_name,
            stream_subscriptions = self.stream_subscriptions.len(),
            store_subscriptions = self.store_subscriptions.len(),
            outbox_processors = self.processors.len(),
            test_mode = self.options.test_mode,
            "engine starting"
        );

        let mut tasks: Vec<(String, JoinHandle<()>)> = Vec::new();

        for subscription in &self.stream_subscriptions {
            let subscription = subscription.clone();
            let rx = self.shutdown_rx.clone();
            tasks.push((
                format!("stream:{}", subscription.handler_name()),
                tokio::spawn(async move { subscription.run(rx).await }),
            ));
        }
        for subscription in &self.store_subscriptions {
            let subscription = subscription.clone();
            let rx = self.shutdown_rx.clone();
            tasks.push((
                format!("event-store:{}", subscription.handler_name()),
                tokio::spawn(async move { subscription.run(rx).await }),
            ));
        }
        for processor in &self.processors {
            let processor = processor.clone();
            let rx = self.shutdown_rx.clone();
            tasks.push((
                "outbox".to_string(),
                tokio::spawn(async move { processor.run(rx).await }),
            ));
        }

        if self.observatory_config.enabled {
            let state = observatory_api::ApiState::new(
                &self.domain_name,
                self.emitter.clone(),
                self.ports.broker.clone(),
                self.ports.outbox_store.clone(),
            );
            let port = self.observatory_config.port;
            let rx = self.shutdown_rx.clone();
            tasks.push((
                "observatory".to_string(),
                tokio::spawn(async move { observatory_api::serve(state, port, rx).await }),
            ));
        }

        if self.options.test_mode {
            self.wait_for_quiescence().await;
        } else {
            let mut rx = self.shutdown_rx.clone();
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }

        let _ = self.shutdown_tx.send(true);

        // Drain: every task gets its share of the grace period, then is
        // aborted.
        let deadline = Instant::now() + self.options.shutdown_grace;
        for (name, mut task) in tasks {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(10));
            match tokio::time::timeout(remaining, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(task = %name, error = %err, "task ended abnormally");
                }
                Err(_) => {
                    tracing::warn!(task = %name, "task exceeded shutdown grace; aborting");
                    task.abort();
                }
            }
        }

        tracing::info!(domain = %self.domain_name, "engine stopped");
        Ok(())
    }

    /// Test-mode exit condition: nothing has processed a message for
    /// `quiescence_idle`, across repeated checks.
    async fn wait_for_quiescence(&self) {
        let mut rx = self.shutdown_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if self.activity.idle_for() >= self.options.quiescence_idle {
                tracing::info!(
                    domain = %self.domain_name,
                    idle_ms = self.activity.idle_for().as_millis() as u64,
                    "test mode: sources quiescent, shutting down"
                );
                return;
            }
            tokio::select! {
                _ = rx.changed() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }
}

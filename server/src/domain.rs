//! Domain assembly: the handler registry and the runtime ports.
//!
//! Handlers are registered explicitly when the application constructs its
//! [`Domain`]; nothing is discovered by import-time side effects. The
//! engine walks this registry once, at construction, to build its
//! subscription set.

use std::sync::Arc;

use event_store::{EventStore, InMemoryEventStore};
use message_bus::{Broker, InMemoryBroker};
use outbox::{InMemoryOutboxStore, OutboxStore, PostgresOutboxStore};
use sqlx::postgres::PgPoolOptions;
use subscriptions::Handler;

use crate::commands::{IdempotencyCache, InMemoryIdempotencyCache};
use crate::config::{ConfigError, ProteanConfig};

/// Explicitly registered handlers, grouped the way the engine consumes
/// them.
#[derive(Default)]
pub struct HandlerRegistry {
    pub event_handlers: Vec<Arc<dyn Handler>>,
    pub command_handlers: Vec<Arc<dyn Handler>>,
    pub projectors: Vec<Arc<dyn Handler>>,
    pub subscribers: Vec<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn handler_names(&self) -> Vec<&str> {
        self.event_handlers
            .iter()
            .chain(&self.command_handlers)
            .chain(&self.projectors)
            .chain(&self.subscribers)
            .map(|h| h.name())
            .collect()
    }

    fn warn_on_duplicate(&self, name: &str) {
        if self.handler_names().contains(&name) {
            tracing::warn!(handler = %name, "handler name registered twice");
        }
    }
}

/// A named domain: its handlers plus its configuration.
pub struct Domain {
    pub name: String,
    pub registry: HandlerRegistry,
    pub config: ProteanConfig,
}

impl Domain {
    pub fn new(name: &str, config: ProteanConfig) -> Self {
        Self {
            name: name.to_string(),
            registry: HandlerRegistry::default(),
            config,
        }
    }

    pub fn register_event_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.registry.warn_on_duplicate(handler.name());
        self.registry.event_handlers.push(handler);
        self
    }

    pub fn register_command_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.registry.warn_on_duplicate(handler.name());
        self.registry.command_handlers.push(handler);
        self
    }

    pub fn register_projector(mut self, handler: Arc<dyn Handler>) -> Self {
        self.registry.warn_on_duplicate(handler.name());
        self.registry.projectors.push(handler);
        self
    }

    pub fn register_subscriber(mut self, handler: Arc<dyn Handler>) -> Self {
        self.registry.warn_on_duplicate(handler.name());
        self.registry.subscribers.push(handler);
        self
    }
}

/// The runtime's external collaborators, behind their ports.
#[derive(Clone)]
pub struct Ports {
    pub broker: Arc<dyn Broker>,
    pub event_store: Arc<dyn EventStore>,
    pub outbox_store: Arc<dyn OutboxStore>,
    pub idempotency: Arc<dyn IdempotencyCache>,
}

impl Ports {
    /// All-in-memory providers, for tests and local development.
    pub fn in_memory() -> Self {
        Self {
            broker: Arc::new(InMemoryBroker::new()),
            event_store: Arc::new(InMemoryEventStore::new()),
            outbox_store: Arc::new(InMemoryOutboxStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyCache::new()),
        }
    }

    /// Build ports from the provider tables in the configuration.
    ///
    /// `memory` providers resolve in process. A `postgres` database
    /// provider backs the outbox store; real broker adapters are supplied
    /// by the application and plugged in by swapping the field.
    pub async fn from_config(config: &ProteanConfig) -> Result<Self, ConfigError> {
        let mut ports = Self::in_memory();

        if let Some(db) = config.databases.get("default") {
            match db.provider.as_str() {
                "memory" => {}
                "postgres" => {
                    let url = db.url.as_deref().ok_or_else(|| {
                        ConfigError::Invalid("databases.default.url required for postgres".into())
                    })?;
                    let pool = PgPoolOptions::new()
                        .max_connections(5)
                        .connect(url)
                        .await
                        .map_err(|e| ConfigError::Invalid(format!("database connection failed: {e}")))?;
                    ports.outbox_store = Arc::new(PostgresOutboxStore::new(pool));
                }
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "unknown database provider '{other}'"
                    )));
                }
            }
        }

        if let Some(broker) = config.brokers.get(&config.outbox.broker) {
            if broker.provider != "memory" {
                return Err(ConfigError::Invalid(format!(
                    "no in-tree adapter for broker provider '{}'; inject one via Ports",
                    broker.provider
                )));
            }
        }

        Ok(ports)
    }
}

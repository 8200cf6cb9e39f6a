//! Command dispatcher: one subscription, many command handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use message_bus::Message;

use crate::{Handler, HandlerContext, HandlerError, SubscriptionPreferences};

/// Multiplexes the commands of one stream category to their handlers.
///
/// Commands must execute exactly once, so giving each command handler its
/// own consumer group over the shared stream would be wrong: every group
/// sees every message, and each command would run once per handler. The
/// dispatcher is itself a [`Handler`], fronting a single stream
/// subscription and routing by command type.
///
/// A command type with no registered handler is acknowledged and dropped
/// with a warning. When two handlers claim the same command type, the
/// first registration wins.
pub struct CommandDispatcher {
    name: String,
    category: String,
    routes: HashMap<String, Arc<dyn Handler>>,
    preferences: SubscriptionPreferences,
}

impl CommandDispatcher {
    pub fn new(category: &str) -> Self {
        Self {
            name: format!("{category}-commands"),
            category: category.to_string(),
            routes: HashMap::new(),
            preferences: SubscriptionPreferences::default(),
        }
    }

    /// Register a command handler for every type it declares.
    ///
    /// The first registered handler's subscription preferences configure
    /// the shared subscription.
    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        if self.routes.is_empty() {
            self.preferences = handler.subscription_config();
        }
        for command_type in handler.handled_types() {
            match self.routes.entry(command_type.clone()) {
                std::collections::hash_map::Entry::Occupied(existing) => {
                    tracing::warn!(
                        command_type = %command_type,
                        kept = %existing.get().name(),
                        ignored = %handler.name(),
                        "command type already registered; first handler wins"
                    );
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(handler.clone());
                }
            }
        }
    }

    /// Number of routable command types.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

#[async_trait]
impl Handler for CommandDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream_category(&self) -> &str {
        &self.category
    }

    fn handled_types(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    fn subscription_config(&self) -> SubscriptionPreferences {
        self.preferences.clone()
    }

    async fn dispatch(&self, ctx: &HandlerContext, message: &Message) -> Result<(), HandlerError> {
        match self.routes.get(&message.message_type) {
            Some(handler) => handler.dispatch(ctx, message).await,
            None => {
                tracing::warn!(
                    dispatcher = %self.name,
                    command_type = %message.message_type,
                    message_id = %message.id,
                    "no handler for command type; dropping"
                );
                Ok(())
            }
        }
    }

    async fn handle_error(&self, error: &HandlerError, message: &Message) {
        if let Some(handler) = self.routes.get(&message.message_type) {
            handler.handle_error(error, message).await;
        }
    }
}

//! Configuration loading: TOML file, environment overlays, validation.
//!
//! The file carries processing modes, provider tables, the `[server]`
//! subscription defaults, `[outbox]`, `[idempotency]`, and
//! `[observatory]`. Top-level tables whose name is not a known key are
//! *environment overlays*: when `PROTEAN_ENV` names one (e.g. `prod`),
//! that table deep-merges over the base before deserialization.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use outbox::{CleanupPolicy, OutboxProcessorConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use subscriptions::{DomainSubscriptionDefaults, SubscriptionType};

/// Environment variable naming the active overlay section.
pub const ENV_VAR: &str = "PROTEAN_ENV";

/// Environment variable overriding the `--domain` path.
pub const DOMAIN_VAR: &str = "PROTEAN_DOMAIN";

const KNOWN_KEYS: &[&str] = &[
    "event_processing",
    "command_processing",
    "message_processing",
    "snapshot_threshold",
    "identity_strategy",
    "identity_type",
    "databases",
    "brokers",
    "caches",
    "event_store",
    "server",
    "outbox",
    "idempotency",
    "observatory",
];

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Whether an operation class runs inline or through the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStrategy {
    Uuid,
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityType {
    Uuid,
    String,
    Integer,
}

/// One `[databases.<name>]` / `[brokers.<name>]` / `[caches.<name>]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub provider: String,
    pub url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: "memory".to_string(),
            url: None,
        }
    }
}

/// `[outbox.retry]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxRetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
    pub jitter_factor: f64,
}

impl Default for OutboxRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_backoff_ms: 60_000,
            jitter: true,
            jitter_factor: 0.25,
        }
    }
}

/// `[outbox.cleanup]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxCleanupConfig {
    pub interval_ticks: u32,
    pub published_retention_hours: u64,
    pub abandoned_retention_hours: u64,
}

impl Default for OutboxCleanupConfig {
    fn default() -> Self {
        Self {
            interval_ticks: 60,
            published_retention_hours: 24,
            abandoned_retention_hours: 168,
        }
    }
}

/// `[outbox]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Legacy explicit switch. Normally the outbox follows the default
    /// subscription type; setting this to `true` together with
    /// `EVENT_STORE` is a startup error.
    pub enabled: Option<bool>,
    /// Which `[brokers.<name>]` entry publishes outbox entries.
    pub broker: String,
    pub messages_per_tick: usize,
    pub tick_interval_ms: u64,
    /// PROCESSING claims older than this are reclaimable. Keep at ≥ 2× the
    /// worst-case publish latency.
    pub lock_timeout_secs: u64,
    pub retry: OutboxRetryConfig,
    pub cleanup: OutboxCleanupConfig,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            broker: "default".to_string(),
            messages_per_tick: 100,
            tick_interval_ms: 1000,
            lock_timeout_secs: 60,
            retry: OutboxRetryConfig::default(),
            cleanup: OutboxCleanupConfig::default(),
        }
    }
}

impl OutboxConfig {
    pub fn processor_config(&self) -> OutboxProcessorConfig {
        OutboxProcessorConfig {
            messages_per_tick: self.messages_per_tick,
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                multiplier: self.retry.multiplier,
                max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
                jitter: self.retry.jitter,
                jitter_factor: self.retry.jitter_factor,
            },
            cleanup: CleanupPolicy {
                interval_ticks: self.cleanup.interval_ticks,
                published_retention: Duration::from_secs(self.cleanup.published_retention_hours * 3600),
                abandoned_retention: Duration::from_secs(self.cleanup.abandoned_retention_hours * 3600),
            },
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
        }
    }
}

/// `[idempotency]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub redis_url: Option<String>,
    pub ttl_seconds: u64,
    pub error_ttl_seconds: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            ttl_seconds: 86_400,
            error_ttl_seconds: 3600,
        }
    }
}

/// `[observatory]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservatoryConfig {
    /// Serve the monitoring HTTP surface from this worker.
    pub enabled: bool,
    pub port: u16,
    pub trace_retention_days: u64,
}

impl Default for ObservatoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8300,
            trace_retention_days: 7,
        }
    }
}

impl ObservatoryConfig {
    pub fn trace_retention(&self) -> Duration {
        Duration::from_secs(self.trace_retention_days * 24 * 3600)
    }
}

/// The complete configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProteanConfig {
    pub event_processing: ProcessingMode,
    pub command_processing: ProcessingMode,
    pub message_processing: ProcessingMode,
    pub snapshot_threshold: u32,
    pub identity_strategy: IdentityStrategy,
    pub identity_type: IdentityType,
    pub databases: HashMap<String, ProviderConfig>,
    pub brokers: HashMap<String, ProviderConfig>,
    pub caches: HashMap<String, ProviderConfig>,
    pub event_store: ProviderConfig,
    pub server: DomainSubscriptionDefaults,
    pub outbox: OutboxConfig,
    pub idempotency: IdempotencyConfig,
    pub observatory: ObservatoryConfig,
}

impl Default for ProteanConfig {
    fn default() -> Self {
        Self {
            event_processing: ProcessingMode::Async,
            command_processing: ProcessingMode::Async,
            message_processing: ProcessingMode::Async,
            snapshot_threshold: 10,
            identity_strategy: IdentityStrategy::Uuid,
            identity_type: IdentityType::Uuid,
            databases: HashMap::new(),
            brokers: HashMap::new(),
            caches: HashMap::new(),
            event_store: ProviderConfig::default(),
            server: DomainSubscriptionDefaults::default(),
            outbox: OutboxConfig::default(),
            idempotency: IdempotencyConfig::default(),
            observatory: ObservatoryConfig::default(),
        }
    }
}

impl ProteanConfig {
    /// Load from a file, applying the `PROTEAN_ENV` overlay. A missing path
    /// yields pure defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let environment = std::env::var(ENV_VAR).ok();
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Self::from_toml_str(&raw, environment.as_deref())
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse a TOML document, merging the overlay section for
    /// `environment` (if any) over the base document.
    pub fn from_toml_str(raw: &str, environment: Option<&str>) -> Result<Self, ConfigError> {
        let mut value: toml::Value = raw.parse()?;

        if let Some(table) = value.as_table_mut() {
            let overlay = environment
                .and_then(|env| table.remove(env))
                .filter(|v| v.is_table());

            // Remaining unknown top-level tables are overlays for other
            // environments; drop them before typed deserialization.
            let unknown: Vec<String> = table
                .keys()
                .filter(|key| !KNOWN_KEYS.contains(&key.as_str()))
                .cloned()
                .collect();
            for key in unknown {
                table.remove(&key);
            }

            if let Some(overlay) = overlay {
                let mut base =
                    toml::Value::Table(std::mem::replace(table, toml::map::Map::new()));
                merge_toml(&mut base, overlay);
                value = base;
            }
        }

        let config: ProteanConfig = value.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation of cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.default_subscription_type == Some(SubscriptionType::EventStore)
            && self.outbox.enabled == Some(true)
        {
            return Err(ConfigError::Invalid(
                "outbox cannot be enabled when default_subscription_type is EVENT_STORE".into(),
            ));
        }
        if self.outbox.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("outbox.retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Whether this domain runs an outbox processor.
    pub fn outbox_enabled(&self) -> bool {
        match self.server.default_subscription_type {
            Some(SubscriptionType::EventStore) => false,
            _ => self.outbox.enabled.unwrap_or(true),
        }
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency.ttl_seconds)
    }

    pub fn idempotency_error_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency.error_ttl_seconds)
    }
}

/// Deep merge: overlay tables merge recursively, anything else replaces.
fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subscriptions::SubscriptionProfile;

    const SAMPLE: &str = r#"
event_processing = "async"
command_processing = "sync"
snapshot_threshold = 25
identity_strategy = "uuid"
identity_type = "string"

[databases.default]
provider = "postgres"
url = "postgres://localhost/app"

[brokers.default]
provider = "memory"

[event_store]
provider = "memory"

[server]
default_subscription_type = "STREAM"
default_subscription_profile = "production"
messages_per_tick = 50

[server.stream_subscription]
retry_delay_ms = 500

[server.subscriptions.InventoryHandler]
max_retries = 7

[outbox]
broker = "default"
messages_per_tick = 20

[outbox.retry]
max_attempts = 4
base_delay_ms = 250

[outbox.cleanup]
published_retention_hours = 12

[idempotency]
ttl_seconds = 600

[observatory]
enabled = true
trace_retention_days = 3

[prod]
snapshot_threshold = 100

[prod.outbox]
messages_per_tick = 500

[test]
snapshot_threshold = 1
"#;

    #[test]
    fn test_parse_full_document() {
        let config = ProteanConfig::from_toml_str(SAMPLE, None).unwrap();
        assert_eq!(config.command_processing, ProcessingMode::Sync);
        assert_eq!(config.snapshot_threshold, 25);
        assert_eq!(config.identity_type, IdentityType::String);
        assert_eq!(config.databases["default"].provider, "postgres");
        assert_eq!(config.server.messages_per_tick, Some(50));
        assert_eq!(
            config.server.default_subscription_profile,
            Some(SubscriptionProfile::Production)
        );
        assert_eq!(
            config.server.stream_subscription.retry_delay_ms,
            Some(500)
        );
        assert_eq!(
            config.server.subscriptions["InventoryHandler"].max_retries,
            Some(7)
        );
        assert_eq!(config.outbox.messages_per_tick, 20);
        assert_eq!(config.outbox.retry.max_attempts, 4);
        assert_eq!(config.outbox.cleanup.published_retention_hours, 12);
        assert_eq!(config.idempotency.ttl_seconds, 600);
        assert!(config.observatory.enabled);
        assert_eq!(config.observatory.trace_retention_days, 3);
        assert!(config.outbox_enabled());
    }

    #[test]
    fn test_env_overlay_merges_over_base() {
        let config = ProteanConfig::from_toml_str(SAMPLE, Some("prod")).unwrap();
        assert_eq!(config.snapshot_threshold, 100);
        assert_eq!(config.outbox.messages_per_tick, 500);
        // Untouched base values survive the merge.
        assert_eq!(config.outbox.retry.max_attempts, 4);
        assert_eq!(config.command_processing, ProcessingMode::Sync);
    }

    #[test]
    fn test_other_env_sections_are_ignored() {
        let config = ProteanConfig::from_toml_str(SAMPLE, Some("test")).unwrap();
        assert_eq!(config.snapshot_threshold, 1);

        let config = ProteanConfig::from_toml_str(SAMPLE, None).unwrap();
        assert_eq!(config.snapshot_threshold, 25);
    }

    #[test]
    fn test_event_store_with_legacy_outbox_flag_is_fatal() {
        let raw = r#"
[server]
default_subscription_type = "EVENT_STORE"

[outbox]
enabled = true
"#;
        let err = ProteanConfig::from_toml_str(raw, None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_event_store_default_disables_outbox() {
        let raw = r#"
[server]
default_subscription_type = "EVENT_STORE"
"#;
        let config = ProteanConfig::from_toml_str(raw, None).unwrap();
        assert!(!config.outbox_enabled());
    }

    #[test]
    fn test_defaults() {
        let config = ProteanConfig::default();
        assert_eq!(config.snapshot_threshold, 10);
        assert_eq!(config.event_processing, ProcessingMode::Async);
        assert_eq!(config.outbox.retry.jitter_factor, 0.25);
        assert_eq!(config.observatory.trace_retention_days, 7);
        assert!(config.outbox_enabled());

        let processor = config.outbox.processor_config();
        assert_eq!(processor.messages_per_tick, 100);
        assert_eq!(processor.lock_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_profile_is_a_parse_error() {
        let raw = r#"
[server]
default_subscription_profile = "warp-speed"
"#;
        assert!(ProteanConfig::from_toml_str(raw, None).is_err());
    }
}

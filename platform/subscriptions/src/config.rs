//! Subscription configuration: profiles, options, and the resolution
//! hierarchy.
//!
//! Each subscription resolves its options through four levels, highest
//! wins:
//!
//! 1. handler-level explicit options,
//! 2. handler-level named profile,
//! 3. domain-level defaults (default type/profile, type-specific tables,
//!    per-handler overrides),
//! 4. framework defaults (the `production` profile).
//!
//! A profile is a preset *bundle* of the five profile fields (type,
//! messages_per_tick, blocking_timeout, max_retries, enable_dlq); applying
//! a profile at a level overwrites exactly those fields.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which subscription family serves a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionType {
    Stream,
    EventStore,
}

/// Named preset bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionProfile {
    /// Reliability: batches of 100, 3 retries, DLQ on.
    Production,
    /// Low latency: small batches, short blocking reads, 1 retry.
    Fast,
    /// Throughput: batches of 500, 5 retries.
    Batch,
    /// Inspection: one message at a time, no retries, no DLQ.
    Debug,
    /// Read-model build over the event store.
    Projection,
}

impl SubscriptionProfile {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "production" => Some(Self::Production),
            "fast" => Some(Self::Fast),
            "batch" => Some(Self::Batch),
            "debug" => Some(Self::Debug),
            "projection" => Some(Self::Projection),
            _ => None,
        }
    }

    /// Overwrite the five bundle fields of `opts` with this profile.
    pub fn apply_bundle(&self, opts: &mut SubscriptionOptions) {
        let (sub_type, per_tick, timeout_ms, max_retries, enable_dlq) = match self {
            Self::Production => (SubscriptionType::Stream, 100, 5000, 3, true),
            Self::Fast => (SubscriptionType::Stream, 10, 100, 1, true),
            Self::Batch => (SubscriptionType::Stream, 500, 10_000, 5, true),
            Self::Debug => (SubscriptionType::Stream, 1, 1000, 0, false),
            Self::Projection => (SubscriptionType::EventStore, 100, 1000, 0, false),
        };
        opts.subscription_type = sub_type;
        opts.messages_per_tick = per_tick;
        opts.blocking_timeout = Duration::from_millis(timeout_ms);
        opts.max_retries = max_retries;
        opts.enable_dlq = enable_dlq;
    }

    /// The full option set for this profile over framework defaults.
    pub fn options(&self) -> SubscriptionOptions {
        let mut opts = SubscriptionOptions::base();
        self.apply_bundle(&mut opts);
        opts
    }
}

/// Fully resolved options for one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionOptions {
    pub subscription_type: SubscriptionType,
    pub messages_per_tick: usize,
    /// Upper bound on one blocking group read.
    pub blocking_timeout: Duration,
    /// Redeliveries granted before DLQ/drop (stream subscriptions only).
    pub max_retries: u32,
    /// Redelivery delay after a nack.
    pub retry_delay: Duration,
    pub enable_dlq: bool,
    /// Sleep between empty polls (event-store subscriptions only).
    pub tick_interval: Duration,
    /// Persist position every N messages (event-store subscriptions only).
    pub position_update_interval: usize,
    /// Drop messages whose origin stream differs (event-store only).
    pub origin_stream: Option<String>,
}

impl SubscriptionOptions {
    fn base() -> Self {
        Self {
            subscription_type: SubscriptionType::Stream,
            messages_per_tick: 100,
            blocking_timeout: Duration::from_millis(5000),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            enable_dlq: true,
            tick_interval: Duration::from_millis(100),
            position_update_interval: 10,
            origin_stream: None,
        }
    }
}

impl Default for SubscriptionOptions {
    /// Framework defaults: the `production` profile.
    fn default() -> Self {
        SubscriptionProfile::Production.options()
    }
}

/// Partial option set; unset fields fall through to the level below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionOverrides {
    #[serde(alias = "type")]
    pub subscription_type: Option<SubscriptionType>,
    pub profile: Option<SubscriptionProfile>,
    pub messages_per_tick: Option<usize>,
    pub blocking_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub enable_dlq: Option<bool>,
    pub tick_interval_ms: Option<u64>,
    pub position_update_interval: Option<usize>,
    pub origin_stream: Option<String>,
}

impl SubscriptionOverrides {
    /// Overlay every set field (except `profile`, which callers apply as a
    /// bundle first) onto `opts`.
    pub fn apply(&self, opts: &mut SubscriptionOptions) {
        if let Some(t) = self.subscription_type {
            opts.subscription_type = t;
        }
        if let Some(n) = self.messages_per_tick {
            opts.messages_per_tick = n;
        }
        if let Some(ms) = self.blocking_timeout_ms {
            opts.blocking_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.max_retries {
            opts.max_retries = n;
        }
        if let Some(ms) = self.retry_delay_ms {
            opts.retry_delay = Duration::from_millis(ms);
        }
        if let Some(b) = self.enable_dlq {
            opts.enable_dlq = b;
        }
        if let Some(ms) = self.tick_interval_ms {
            opts.tick_interval = Duration::from_millis(ms);
        }
        if let Some(n) = self.position_update_interval {
            opts.position_update_interval = n;
        }
        if let Some(s) = &self.origin_stream {
            opts.origin_stream = Some(s.clone());
        }
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// What a handler itself declares via [`crate::Handler::subscription_config`].
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPreferences {
    pub profile: Option<SubscriptionProfile>,
    pub overrides: SubscriptionOverrides,
}

impl SubscriptionPreferences {
    pub fn profile(profile: SubscriptionProfile) -> Self {
        Self {
            profile: Some(profile),
            overrides: SubscriptionOverrides::default(),
        }
    }
}

/// Domain-level subscription defaults (the `[server]` configuration table).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainSubscriptionDefaults {
    pub default_subscription_type: Option<SubscriptionType>,
    pub default_subscription_profile: Option<SubscriptionProfile>,
    pub messages_per_tick: Option<usize>,
    /// Defaults applied to every STREAM subscription.
    pub stream_subscription: SubscriptionOverrides,
    /// Defaults applied to every EVENT_STORE subscription.
    pub event_store_subscription: SubscriptionOverrides,
    /// Per-handler overrides, keyed by handler name.
    pub subscriptions: HashMap<String, SubscriptionOverrides>,
}

impl DomainSubscriptionDefaults {
    /// Handler names with overrides that name no registered handler are a
    /// likely typo; the engine warns about them at startup.
    pub fn override_names(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.keys().map(String::as_str)
    }
}

/// Resolve the options for `handler_name` through the full hierarchy.
pub fn resolve_options(
    handler_name: &str,
    prefs: &SubscriptionPreferences,
    domain: &DomainSubscriptionDefaults,
) -> SubscriptionOptions {
    // Level 4: framework defaults.
    let mut opts = SubscriptionOptions::default();

    // Level 3: domain defaults...
    if let Some(profile) = domain.default_subscription_profile {
        profile.apply_bundle(&mut opts);
    }
    if let Some(sub_type) = domain.default_subscription_type {
        opts.subscription_type = sub_type;
    }
    if let Some(n) = domain.messages_per_tick {
        opts.messages_per_tick = n;
    }
    // ...the table matching the type resolved so far...
    let type_defaults = match opts.subscription_type {
        SubscriptionType::Stream => &domain.stream_subscription,
        SubscriptionType::EventStore => &domain.event_store_subscription,
    };
    if !type_defaults.is_empty() {
        type_defaults.apply(&mut opts);
    }
    // ...then the per-handler override.
    if let Some(per_handler) = domain.subscriptions.get(handler_name) {
        if let Some(profile) = per_handler.profile {
            profile.apply_bundle(&mut opts);
        }
        per_handler.apply(&mut opts);
    }

    // Level 2: handler-level named profile.
    if let Some(profile) = prefs.profile {
        profile.apply_bundle(&mut opts);
    }

    // Level 1: handler-level explicit options.
    if let Some(profile) = prefs.overrides.profile {
        profile.apply_bundle(&mut opts);
    }
    prefs.overrides.apply(&mut opts);

    opts
}

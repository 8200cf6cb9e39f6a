//! Dual-channel trace emitter with a subscriber-count gate.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{glob_match, TraceEvent, TraceStatus};

/// How long a live-channel subscriber count stays cached.
const SUBSCRIBER_CACHE_TTL: Duration = Duration::from_secs(2);

/// Live-channel buffer; subscribers that lag past this drop old traces.
const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Upper bound on retained history, independent of the time-based retention.
const DEFAULT_MAX_HISTORY: usize = 10_000;

/// Filter for querying retained trace history.
#[derive(Debug, Clone, Default)]
pub struct TraceQuery {
    pub domain: Option<String>,
    pub stream: Option<String>,
    /// Glob on the stage tag, e.g. `handler.*`.
    pub event: Option<String>,
    /// Glob on the message type, e.g. `Ordering.*`.
    pub message_type: Option<String>,
    /// Exact message id; returns the message's whole lifecycle.
    pub message_id: Option<String>,
    /// Maximum number of events to return (0 = no limit).
    pub count: usize,
}

impl TraceQuery {
    fn matches(&self, ev: &TraceEvent) -> bool {
        if let Some(d) = &self.domain {
            if &ev.domain != d {
                return false;
            }
        }
        if let Some(s) = &self.stream {
            if ev.stream.as_deref() != Some(s.as_str()) {
                return false;
            }
        }
        if let Some(pattern) = &self.event {
            if !glob_match(pattern, &ev.event) {
                return false;
            }
        }
        if let Some(pattern) = &self.message_type {
            match &ev.message_type {
                Some(t) if glob_match(pattern, t) => {}
                _ => return false,
            }
        }
        if let Some(id) = &self.message_id {
            if ev.message_id.as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Aggregate statistics over a trailing window of trace history.
#[derive(Debug, Clone, Serialize)]
pub struct TraceStats {
    pub window_seconds: u64,
    pub total: u64,
    pub by_event: HashMap<String, u64>,
    pub error_count: u64,
    pub error_rate: f64,
    pub avg_handler_latency_ms: f64,
}

/// Structured trace emitter with dual-channel output.
///
/// Shared across the runtime behind an `Arc`; every task emits through
/// the same channels.
pub struct TraceEmitter {
    sender: broadcast::Sender<TraceEvent>,
    history: Mutex<VecDeque<TraceEvent>>,
    /// Zero disables the history channel entirely.
    retention: Duration,
    max_history: usize,
    subscriber_cache: Mutex<SubscriberCache>,
}

/// `None` forces a refresh on the next emit.
struct SubscriberCache(Option<(usize, Instant)>);

impl TraceEmitter {
    /// Create an emitter retaining history for `retention` (zero disables
    /// the history channel).
    pub fn new(retention: Duration) -> Self {
        let (sender, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            sender,
            history: Mutex::new(VecDeque::new()),
            retention,
            max_history: DEFAULT_MAX_HISTORY,
            subscriber_cache: Mutex::new(SubscriberCache(None)),
        }
    }

    /// Emit a trace event.
    ///
    /// The closure runs only when someone is listening: a live subscriber
    /// exists (count cached for 2 s) or retention is enabled. With neither,
    /// this is a cache lookup and an immediate return.
    pub fn emit<F: FnOnce() -> TraceEvent>(&self, build: F) {
        if !self.retention_enabled() && self.cached_subscriber_count() == 0 {
            return;
        }

        let event = build();

        // No receivers is fine; the history channel may still want it.
        let _ = self.sender.send(event.clone());

        if self.retention_enabled() {
            match self.history.lock() {
                Ok(mut history) => {
                    history.push_back(event);
                    let cutoff = Utc::now()
                        - chrono::Duration::from_std(self.retention)
                            .unwrap_or_else(|_| chrono::Duration::days(7));
                    while history
                        .front()
                        .is_some_and(|e| e.timestamp < cutoff)
                    {
                        history.pop_front();
                    }
                    while history.len() > self.max_history {
                        history.pop_front();
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "trace history unavailable, dropping trace");
                }
            }
        }
    }

    /// Subscribe to the live channel.
    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        // Invalidate the count cache so the new subscriber is seen at once.
        if let Ok(mut cache) = self.subscriber_cache.lock() {
            cache.0 = None;
        }
        self.sender.subscribe()
    }

    /// Query retained history, newest first.
    pub fn query(&self, query: &TraceQuery) -> Vec<TraceEvent> {
        let Ok(history) = self.history.lock() else {
            return Vec::new();
        };
        let mut out: Vec<TraceEvent> = history
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .take(if query.count == 0 { usize::MAX } else { query.count })
            .cloned()
            .collect();

        // Lifecycle lookups read naturally oldest-first.
        if query.message_id.is_some() {
            out.reverse();
        }
        out
    }

    /// Drop all retained history.
    pub fn clear(&self) {
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }
    }

    /// Aggregate statistics over the trailing `window`.
    pub fn stats(&self, window: Duration) -> TraceStats {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(7));

        let mut stats = TraceStats {
            window_seconds: window.as_secs(),
            total: 0,
            by_event: HashMap::new(),
            error_count: 0,
            error_rate: 0.0,
            avg_handler_latency_ms: 0.0,
        };

        let Ok(history) = self.history.lock() else {
            return stats;
        };

        let mut latency_sum: u64 = 0;
        let mut latency_n: u64 = 0;
        for ev in history.iter().filter(|e| e.timestamp >= cutoff) {
            stats.total += 1;
            *stats.by_event.entry(ev.event.clone()).or_insert(0) += 1;
            if ev.status == TraceStatus::Error {
                stats.error_count += 1;
            }
            if ev.event == crate::stage::HANDLER_COMPLETED {
                if let Some(d) = ev.duration_ms {
                    latency_sum += d;
                    latency_n += 1;
                }
            }
        }

        if stats.total > 0 {
            stats.error_rate = stats.error_count as f64 / stats.total as f64;
        }
        if latency_n > 0 {
            stats.avg_handler_latency_ms = latency_sum as f64 / latency_n as f64;
        }
        stats
    }

    fn retention_enabled(&self) -> bool {
        !self.retention.is_zero()
    }

    fn cached_subscriber_count(&self) -> usize {
        let Ok(mut cache) = self.subscriber_cache.lock() else {
            return 0;
        };
        match cache.0 {
            Some((count, refreshed_at)) if refreshed_at.elapsed() < SUBSCRIBER_CACHE_TTL => count,
            _ => {
                let count = self.sender.receiver_count();
                cache.0 = Some((count, Instant::now()));
                count
            }
        }
    }
}

//! Stream naming rules.
//!
//! Two conventions coexist: subscriptions attach to a *category*
//! (`<domain>::<category>`), while individual aggregates write to an
//! *instance stream* (`<domain>::<category>-<aggregate_id>`). Consumer
//! groups attach at the category level, so every function here must agree
//! on how an instance stream maps back to its category.
//!
//! Dead-letter streams (`<stream>:dlq`) and position streams
//! (`position-<handler>-<category>`) are their own category: they are
//! consumed by name, never load-balanced through a category group.

/// Suffix marking a dead-letter stream.
pub const DLQ_SUFFIX: &str = ":dlq";

/// Prefix marking a subscription position stream.
pub const POSITION_PREFIX: &str = "position-";

/// Build an instance stream name: `<domain>::<category>-<aggregate_id>`.
pub fn instance_stream(domain: &str, category: &str, aggregate_id: &str) -> String {
    format!("{domain}::{category}-{aggregate_id}")
}

/// Build a category name: `<domain>::<category>`.
pub fn category_stream(domain: &str, category: &str) -> String {
    format!("{domain}::{category}")
}

/// Build the dead-letter stream for `stream`.
pub fn dlq_stream(stream: &str) -> String {
    format!("{stream}{DLQ_SUFFIX}")
}

/// Build the position stream for a handler on a category.
pub fn position_stream(handler: &str, category: &str) -> String {
    format!("{POSITION_PREFIX}{handler}-{category}")
}

/// Derive the category a stream belongs to.
///
/// The aggregate id starts at the first `-` after the `::` separator, so
/// ids containing `-` (UUIDs, `ord-1`) stay intact:
/// `ordering::order-ord-1` → `ordering::order`. Names without an aggregate
/// id, DLQ streams, and position streams are their own category.
pub fn category_of(stream: &str) -> &str {
    if stream.ends_with(DLQ_SUFFIX) || stream.starts_with(POSITION_PREFIX) {
        return stream;
    }
    let tail_start = stream.find("::").map(|i| i + 2).unwrap_or(0);
    match stream[tail_start..].find('-') {
        Some(i) => &stream[..tail_start + i],
        None => stream,
    }
}

/// Whether `stream` is a dead-letter stream.
pub fn is_dlq(stream: &str) -> bool {
    stream.ends_with(DLQ_SUFFIX)
}

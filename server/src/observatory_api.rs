//! The Observatory HTTP surface: live trace streaming, trace history,
//! and operational summaries for one worker.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use message_bus::Broker;
use observatory::{glob_match, Metrics, TraceEmitter, TraceEvent, TraceQuery};
use outbox::{OutboxStatus, OutboxStore};
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

const DASHBOARD_HTML: &str = include_str!("observatory_dashboard.html");

/// Shared state behind every Observatory route.
#[derive(Clone)]
pub struct ApiState {
    domain: String,
    emitter: Arc<TraceEmitter>,
    broker: Arc<dyn Broker>,
    outbox_store: Arc<dyn OutboxStore>,
    metrics: Metrics,
    started_at: DateTime<Utc>,
}

impl ApiState {
    pub fn new(
        domain: &str,
        emitter: Arc<TraceEmitter>,
        broker: Arc<dyn Broker>,
        outbox_store: Arc<dyn OutboxStore>,
    ) -> Self {
        Self {
            domain: domain.to_string(),
            emitter,
            broker,
            outbox_store,
            metrics: Metrics::new(),
            started_at: Utc::now(),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/stream", get(stream_traces))
        .route("/api/traces", get(list_traces).delete(clear_traces))
        .route("/api/traces/stats", get(trace_stats))
        .route("/api/health", get(health))
        .route("/api/outbox", get(outbox_summary))
        .route("/api/streams", get(streams_summary))
        .route("/api/stats", get(stats_summary))
        .route("/metrics", get(metrics_text))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(state)
}

/// Serve the surface until `shutdown` flips to true.
pub async fn serve(state: ApiState, port: u16, mut shutdown: watch::Receiver<bool>) {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(port, error = %err, "observatory failed to bind");
            return;
        }
    };
    tracing::info!(%addr, "observatory listening");

    let app = router(state);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

    if let Err(err) = result {
        tracing::error!(error = %err, "observatory server failed");
    }
}

async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

#[derive(Debug, Default, Deserialize)]
struct StreamFilter {
    domain: Option<String>,
    stream: Option<String>,
    event: Option<String>,
    #[serde(rename = "type")]
    message_type: Option<String>,
}

impl StreamFilter {
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
        true
    }
}

async fn stream_traces(
    State(state): State<ApiState>,
    Query(filter): Query<StreamFilter>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.emitter.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    if !filter.matches(&ev) {
                        continue;
                    }
                    match serde_json::to_string(&ev) {
                        Ok(json) => yield Ok(Event::default().event("trace").data(json)),
                        Err(err) => {
                            tracing::debug!(error = %err, "failed to serialize trace for SSE");
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "SSE subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Default, Deserialize)]
struct TracesParams {
    count: Option<usize>,
    domain: Option<String>,
    stream: Option<String>,
    event: Option<String>,
    #[serde(rename = "type")]
    message_type: Option<String>,
    message_id: Option<String>,
}

async fn list_traces(
    State(state): State<ApiState>,
    Query(params): Query<TracesParams>,
) -> Json<Vec<TraceEvent>> {
    Json(state.emitter.query(&TraceQuery {
        domain: params.domain,
        stream: params.stream,
        event: params.event,
        message_type: params.message_type,
        message_id: params.message_id,
        count: params.count.unwrap_or(100),
    }))
}

async fn clear_traces(State(state): State<ApiState>) -> Json<serde_json::Value> {
    state.emitter.clear();
    Json(serde_json::json!({ "cleared": true }))
}

#[derive(Debug, Default, Deserialize)]
struct StatsParams {
    window: Option<String>,
}

/// Parse `5m` / `15m` / `1h` / `24h` / `7d` style windows.
fn parse_window(raw: &str) -> Option<Duration> {
    let (digits, unit) = raw.split_at(raw.len().checked_sub(1)?);
    let n: u64 = digits.parse().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 3600)),
        "d" => Some(Duration::from_secs(n * 86_400)),
        _ => None,
    }
}

async fn trace_stats(
    State(state): State<ApiState>,
    Query(params): Query<StatsParams>,
) -> Json<observatory::TraceStats> {
    let window = params
        .window
        .as_deref()
        .and_then(parse_window)
        .unwrap_or(Duration::from_secs(300));
    Json(state.emitter.stats(window))
}

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let broker_up = state.broker.ping().await;
    Json(serde_json::json!({
        "status": if broker_up { "healthy" } else { "degraded" },
        "service": "protean-server",
        "version": env!("CARGO_PKG_VERSION"),
        "domain": state.domain,
        "broker_up": broker_up,
        "started_at": state.started_at,
    }))
}

async fn outbox_summary(State(state): State<ApiState>) -> Json<serde_json::Value> {
    match state.outbox_store.counts_by_status().await {
        Ok(counts) => {
            let by_status: serde_json::Map<String, serde_json::Value> = counts
                .iter()
                .map(|(status, n)| (status.as_str().to_string(), (*n).into()))
                .collect();
            Json(serde_json::json!({ "domain": state.domain, "by_status": by_status }))
        }
        Err(err) => Json(serde_json::json!({ "error": err.to_string() })),
    }
}

async fn streams_summary(State(state): State<ApiState>) -> Json<serde_json::Value> {
    match state.broker.health_stats().await {
        Ok(stats) => Json(serde_json::json!({
            "streams_count": stats.streams_count,
            "streams": stats.streams,
        })),
        Err(err) => Json(serde_json::json!({ "error": err.to_string() })),
    }
}

async fn stats_summary(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let broker = state.broker.health_stats().await.ok();
    let outbox = state.outbox_store.counts_by_status().await.ok();
    let traces = state.emitter.stats(Duration::from_secs(300));
    Json(serde_json::json!({
        "domain": state.domain,
        "uptime_seconds": (Utc::now() - state.started_at).num_seconds(),
        "broker": broker,
        "outbox": outbox.map(|counts| {
            counts
                .iter()
                .map(|(s, n)| (s.as_str().to_string(), *n))
                .collect::<std::collections::HashMap<_, _>>()
        }),
        "traces_5m": traces,
    }))
}

async fn metrics_text(State(state): State<ApiState>) -> impl IntoResponse {
    // Refresh gauges right before the scrape.
    state.metrics.broker_up.set(i64::from(state.broker.ping().await));

    if let Ok(stats) = state.broker.health_stats().await {
        state.metrics.broker_memory_bytes.set(stats.memory_bytes as i64);
        state.metrics.streams_count.set(stats.streams_count as i64);
        state
            .metrics
            .consumer_groups_count
            .set(stats.consumer_groups_count as i64);
        state.metrics.stream_messages_total.reset();
        state.metrics.stream_pending.reset();
        for (stream, s) in &stats.streams {
            state
                .metrics
                .stream_messages_total
                .with_label_values(&[stream])
                .set(s.messages as i64);
            state
                .metrics
                .stream_pending
                .with_label_values(&[stream])
                .set(s.pending as i64);
        }
    }

    if let Ok(counts) = state.outbox_store.counts_by_status().await {
        state.metrics.outbox_messages.reset();
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Published,
            OutboxStatus::Failed,
            OutboxStatus::Abandoned,
        ] {
            state
                .metrics
                .outbox_messages
                .with_label_values(&[&state.domain, status.as_str()])
                .set(counts.get(&status).copied().unwrap_or(0) as i64);
        }
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use message_bus::{InMemoryBroker, Message};
    use observatory::stage;
    use outbox::{InMemoryOutboxStore, OutboxEntry};
    use tower::util::ServiceExt;

    async fn api() -> (Router, Arc<TraceEmitter>) {
        let emitter = Arc::new(TraceEmitter::new(Duration::from_secs(3600)));
        let broker = Arc::new(InMemoryBroker::new());
        let outbox_store = Arc::new(InMemoryOutboxStore::new());

        broker
            .publish(
                "dom::order-ord-1",
                &Message::event("dom::order-ord-1", "Dom.OrderPlaced.v1", serde_json::json!({})),
            )
            .await
            .unwrap();
        outbox_store
            .enqueue(OutboxEntry::new(Message::event(
                "dom::order-ord-2",
                "Dom.OrderPlaced.v1",
                serde_json::json!({}),
            )))
            .await
            .unwrap();

        let state = ApiState::new("dom", emitter.clone(), broker, outbox_store);
        (router(state), emitter)
    }

    async fn get_json(app: &Router, uri: &str) -> serde_json::Value {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "GET {uri}");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _) = api().await;
        let json = get_json(&app, "/api/health").await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "protean-server");
        assert_eq!(json["domain"], "dom");
        assert_eq!(json["broker_up"], true);
    }

    #[tokio::test]
    async fn test_traces_query_and_clear() {
        let (app, emitter) = api().await;
        emitter.emit(|| {
            TraceEvent::new(stage::HANDLER_COMPLETED, "dom")
                .with_message("m1", "Dom.OrderPlaced.v1")
                .with_duration_ms(5)
        });
        emitter.emit(|| {
            TraceEvent::new(stage::MESSAGE_ACKED, "dom").with_message("m1", "Dom.OrderPlaced.v1")
        });

        let traces = get_json(&app, "/api/traces?message_id=m1").await;
        assert_eq!(traces.as_array().unwrap().len(), 2);

        let filtered = get_json(&app, "/api/traces?event=handler.*").await;
        assert_eq!(filtered.as_array().unwrap().len(), 1);

        let stats = get_json(&app, "/api/traces/stats?window=15m").await;
        assert_eq!(stats["total"], 2);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/traces")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let traces = get_json(&app, "/api/traces").await;
        assert!(traces.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outbox_and_streams_summaries() {
        let (app, _) = api().await;

        let outbox = get_json(&app, "/api/outbox").await;
        assert_eq!(outbox["by_status"]["PENDING"], 1);

        let streams = get_json(&app, "/api/streams").await;
        assert_eq!(streams["streams_count"], 1);

        let stats = get_json(&app, "/api/stats").await;
        assert_eq!(stats["domain"], "dom");
        assert!(stats["uptime_seconds"].as_i64().is_some());
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let (app, _) = api().await;
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();

        assert!(text.contains("broker_up 1"));
        assert!(text.contains("streams_count 1"));
        assert!(text.contains("outbox_messages{domain=\"dom\",status=\"PENDING\"} 1"));
    }

    #[tokio::test]
    async fn test_dashboard_served() {
        let (app, _) = api().await;
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_parse_window() {
        assert_eq!(parse_window("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_window("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_window("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_window("24h"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_window("7d"), Some(Duration::from_secs(604_800)));
        assert_eq!(parse_window("nope"), None);
        assert_eq!(parse_window(""), None);
    }

    #[test]
    fn test_stream_filter() {
        let ev = TraceEvent::new("handler.completed", "ordering")
            .with_stream("ordering::order-1")
            .with_message("m1", "Ordering.OrderPlaced.v1");

        let all = StreamFilter::default();
        assert!(all.matches(&ev));

        let by_event = StreamFilter {
            event: Some("handler.*".into()),
            ..Default::default()
        };
        assert!(by_event.matches(&ev));

        let wrong_domain = StreamFilter {
            domain: Some("billing".into()),
            ..Default::default()
        };
        assert!(!wrong_domain.matches(&ev));

        let by_type = StreamFilter {
            message_type: Some("Ordering.*".into()),
            ..Default::default()
        };
        assert!(by_type.matches(&ev));
    }
}

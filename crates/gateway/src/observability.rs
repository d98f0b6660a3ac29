//! Metrics recorder and the observability endpoint.
//!
//! The Prometheus recorder is installed once at startup; the handle is
//! rendered by this module's own `/metrics` route, alongside `/health` and
//! `/stats`, on a port separate from the data plane.

use crate::error::{GatewayError, Result};
use crate::registry::Registry;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router as HttpRouter};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Latency buckets: 1ms to 1s.
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Install the Prometheus recorder and describe every metric.
pub fn install() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_message_latency_seconds".to_string()),
            LATENCY_BUCKETS,
        )
        .map_err(|e| GatewayError::Fatal(format!("metrics buckets: {e}")))?
        .install_recorder()
        .map_err(|e| GatewayError::Fatal(format!("metrics recorder: {e}")))?;

    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    describe_gauge!(
        "gateway_active_connections",
        "Number of active WebSocket connections"
    );
    describe_counter!(
        "gateway_total_connections",
        "Total WebSocket connections since startup"
    );
    describe_counter!(
        "gateway_messages_received_total",
        "Total messages received from clients"
    );
    describe_counter!(
        "gateway_messages_sent_total",
        "Total messages enqueued toward clients"
    );
    describe_histogram!(
        "gateway_message_latency_seconds",
        "Message processing latency in seconds"
    );
    describe_counter!(
        "gateway_auth_attempts_total",
        "Total authentication attempts"
    );
    describe_counter!(
        "gateway_auth_failures_total",
        "Total authentication failures"
    );
    describe_counter!(
        "gateway_rate_limit_hits_total",
        "Total rate limit rejections across all layers"
    );
    describe_gauge!(
        "gateway_shard_connections",
        "Number of connections per shard"
    );
    describe_counter!("gateway_errors_total", "Total errors by type");
    describe_counter!(
        "gateway_messages_dropped_total",
        "Total messages dropped, by reason"
    );
    describe_counter!(
        "gateway_bus_published_total",
        "Total envelopes published on the bus"
    );
    describe_counter!(
        "gateway_bus_received_total",
        "Total envelopes accepted from the bus"
    );
    describe_counter!("gateway_bus_errors_total", "Total bus errors");
}

struct ObsState {
    handle: PrometheusHandle,
    registry: Arc<Registry>,
    started_at: Instant,
}

/// Serve `/metrics`, `/health` and `/stats` until cancelled.
pub async fn serve(
    listener: TcpListener,
    handle: PrometheusHandle,
    registry: Arc<Registry>,
    cancel: CancellationToken,
) {
    let state = Arc::new(ObsState {
        handle,
        registry,
        started_at: Instant::now(),
    });

    let app = HttpRouter::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state);

    info!("metrics endpoint listening");
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
    {
        error!(error = %err, "metrics endpoint failed");
    }
}

async fn metrics_handler(State(state): State<Arc<ObsState>>) -> impl IntoResponse {
    state.handle.render()
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn stats_handler(State(state): State<Arc<ObsState>>) -> impl IntoResponse {
    let shards = state.registry.stats();
    let per_shard: Vec<_> = shards
        .iter()
        .map(|s| {
            serde_json::json!({
                "shard_id": s.shard_id,
                "active": s.active,
                "total_connections": s.total_connections,
                "disconnections": s.disconnections,
            })
        })
        .collect();

    Json(serde_json::json!({
        "active_connections": state.registry.limits().global.current(),
        "shard_count": state.registry.shard_count(),
        "shards": per_shard,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

/// Refresh the connection gauges every 10 seconds.
pub fn spawn_updater(registry: Arc<Registry>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let stats = registry.stats();
                    let mut total = 0usize;
                    for shard in &stats {
                        gauge!("gateway_shard_connections", "shard_id" => shard.shard_id.to_string())
                            .set(shard.active as f64);
                        total += shard.active;
                    }
                    gauge!("gateway_active_connections").set(total as f64);
                }
            }
        }
    })
}

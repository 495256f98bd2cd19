//! Liveness and self-metrics.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use pulse_metrics::render_prometheus;

use crate::ApiState;
use crate::error::ApiResponse;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub subscribers: usize,
    pub topics: usize,
    pub storage_workers: usize,
    pub idle_storage_workers: usize,
}

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> Json<ApiResponse<Health>> {
    ApiResponse::ok(Health {
        status: "ok",
        uptime_secs: state.metrics.snapshot().uptime_secs,
        subscribers: state.broadcaster.total_subscribers(),
        topics: state.broadcaster.topic_count(),
        storage_workers: state.pool.workers(),
        idle_storage_workers: state.pool.idle_workers(),
    })
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let mut snapshot = state.metrics.snapshot();
    let cache = state.cache.counters();
    snapshot.cache_hits = cache.hits;
    snapshot.cache_misses = cache.misses;
    snapshot.cache_errors = cache.errors;
    snapshot.active_subscribers = state.broadcaster.total_subscribers() as u64;
    snapshot.active_topics = state.broadcaster.topic_count() as u64;

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        render_prometheus(&snapshot),
    )
}

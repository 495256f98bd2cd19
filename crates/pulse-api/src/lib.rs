//! pulse-api: HTTP and WebSocket API for Pulse.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/metrics/batch` | Ingest a batch of metric points |
//! | POST | `/api/v1/system-metrics/batch` | Ingest a batch of system telemetry |
//! | GET | `/api/v1/metrics/series` | Points (or rollups) for a run, ascending |
//! | GET | `/api/v1/metrics/latest` | Latest value of a metric |
//! | GET | `/api/v1/metrics/stats` | count / min / max / avg / stddev / latest |
//! | GET | `/api/v1/metrics/recent` | Most recent N points of a metric |
//! | GET | `/api/v1/metrics/rollups` | Hourly rollup buckets |
//! | GET | `/api/v1/metrics/names` | Metric names recorded for a run |
//! | GET | `/api/v1/system-metrics/series` | System telemetry for a run |
//! | GET | `/api/v1/stream/{run_id}` | Live stream (WebSocket) |
//! | GET | `/healthz` | Liveness |
//! | GET | `/metrics` | Prometheus exposition |
//!
//! # Retries
//!
//! A point's identity is `(run_id, metric_name, time)` at microsecond
//! precision. Batches whose points all carry `time` can be resent safely.
//! Points without `time` are stamped by the server, so resending them stores
//! them again; the ingest receipt reports them as `server_timestamped`.

pub mod clock;
pub mod error;
pub mod ingest;
pub mod ops;
pub mod query;
pub mod stream;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{MatchedPath, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;

use pulse_cache::MetricCache;
use pulse_core::PulseConfig;
use pulse_metrics::ServiceMetrics;
use pulse_store::StorePool;
use pulse_stream::Broadcaster;

pub use clock::IngestClock;
pub use error::{ApiError, ApiResponse, ApiResult};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub pool: StorePool,
    pub cache: Arc<MetricCache>,
    pub broadcaster: Broadcaster,
    pub metrics: Arc<ServiceMetrics>,
    pub config: Arc<PulseConfig>,
    pub clock: Arc<IngestClock>,
    /// Flips to `true` when the server is shutting down.
    pub shutdown: watch::Receiver<bool>,
    /// Open stream sessions. Upgraded sockets outlive the HTTP server, so
    /// shutdown waits on this.
    pub sessions: TaskTracker,
}

impl ApiState {
    /// State with a cache, broadcaster and metrics built from `config`.
    pub fn new(pool: StorePool, config: PulseConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            pool,
            cache: Arc::new(MetricCache::from_config(&config.cache)),
            broadcaster: Broadcaster::new(config.stream.queue_capacity),
            metrics: Arc::new(ServiceMetrics::new()),
            config: Arc::new(config),
            clock: Arc::new(IngestClock::new()),
            shutdown,
            sessions: TaskTracker::new(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<MetricCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Stop tracking new stream sessions and wait up to `limit` for the open
    /// ones to drain. Returns `false` if some were still running.
    pub async fn drain_sessions(&self, limit: Duration) -> bool {
        self.sessions.close();
        tokio::time::timeout(limit, self.sessions.wait()).await.is_ok()
    }
}

/// Build the complete router (REST + stream + health + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/metrics/batch", post(ingest::ingest_metrics))
        .route("/system-metrics/batch", post(ingest::ingest_system_metrics))
        .route("/metrics/series", get(query::get_series))
        .route("/metrics/latest", get(query::get_latest))
        .route("/metrics/stats", get(query::get_stats))
        .route("/metrics/recent", get(query::get_recent))
        .route("/metrics/rollups", get(query::get_rollups))
        .route("/metrics/names", get(query::get_metric_names))
        .route("/system-metrics/series", get(query::get_system_series))
        .route("/stream/{run_id}", get(stream::stream_run))
        .route_layer(middleware::from_fn_with_state(state.clone(), track_requests));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(ops::healthz))
        .route("/metrics", get(ops::prometheus_metrics))
        .with_state(state)
}

/// Per-route request count, error count and latency.
async fn track_requests(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let started = Instant::now();
    let response = next.run(req).await;
    let status = response.status();
    state.metrics.record_request(
        &route,
        started.elapsed().as_micros() as u64,
        status.is_client_error() || status.is_server_error(),
    );
    response
}

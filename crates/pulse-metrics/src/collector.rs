//! Service counters.
//!
//! Plain atomics for the counters; per-route latency samples sit in a
//! bounded window behind a short lock.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

/// Latency samples kept per route.
const LATENCY_WINDOW: usize = 2048;

struct RouteMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    /// Recent latencies in microseconds.
    latencies: Mutex<VecDeque<u64>>,
}

impl RouteMetrics {
    fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteSnapshot {
    pub route: String,
    pub requests: u64,
    pub errors: u64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
}

/// Point-in-time view of every counter. Cache and stream gauges are owned
/// elsewhere and filled in by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub batches_accepted: u64,
    pub batches_rejected: u64,
    pub points_ingested: u64,
    pub system_points_ingested: u64,
    pub storage_errors: u64,
    pub published_batches: u64,
    pub stream_messages_dropped: u64,
    pub subscriptions_opened: u64,
    pub subscriptions_closed: u64,
    pub rollups_materialized: u64,
    pub points_evicted: u64,
    pub partitions_dropped: u64,
    pub maintenance_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_errors: u64,
    pub active_subscribers: u64,
    pub active_topics: u64,
    pub routes: Vec<RouteSnapshot>,
}

pub struct ServiceMetrics {
    started: Instant,
    batches_accepted: AtomicU64,
    batches_rejected: AtomicU64,
    points_ingested: AtomicU64,
    system_points_ingested: AtomicU64,
    storage_errors: AtomicU64,
    published_batches: AtomicU64,
    stream_messages_dropped: AtomicU64,
    subscriptions_opened: AtomicU64,
    subscriptions_closed: AtomicU64,
    rollups_materialized: AtomicU64,
    points_evicted: AtomicU64,
    partitions_dropped: AtomicU64,
    maintenance_failures: AtomicU64,
    routes: RwLock<BTreeMap<String, Arc<RouteMetrics>>>,
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            batches_accepted: AtomicU64::new(0),
            batches_rejected: AtomicU64::new(0),
            points_ingested: AtomicU64::new(0),
            system_points_ingested: AtomicU64::new(0),
            storage_errors: AtomicU64::new(0),
            published_batches: AtomicU64::new(0),
            stream_messages_dropped: AtomicU64::new(0),
            subscriptions_opened: AtomicU64::new(0),
            subscriptions_closed: AtomicU64::new(0),
            rollups_materialized: AtomicU64::new(0),
            points_evicted: AtomicU64::new(0),
            partitions_dropped: AtomicU64::new(0),
            maintenance_failures: AtomicU64::new(0),
            routes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn record_batch_accepted(&self, points: usize) {
        bump(&self.batches_accepted, 1);
        bump(&self.points_ingested, points as u64);
    }

    pub fn record_system_batch_accepted(&self, points: usize) {
        bump(&self.batches_accepted, 1);
        bump(&self.system_points_ingested, points as u64);
    }

    pub fn record_batch_rejected(&self) {
        bump(&self.batches_rejected, 1);
    }

    pub fn record_storage_error(&self) {
        bump(&self.storage_errors, 1);
    }

    pub fn record_publish(&self, dropped: usize) {
        bump(&self.published_batches, 1);
        bump(&self.stream_messages_dropped, dropped as u64);
    }

    pub fn record_subscription_opened(&self) {
        bump(&self.subscriptions_opened, 1);
    }

    pub fn record_subscription_closed(&self) {
        bump(&self.subscriptions_closed, 1);
    }

    pub fn record_rollups(&self, buckets: usize) {
        bump(&self.rollups_materialized, buckets as u64);
    }

    pub fn record_eviction(&self, points: u64, partitions: usize) {
        bump(&self.points_evicted, points);
        bump(&self.partitions_dropped, partitions as u64);
    }

    pub fn record_maintenance_failure(&self) {
        bump(&self.maintenance_failures, 1);
    }

    /// Record one handled request for a route.
    pub fn record_request(&self, route: &str, latency_us: u64, is_error: bool) {
        let existing = self.routes.read().get(route).cloned();
        let metrics = match existing {
            Some(m) => m,
            None => {
                let mut routes = self.routes.write();
                let m = routes
                    .entry(route.to_string())
                    .or_insert_with(|| Arc::new(RouteMetrics::new()));
                debug!(route, "tracking route metrics");
                Arc::clone(m)
            }
        };
        bump(&metrics.requests, 1);
        if is_error {
            bump(&metrics.errors, 1);
        }
        let mut window = metrics.latencies.lock();
        if window.len() >= LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(latency_us);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let routes = self
            .routes
            .read()
            .iter()
            .map(|(route, m)| {
                let samples: Vec<u64> = m.latencies.lock().iter().copied().collect();
                let (p50, p99) = compute_percentiles(&samples);
                RouteSnapshot {
                    route: route.clone(),
                    requests: load(&m.requests),
                    errors: load(&m.errors),
                    latency_p50_ms: p50,
                    latency_p99_ms: p99,
                }
            })
            .collect();

        MetricsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            batches_accepted: load(&self.batches_accepted),
            batches_rejected: load(&self.batches_rejected),
            points_ingested: load(&self.points_ingested),
            system_points_ingested: load(&self.system_points_ingested),
            storage_errors: load(&self.storage_errors),
            published_batches: load(&self.published_batches),
            stream_messages_dropped: load(&self.stream_messages_dropped),
            subscriptions_opened: load(&self.subscriptions_opened),
            subscriptions_closed: load(&self.subscriptions_closed),
            rollups_materialized: load(&self.rollups_materialized),
            points_evicted: load(&self.points_evicted),
            partitions_dropped: load(&self.partitions_dropped),
            maintenance_failures: load(&self.maintenance_failures),
            routes,
            ..MetricsSnapshot::default()
        }
    }
}

/// Compute P50 and P99 latency from unsorted samples in microseconds.
///
/// Returns (p50_ms, p99_ms). If empty, returns (0.0, 0.0).
fn compute_percentiles(latencies: &[u64]) -> (f64, f64) {
    if latencies.is_empty() {
        return (0.0, 0.0);
    }

    let mut sorted = latencies.to_vec();
    sorted.sort_unstable();

    let p50_idx = (sorted.len() as f64 * 0.50) as usize;
    let p99_idx = (sorted.len() as f64 * 0.99) as usize;

    let p50 = sorted[p50_idx.min(sorted.len() - 1)] as f64 / 1000.0;
    let p99 = sorted[p99_idx.min(sorted.len() - 1)] as f64 / 1000.0;

    (p50, p99)
}

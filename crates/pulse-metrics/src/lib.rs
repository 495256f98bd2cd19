//! pulse-metrics: observability for the Pulse service itself.
//!
//! ```text
//! ServiceMetrics
//!   ├── record_*() ← called from ingestion, query, stream and maintenance
//!   ├── record_request() ← per-route latency and error counts
//!   └── snapshot() → MetricsSnapshot
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//! ```

pub mod collector;
pub mod prometheus;

pub use collector::{MetricsSnapshot, RouteSnapshot, ServiceMetrics};
pub use prometheus::render_prometheus;

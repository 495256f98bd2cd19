//! pulse-store: time-partitioned metric storage for Pulse.
//!
//! Backed by [redb](https://docs.rs/redb). Raw points are split into
//! per-day partitions (one set of tables each), hourly rollups are
//! materialized in the background from dirty markers written at insert
//! time, and retention drops whole partitions once they age out.
//!
//! # Architecture
//!
//! `MetricStore` is synchronous and `Clone` (backed by `Arc<Database>`).
//! Async callers go through `StorePool`, which runs each operation on a
//! bounded set of blocking workers. `Maintenance` drives rollups and
//! retention on intervals.

macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StoreError::$variant(e.to_string())
    };
}

pub mod error;
pub mod maintenance;
pub mod pool;
pub mod retention;
pub mod rollup;
pub mod store;
pub mod tables;

pub use error::{StoreError, StoreResult};
pub use maintenance::{Maintenance, MaintenanceReport, ReportHook};
pub use pool::StorePool;
pub use retention::EvictionSummary;
pub use store::{InsertSummary, MetricStore, PartitionInfo, SeriesData, SeriesQuery, StoreOptions};
pub use tables::Family;

//! redb table definitions for the Pulse storage engine.
//!
//! Raw points live in time partitions. Partition `N` of a family covers
//! `[N * span, (N + 1) * span)` microseconds and owns its own tables, so
//! retention can drop a whole partition with one `delete_table`.
//!
//! | Table | Key | Value |
//! |---|---|---|
//! | `partitions` | `(family, index)` | stored point count |
//! | `metrics_p{N}` | `(run_id, metric_name, time_us)` | JSON `StoredPoint` |
//! | `metrics_by_run_p{N}` | `(run_id, time_us, metric_name)` | `()` |
//! | `system_p{N}` | `(run_id, time_us)` | JSON `SystemMetricPoint` |
//! | `rollups` | `(run_id, metric_name, bucket_start_us)` | JSON `RollupBucket` |
//! | `rollup_dirty` | `(run_id, metric_name, bucket_start_us)` | `()` |
//! | `retention_floor` | family | highest cutoff evicted so far |

use redb::TableDefinition;

pub(crate) type PointKey = (&'static str, &'static str, i64);
pub(crate) type RunTimeKey = (&'static str, i64, &'static str);
pub(crate) type SystemKey = (&'static str, i64);
pub(crate) type PartitionKey = (&'static str, i64);

/// Partition registry keyed by `(family, index)`.
pub(crate) const PARTITIONS: TableDefinition<PartitionKey, u64> =
    TableDefinition::new("partitions");

/// Materialized rollup buckets.
pub(crate) const ROLLUPS: TableDefinition<PointKey, &[u8]> = TableDefinition::new("rollups");

/// Buckets whose raw points changed since they were last rolled up.
pub(crate) const ROLLUP_DIRTY: TableDefinition<PointKey, ()> =
    TableDefinition::new("rollup_dirty");

/// Every raw point of a family older than this has been evicted, so rollups
/// from before it no longer match the raw data.
pub(crate) const RETENTION_FLOOR: TableDefinition<&str, i64> =
    TableDefinition::new("retention_floor");

/// Partition families. Each has its own retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Metrics,
    System,
}

impl Family {
    pub fn as_str(self) -> &'static str {
        match self {
            Family::Metrics => "metrics",
            Family::System => "system",
        }
    }
}

pub(crate) fn points_name(partition: i64) -> String {
    format!("metrics_p{partition}")
}

pub(crate) fn by_run_name(partition: i64) -> String {
    format!("metrics_by_run_p{partition}")
}

pub(crate) fn system_name(partition: i64) -> String {
    format!("system_p{partition}")
}

pub(crate) fn points_table(name: &str) -> TableDefinition<'_, PointKey, &'static [u8]> {
    TableDefinition::new(name)
}

pub(crate) fn by_run_table(name: &str) -> TableDefinition<'_, RunTimeKey, ()> {
    TableDefinition::new(name)
}

pub(crate) fn system_table(name: &str) -> TableDefinition<'_, SystemKey, &'static [u8]> {
    TableDefinition::new(name)
}

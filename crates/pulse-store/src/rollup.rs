//! Rollup materialization.
//!
//! Inserts mark `(run, metric, bucket)` triples dirty. Each pass drains a
//! chunk of dirty markers and recomputes those buckets from the raw points
//! inside the same write transaction, so a concurrent insert either lands
//! before the recompute (and is counted) or re-marks the bucket afterwards.

use redb::ReadableTable;
use tracing::debug;

use pulse_core::{RollupBucket, StatsAccumulator, from_micros};

use crate::error::StoreResult;
use crate::store::{MetricStore, scan_metric};
use crate::tables::*;

impl MetricStore {
    /// Recompute up to `max_buckets` dirty rollup buckets.
    ///
    /// Returns the number of buckets processed; a value below `max_buckets`
    /// means the dirty set is drained.
    pub fn materialize_rollups(&self, max_buckets: usize) -> StoreResult<usize> {
        let bucket_us = self.options.bucket_us();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let processed;
        {
            let mut dirty = txn.open_table(ROLLUP_DIRTY).map_err(map_err!(Table))?;
            let mut rollups = txn.open_table(ROLLUPS).map_err(map_err!(Table))?;
            let registry = txn.open_table(PARTITIONS).map_err(map_err!(Table))?;

            let pending: Vec<(String, String, i64)> = dirty
                .iter()
                .map_err(map_err!(Read))?
                .take(max_buckets)
                .map(|item| {
                    item.map(|(key, _)| {
                        let (run, metric, start) = key.value();
                        (run.to_string(), metric.to_string(), start)
                    })
                })
                .collect::<Result<_, _>>()
                .map_err(map_err!(Read))?;

            for (run, metric, start) in &pending {
                let end = start.saturating_add(bucket_us) - 1;
                let partitions = self.partitions_between(&registry, Family::Metrics, *start, end)?;

                let mut acc = StatsAccumulator::new();
                for partition in partitions {
                    let name = points_name(partition);
                    let table = txn.open_table(points_table(&name)).map_err(map_err!(Table))?;
                    scan_metric(&table, run, metric, *start, end, |_, stored| {
                        acc.push(stored.value);
                        true
                    })?;
                }

                let key = (run.as_str(), metric.as_str(), *start);
                if acc.is_empty() {
                    rollups.remove(key).map_err(map_err!(Write))?;
                } else {
                    let bucket = RollupBucket {
                        run_id: run.clone(),
                        metric_name: metric.clone(),
                        bucket_start: from_micros(*start),
                        bucket_secs: self.options.bucket_secs,
                        count: acc.count(),
                        min: acc.min().unwrap_or_default(),
                        max: acc.max().unwrap_or_default(),
                        avg: acc.mean().unwrap_or_default(),
                        stddev: acc.stddev(),
                        sum: acc.sum(),
                        m2: acc.m2(),
                    };
                    let value = serde_json::to_vec(&bucket).map_err(map_err!(Serialize))?;
                    rollups
                        .insert(key, value.as_slice())
                        .map_err(map_err!(Write))?;
                }
                dirty.remove(key).map_err(map_err!(Write))?;
            }
            processed = pending.len();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if processed > 0 {
            debug!(buckets = processed, "rollups materialized");
        }
        Ok(processed)
    }

    /// Number of buckets waiting to be rolled up.
    pub fn pending_rollups(&self) -> StoreResult<u64> {
        use redb::{ReadableDatabase, ReadableTableMetadata};
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let dirty = txn.open_table(ROLLUP_DIRTY).map_err(map_err!(Table))?;
        dirty.len().map_err(map_err!(Read))
    }
}

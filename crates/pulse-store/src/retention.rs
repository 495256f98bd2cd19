//! Retention eviction.
//!
//! Partitions that end before the cutoff are dropped wholesale; the one
//! partition straddling the cutoff is trimmed key by key. Rollups outlive
//! raw points and follow their own, longer window.

use redb::{ReadableTable, WriteTransaction};
use serde::Serialize;
use tracing::{debug, info};

use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::store::MetricStore;
use crate::tables::*;

/// What one eviction pass removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EvictionSummary {
    pub partitions_dropped: usize,
    pub points_evicted: u64,
    pub system_points_evicted: u64,
    pub rollups_pruned: u64,
}

impl EvictionSummary {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl MetricStore {
    /// Evict everything older than the configured retention windows,
    /// measured back from `now`.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> StoreResult<EvictionSummary> {
        let now_us = now.timestamp_micros();
        let mut summary = EvictionSummary::default();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let metrics_cutoff = now_us.saturating_sub(self.options.retention_us(Family::Metrics));
            let (dropped, evicted) = self.evict_family(&txn, Family::Metrics, metrics_cutoff)?;
            summary.partitions_dropped += dropped;
            summary.points_evicted = evicted;

            let mut floors = txn.open_table(RETENTION_FLOOR).map_err(map_err!(Table))?;
            let floor = floors
                .get(Family::Metrics.as_str())
                .map_err(map_err!(Read))?
                .map(|v| v.value())
                .unwrap_or(i64::MIN);
            if metrics_cutoff > floor {
                floors
                    .insert(Family::Metrics.as_str(), metrics_cutoff)
                    .map_err(map_err!(Write))?;
            }

            let system_cutoff = now_us.saturating_sub(self.options.retention_us(Family::System));
            let (dropped, evicted) = self.evict_family(&txn, Family::System, system_cutoff)?;
            summary.partitions_dropped += dropped;
            summary.system_points_evicted = evicted;

            // Dirty markers for buckets that are entirely gone would recompute
            // to an empty bucket and delete a rollup that should be kept.
            let bucket_us = self.options.bucket_us();
            let mut dirty = txn.open_table(ROLLUP_DIRTY).map_err(map_err!(Table))?;
            let stale: Vec<(String, String, i64)> = collect_keys(&dirty, |start| {
                start.saturating_add(bucket_us) <= metrics_cutoff
            })?;
            for (run, metric, start) in &stale {
                dirty
                    .remove((run.as_str(), metric.as_str(), *start))
                    .map_err(map_err!(Write))?;
            }

            let rollup_cutoff = now_us.saturating_sub(self.options.rollup_retention_us());
            let mut rollups = txn.open_table(ROLLUPS).map_err(map_err!(Table))?;
            let expired: Vec<(String, String, i64)> = collect_keys(&rollups, |start| {
                start.saturating_add(bucket_us) <= rollup_cutoff
            })?;
            for (run, metric, start) in &expired {
                rollups
                    .remove((run.as_str(), metric.as_str(), *start))
                    .map_err(map_err!(Write))?;
            }
            summary.rollups_pruned = expired.len() as u64;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        if summary.is_empty() {
            debug!("retention pass found nothing to evict");
        } else {
            info!(
                partitions_dropped = summary.partitions_dropped,
                points = summary.points_evicted,
                system_points = summary.system_points_evicted,
                rollups = summary.rollups_pruned,
                "retention eviction complete"
            );
        }
        Ok(summary)
    }

    /// Drop or trim the partitions of one family. Returns
    /// `(partitions_dropped, points_evicted)`.
    fn evict_family(
        &self,
        txn: &WriteTransaction,
        family: Family,
        cutoff: i64,
    ) -> StoreResult<(usize, u64)> {
        let mut registry = txn.open_table(PARTITIONS).map_err(map_err!(Table))?;
        let partitions: Vec<(i64, u64)> = registry
            .range((family.as_str(), i64::MIN)..=(family.as_str(), self.options.partition_of(cutoff)))
            .map_err(map_err!(Read))?
            .map(|item| item.map(|(k, v)| (k.value().1, v.value())))
            .collect::<Result<_, _>>()
            .map_err(map_err!(Read))?;

        let mut dropped = 0;
        let mut evicted = 0u64;
        for (partition, count) in partitions {
            if self.options.partition_end(partition) <= cutoff {
                self.drop_partition(txn, family, partition)?;
                registry
                    .remove((family.as_str(), partition))
                    .map_err(map_err!(Write))?;
                dropped += 1;
                evicted += count;
                debug!(family = family.as_str(), partition, points = count, "partition dropped");
            } else {
                let trimmed = self.trim_partition(txn, family, partition, cutoff)?;
                if trimmed > 0 {
                    registry
                        .insert((family.as_str(), partition), count.saturating_sub(trimmed))
                        .map_err(map_err!(Write))?;
                    evicted += trimmed;
                }
            }
        }
        Ok((dropped, evicted))
    }

    fn drop_partition(&self, txn: &WriteTransaction, family: Family, partition: i64) -> StoreResult<()> {
        match family {
            Family::Metrics => {
                let points = points_name(partition);
                let index = by_run_name(partition);
                txn.delete_table(points_table(&points)).map_err(map_err!(Table))?;
                txn.delete_table(by_run_table(&index)).map_err(map_err!(Table))?;
            }
            Family::System => {
                let name = system_name(partition);
                txn.delete_table(system_table(&name)).map_err(map_err!(Table))?;
            }
        }
        Ok(())
    }

    /// Remove the points older than `cutoff` from a partition that straddles it.
    fn trim_partition(
        &self,
        txn: &WriteTransaction,
        family: Family,
        partition: i64,
        cutoff: i64,
    ) -> StoreResult<u64> {
        match family {
            Family::Metrics => {
                let points = points_name(partition);
                let index = by_run_name(partition);
                let mut points_t = txn.open_table(points_table(&points)).map_err(map_err!(Table))?;
                let mut index_t = txn.open_table(by_run_table(&index)).map_err(map_err!(Table))?;

                let expired: Vec<(String, String, i64)> = collect_keys(&points_t, |t| t < cutoff)?;
                for (run, metric, t) in &expired {
                    points_t
                        .remove((run.as_str(), metric.as_str(), *t))
                        .map_err(map_err!(Write))?;
                    index_t
                        .remove((run.as_str(), *t, metric.as_str()))
                        .map_err(map_err!(Write))?;
                }
                Ok(expired.len() as u64)
            }
            Family::System => {
                let name = system_name(partition);
                let mut table = txn.open_table(system_table(&name)).map_err(map_err!(Table))?;
                let mut expired: Vec<(String, i64)> = Vec::new();
                for item in table.iter().map_err(map_err!(Read))? {
                    let (key, _) = item.map_err(map_err!(Read))?;
                    let (run, t) = key.value();
                    if t < cutoff {
                        expired.push((run.to_string(), t));
                    }
                }
                for (run, t) in &expired {
                    table.remove((run.as_str(), *t)).map_err(map_err!(Write))?;
                }
                Ok(expired.len() as u64)
            }
        }
    }
}

/// Owned copies of `(run, metric, time)` keys whose time matches `pred`.
fn collect_keys<T, V>(table: &T, pred: impl Fn(i64) -> bool) -> StoreResult<Vec<(String, String, i64)>>
where
    T: ReadableTable<PointKey, V>,
    V: redb::Value + 'static,
{
    let mut out = Vec::new();
    for item in table.iter().map_err(map_err!(Read))? {
        let (key, _) = item.map_err(map_err!(Read))?;
        let (run, metric, t) = key.value();
        if pred(t) {
            out.push((run.to_string(), metric.to_string(), t));
        }
    }
    Ok(out)
}

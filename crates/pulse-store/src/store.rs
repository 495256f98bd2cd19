//! MetricStore: redb-backed storage engine for Pulse.
//!
//! Provides batched inserts and range / latest / aggregate reads over
//! time-partitioned raw points. Values are JSON-serialized into redb's
//! `&[u8]` value columns; composite tuple keys give ordered range scans
//! for `(run, metric, time)` and `(run, time)` access paths. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::debug;

use pulse_core::{
    LatestValue, Metadata, MetricPoint, MetricStats, PulseConfig, RollupBucket, SeriesResolution,
    StatsAccumulator, StepRange, SystemMetricPoint, TimeRange, from_micros,
};

use crate::error::StoreResult;
use crate::tables::*;

const MICROS_PER_SEC: i64 = 1_000_000;
const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SEC;

/// Tunables that shape the on-disk layout and background policies.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub partition_span_secs: u64,
    pub bucket_secs: u64,
    pub auto_rollup_threshold_secs: u64,
    pub metrics_retention_days: u32,
    pub system_retention_days: u32,
    pub rollup_retention_days: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_config(&PulseConfig::default())
    }
}

impl StoreOptions {
    pub fn from_config(config: &PulseConfig) -> Self {
        Self {
            partition_span_secs: config.storage.partition_span_secs,
            bucket_secs: config.rollup.bucket_secs,
            auto_rollup_threshold_secs: config.rollup.auto_threshold_secs,
            metrics_retention_days: config.retention.metrics_days,
            system_retention_days: config.retention.system_days,
            rollup_retention_days: config.retention.rollup_days,
        }
    }

    pub(crate) fn span_us(&self) -> i64 {
        self.partition_span_secs as i64 * MICROS_PER_SEC
    }

    pub(crate) fn bucket_us(&self) -> i64 {
        self.bucket_secs as i64 * MICROS_PER_SEC
    }

    pub(crate) fn partition_of(&self, time_us: i64) -> i64 {
        time_us.div_euclid(self.span_us())
    }

    /// First microsecond after the end of a partition.
    pub(crate) fn partition_end(&self, partition: i64) -> i64 {
        partition.saturating_add(1).saturating_mul(self.span_us())
    }

    pub(crate) fn bucket_start(&self, time_us: i64) -> i64 {
        time_us.div_euclid(self.bucket_us()) * self.bucket_us()
    }

    pub(crate) fn retention_us(&self, family: Family) -> i64 {
        let days = match family {
            Family::Metrics => self.metrics_retention_days,
            Family::System => self.system_retention_days,
        };
        days as i64 * MICROS_PER_DAY
    }

    pub(crate) fn rollup_retention_us(&self) -> i64 {
        self.rollup_retention_days as i64 * MICROS_PER_DAY
    }
}

/// Value column of the raw metric tables. Run, metric, and time live in the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredPoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl StoredPoint {
    fn from_point(p: &MetricPoint) -> Self {
        Self {
            step: p.step,
            value: p.value,
            metadata: p.metadata.clone(),
        }
    }

    fn into_point(self, run_id: &str, metric_name: &str, time_us: i64) -> MetricPoint {
        MetricPoint {
            run_id: run_id.to_string(),
            metric_name: metric_name.to_string(),
            time: from_micros(time_us),
            step: self.step,
            value: self.value,
            metadata: self.metadata,
        }
    }
}

/// Outcome of a batch insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsertSummary {
    /// Points written (including overwrites of identical keys).
    pub written: usize,
    /// Points whose key did not exist before.
    pub new_points: usize,
    pub partitions: usize,
}

/// A series read against the store.
#[derive(Debug, Clone)]
pub struct SeriesQuery {
    pub run_id: String,
    pub metric_name: Option<String>,
    pub time: TimeRange,
    pub steps: StepRange,
    pub limit: usize,
    pub offset: usize,
    pub resolution: SeriesResolution,
}

impl SeriesQuery {
    pub fn new(run_id: impl Into<String>, limit: usize) -> Self {
        Self {
            run_id: run_id.into(),
            metric_name: None,
            time: TimeRange::unbounded(),
            steps: StepRange::default(),
            limit,
            offset: 0,
            resolution: SeriesResolution::Raw,
        }
    }

    pub fn metric(mut self, name: impl Into<String>) -> Self {
        self.metric_name = Some(name.into());
        self
    }
}

/// Result of a series read: raw points or rollup buckets, ascending by time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SeriesData {
    Raw(Vec<MetricPoint>),
    Rollup(Vec<RollupBucket>),
}

impl SeriesData {
    pub fn resolution(&self) -> SeriesResolution {
        match self {
            SeriesData::Raw(_) => SeriesResolution::Raw,
            SeriesData::Rollup(_) => SeriesResolution::Rollup,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SeriesData::Raw(p) => p.len(),
            SeriesData::Rollup(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One registered partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    pub family: &'static str,
    pub index: i64,
    pub start: DateTime<Utc>,
    pub points: u64,
}

/// Thread-safe metric store backed by redb.
#[derive(Clone)]
pub struct MetricStore {
    pub(crate) db: Arc<Database>,
    pub(crate) options: StoreOptions,
}

impl MetricStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path, options: StoreOptions) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            options,
        };
        store.ensure_tables()?;
        debug!(?path, "metric store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory(options: StoreOptions) -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            options,
        };
        store.ensure_tables()?;
        debug!("in-memory metric store opened");
        Ok(store)
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Create the fixed tables. Partition tables are created on first write.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(PARTITIONS).map_err(map_err!(Table))?;
        txn.open_table(ROLLUPS).map_err(map_err!(Table))?;
        txn.open_table(ROLLUP_DIRTY).map_err(map_err!(Table))?;
        txn.open_table(RETENTION_FLOOR).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Write a batch of metric points in a single transaction.
    ///
    /// Re-inserting a point with an existing `(run, metric, time)` key
    /// overwrites it, so resending a batch is harmless. Every touched
    /// rollup bucket is marked dirty in the same transaction.
    pub fn insert_metrics(&self, points: &[MetricPoint]) -> StoreResult<InsertSummary> {
        let mut by_partition: BTreeMap<i64, Vec<&MetricPoint>> = BTreeMap::new();
        for p in points {
            by_partition
                .entry(self.options.partition_of(p.time_micros()))
                .or_default()
                .push(p);
        }

        let mut summary = InsertSummary {
            partitions: by_partition.len(),
            ..Default::default()
        };

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut registry = txn.open_table(PARTITIONS).map_err(map_err!(Table))?;
            let mut dirty = txn.open_table(ROLLUP_DIRTY).map_err(map_err!(Table))?;

            for (partition, group) in &by_partition {
                let points_name = points_name(*partition);
                let index_name = by_run_name(*partition);
                let mut points_t = txn
                    .open_table(points_table(&points_name))
                    .map_err(map_err!(Table))?;
                let mut index_t = txn
                    .open_table(by_run_table(&index_name))
                    .map_err(map_err!(Table))?;

                let mut added = 0u64;
                for p in group {
                    let t = p.time_micros();
                    let value =
                        serde_json::to_vec(&StoredPoint::from_point(p)).map_err(map_err!(Serialize))?;
                    let existed = points_t
                        .insert((p.run_id.as_str(), p.metric_name.as_str(), t), value.as_slice())
                        .map_err(map_err!(Write))?
                        .is_some();
                    if !existed {
                        added += 1;
                    }
                    index_t
                        .insert((p.run_id.as_str(), t, p.metric_name.as_str()), ())
                        .map_err(map_err!(Write))?;
                    dirty
                        .insert(
                            (p.run_id.as_str(), p.metric_name.as_str(), self.options.bucket_start(t)),
                            (),
                        )
                        .map_err(map_err!(Write))?;
                    summary.written += 1;
                }

                let key = (Family::Metrics.as_str(), *partition);
                let current = registry
                    .get(key)
                    .map_err(map_err!(Read))?
                    .map(|g| g.value())
                    .unwrap_or(0);
                registry
                    .insert(key, current + added)
                    .map_err(map_err!(Write))?;
                summary.new_points += added as usize;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            written = summary.written,
            new_points = summary.new_points,
            partitions = summary.partitions,
            "metric batch stored"
        );
        Ok(summary)
    }

    /// Write a batch of system telemetry points in a single transaction.
    pub fn insert_system_metrics(&self, points: &[SystemMetricPoint]) -> StoreResult<InsertSummary> {
        let mut by_partition: BTreeMap<i64, Vec<&SystemMetricPoint>> = BTreeMap::new();
        for p in points {
            by_partition
                .entry(self.options.partition_of(p.time_micros()))
                .or_default()
                .push(p);
        }

        let mut summary = InsertSummary {
            partitions: by_partition.len(),
            ..Default::default()
        };

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut registry = txn.open_table(PARTITIONS).map_err(map_err!(Table))?;
            for (partition, group) in &by_partition {
                let name = system_name(*partition);
                let mut table = txn.open_table(system_table(&name)).map_err(map_err!(Table))?;
                let mut added = 0u64;
                for p in group {
                    let value = serde_json::to_vec(p).map_err(map_err!(Serialize))?;
                    let existed = table
                        .insert((p.run_id.as_str(), p.time_micros()), value.as_slice())
                        .map_err(map_err!(Write))?
                        .is_some();
                    if !existed {
                        added += 1;
                    }
                    summary.written += 1;
                }
                let key = (Family::System.as_str(), *partition);
                let current = registry
                    .get(key)
                    .map_err(map_err!(Read))?
                    .map(|g| g.value())
                    .unwrap_or(0);
                registry
                    .insert(key, current + added)
                    .map_err(map_err!(Write))?;
                summary.new_points += added as usize;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(written = summary.written, "system batch stored");
        Ok(summary)
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Decide which representation answers a series query.
    pub fn plan(&self, query: &SeriesQuery) -> SeriesResolution {
        match query.resolution {
            SeriesResolution::Raw => SeriesResolution::Raw,
            SeriesResolution::Rollup if query.metric_name.is_some() => SeriesResolution::Rollup,
            SeriesResolution::Rollup => SeriesResolution::Raw,
            SeriesResolution::Auto => {
                let long_span = query.time.span().is_some_and(|span| {
                    span.num_seconds() > self.options.auto_rollup_threshold_secs as i64
                });
                if query.metric_name.is_some() && query.steps.is_unbounded() && long_span {
                    SeriesResolution::Rollup
                } else {
                    SeriesResolution::Raw
                }
            }
        }
    }

    /// Range read, ascending by time, honoring limit and offset.
    pub fn query_series(&self, query: &SeriesQuery) -> StoreResult<SeriesData> {
        match (self.plan(query), query.metric_name.as_deref()) {
            (SeriesResolution::Rollup, Some(metric)) => {
                let buckets = self
                    .rollups(&query.run_id, metric, query.time)?
                    .into_iter()
                    .skip(query.offset)
                    .take(query.limit)
                    .collect();
                Ok(SeriesData::Rollup(buckets))
            }
            (_, Some(metric)) => self.raw_metric_series(query, metric).map(SeriesData::Raw),
            (_, None) => self.raw_run_series(query).map(SeriesData::Raw),
        }
    }

    fn raw_metric_series(&self, query: &SeriesQuery, metric: &str) -> StoreResult<Vec<MetricPoint>> {
        let (lo, hi) = query.time.micros();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let registry = txn.open_table(PARTITIONS).map_err(map_err!(Table))?;
        let partitions = self.partitions_between(&registry, Family::Metrics, lo, hi)?;

        let mut out = Vec::new();
        let mut skipped = 0usize;
        for partition in partitions {
            if out.len() >= query.limit {
                break;
            }
            let name = points_name(partition);
            let table = txn.open_table(points_table(&name)).map_err(map_err!(Table))?;
            scan_metric(&table, &query.run_id, metric, lo, hi, |t, stored| {
                if !query.steps.contains(stored.step) {
                    return true;
                }
                if skipped < query.offset {
                    skipped += 1;
                    return true;
                }
                out.push(stored.into_point(&query.run_id, metric, t));
                out.len() < query.limit
            })?;
        }
        Ok(out)
    }

    /// All metrics of a run, ordered by time through the `(run, time)` index.
    fn raw_run_series(&self, query: &SeriesQuery) -> StoreResult<Vec<MetricPoint>> {
        let (lo, hi) = query.time.micros();
        let run = query.run_id.as_str();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let registry = txn.open_table(PARTITIONS).map_err(map_err!(Table))?;
        let partitions = self.partitions_between(&registry, Family::Metrics, lo, hi)?;

        let mut out = Vec::new();
        let mut skipped = 0usize;
        'partitions: for partition in partitions {
            let points_name = points_name(partition);
            let index_name = by_run_name(partition);
            let points_t = txn
                .open_table(points_table(&points_name))
                .map_err(map_err!(Table))?;
            let index_t = txn
                .open_table(by_run_table(&index_name))
                .map_err(map_err!(Table))?;

            for item in index_t.range((run, lo, "")..).map_err(map_err!(Read))? {
                if out.len() >= query.limit {
                    break 'partitions;
                }
                let (key, _) = item.map_err(map_err!(Read))?;
                let (key_run, t, metric) = key.value();
                if key_run != run || t > hi {
                    break;
                }
                let Some(value) = points_t.get((run, metric, t)).map_err(map_err!(Read))? else {
                    continue;
                };
                let stored: StoredPoint =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if !query.steps.contains(stored.step) {
                    continue;
                }
                if skipped < query.offset {
                    skipped += 1;
                    continue;
                }
                out.push(stored.into_point(run, metric, t));
            }
        }
        Ok(out)
    }

    /// The point with the greatest timestamp for a run/metric pair.
    pub fn latest(&self, run_id: &str, metric_name: &str) -> StoreResult<Option<MetricPoint>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let last = self.last_in_range(&txn, run_id, metric_name, i64::MIN, i64::MAX)?;
        Ok(last.map(|(t, stored)| stored.into_point(run_id, metric_name, t)))
    }

    fn last_in_range(
        &self,
        txn: &ReadTransaction,
        run_id: &str,
        metric_name: &str,
        lo: i64,
        hi: i64,
    ) -> StoreResult<Option<(i64, StoredPoint)>> {
        let registry = txn.open_table(PARTITIONS).map_err(map_err!(Table))?;
        let partitions = self.partitions_between(&registry, Family::Metrics, lo, hi)?;

        for partition in partitions.into_iter().rev() {
            let name = points_name(partition);
            let table = txn.open_table(points_table(&name)).map_err(map_err!(Table))?;
            let last = table
                .range((run_id, metric_name, lo)..=(run_id, metric_name, hi))
                .map_err(map_err!(Read))?
                .next_back();
            if let Some(item) = last {
                let (key, value) = item.map_err(map_err!(Read))?;
                let (_, _, t) = key.value();
                let stored: StoredPoint =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                return Ok(Some((t, stored)));
            }
        }
        Ok(None)
    }

    /// Count / min / max / avg / stddev / latest over a time range.
    ///
    /// Whole buckets with an up-to-date rollup are merged from the rollup;
    /// only the stretches between them are scanned point by point.
    pub fn stats(&self, run_id: &str, metric_name: &str, range: TimeRange) -> StoreResult<MetricStats> {
        let (lo, hi) = range.micros();
        let bucket_us = self.options.bucket_us();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let registry = txn.open_table(PARTITIONS).map_err(map_err!(Table))?;

        let mut acc = StatsAccumulator::new();
        let mut gaps = Vec::new();
        let mut cursor = lo;
        for (start, bucket) in self.clean_rollups(&txn, run_id, metric_name, lo, hi)? {
            if start > cursor {
                gaps.push((cursor, start - 1));
            }
            acc.merge(&bucket);
            cursor = start.saturating_add(bucket_us);
        }
        if cursor <= hi {
            gaps.push((cursor, hi));
        }

        for (gap_lo, gap_hi) in gaps {
            for partition in self.partitions_between(&registry, Family::Metrics, gap_lo, gap_hi)? {
                let name = points_name(partition);
                let table = txn.open_table(points_table(&name)).map_err(map_err!(Table))?;
                scan_metric(&table, run_id, metric_name, gap_lo, gap_hi, |_, stored| {
                    acc.push(stored.value);
                    true
                })?;
            }
        }

        let mut stats = acc.to_stats();
        stats.latest = self
            .last_in_range(&txn, run_id, metric_name, lo, hi)?
            .map(|(t, stored)| LatestValue {
                value: stored.value,
                time: from_micros(t),
                step: stored.step,
            });
        Ok(stats)
    }

    /// Rollups that summarize exactly the raw points they cover: wholly
    /// inside `[lo, hi]`, not waiting on a recompute, and not older than
    /// the retention floor.
    fn clean_rollups(
        &self,
        txn: &ReadTransaction,
        run_id: &str,
        metric_name: &str,
        lo: i64,
        hi: i64,
    ) -> StoreResult<Vec<(i64, StatsAccumulator)>> {
        let bucket_us = self.options.bucket_us();
        let floors = txn.open_table(RETENTION_FLOOR).map_err(map_err!(Table))?;
        let floor = floors
            .get(Family::Metrics.as_str())
            .map_err(map_err!(Read))?
            .map(|v| v.value())
            .unwrap_or(i64::MIN);
        let from = lo.max(floor);
        let first = if from == i64::MIN {
            from
        } else {
            let start = self.options.bucket_start(from);
            if start < from { start.saturating_add(bucket_us) } else { start }
        };
        if first > hi {
            return Ok(Vec::new());
        }

        let rollups = txn.open_table(ROLLUPS).map_err(map_err!(Table))?;
        let dirty = txn.open_table(ROLLUP_DIRTY).map_err(map_err!(Table))?;
        let mut out = Vec::new();
        for item in rollups
            .range((run_id, metric_name, first)..=(run_id, metric_name, hi))
            .map_err(map_err!(Read))?
        {
            let (key, value) = item.map_err(map_err!(Read))?;
            let (_, _, start) = key.value();
            if start.saturating_add(bucket_us - 1) > hi {
                break;
            }
            if dirty
                .get((run_id, metric_name, start))
                .map_err(map_err!(Read))?
                .is_some()
            {
                continue;
            }
            let bucket: RollupBucket =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            out.push((start, StatsAccumulator::from_rollup(&bucket)));
        }
        Ok(out)
    }

    /// The most recent `window` points, returned in ascending order.
    pub fn recent(&self, run_id: &str, metric_name: &str, window: usize) -> StoreResult<Vec<MetricPoint>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let registry = txn.open_table(PARTITIONS).map_err(map_err!(Table))?;
        let partitions = self.partitions_between(&registry, Family::Metrics, i64::MIN, i64::MAX)?;

        let mut out = Vec::with_capacity(window);
        for partition in partitions.into_iter().rev() {
            if out.len() >= window {
                break;
            }
            let name = points_name(partition);
            let table = txn.open_table(points_table(&name)).map_err(map_err!(Table))?;
            let range = table
                .range((run_id, metric_name, i64::MIN)..=(run_id, metric_name, i64::MAX))
                .map_err(map_err!(Read))?;
            for item in range.rev().take(window - out.len()) {
                let (key, value) = item.map_err(map_err!(Read))?;
                let (_, _, t) = key.value();
                let stored: StoredPoint =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                out.push(stored.into_point(run_id, metric_name, t));
            }
        }
        out.reverse();
        Ok(out)
    }

    /// Distinct metric names recorded for a run, sorted.
    pub fn metric_names(&self, run_id: &str) -> StoreResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let registry = txn.open_table(PARTITIONS).map_err(map_err!(Table))?;
        let partitions = self.partitions_between(&registry, Family::Metrics, i64::MIN, i64::MAX)?;

        let mut names = BTreeSet::new();
        for partition in partitions {
            let name = points_name(partition);
            let table = txn.open_table(points_table(&name)).map_err(map_err!(Table))?;
            // Skip-scan: jump past every key of the metric just seen.
            let mut cursor: Option<String> = None;
            loop {
                let next = match &cursor {
                    None => table.range((run_id, "", i64::MIN)..),
                    Some(m) => table.range((run_id, m.as_str(), i64::MAX)..),
                }
                .map_err(map_err!(Read))?
                .find(|item| match (item, &cursor) {
                    (Ok(entry), Some(m)) => entry.0.value().1 != m.as_str(),
                    _ => true,
                });
                let Some(item) = next else { break };
                let (key, _) = item.map_err(map_err!(Read))?;
                let (key_run, metric, _) = key.value();
                if key_run != run_id {
                    break;
                }
                names.insert(metric.to_string());
                cursor = Some(metric.to_string());
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Materialized rollup buckets for a run/metric pair, ascending.
    pub fn rollups(&self, run_id: &str, metric_name: &str, range: TimeRange) -> StoreResult<Vec<RollupBucket>> {
        let (lo, hi) = range.micros();
        let lo = if lo == i64::MIN { lo } else { self.options.bucket_start(lo) };
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLUPS).map_err(map_err!(Table))?;
        let mut out = Vec::new();
        for item in table
            .range((run_id, metric_name, lo)..=(run_id, metric_name, hi))
            .map_err(map_err!(Read))?
        {
            let (_, value) = item.map_err(map_err!(Read))?;
            let bucket: RollupBucket =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            out.push(bucket);
        }
        Ok(out)
    }

    /// System telemetry for a run, ascending by time.
    pub fn query_system(&self, run_id: &str, range: TimeRange, limit: usize) -> StoreResult<Vec<SystemMetricPoint>> {
        let (lo, hi) = range.micros();
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let registry = txn.open_table(PARTITIONS).map_err(map_err!(Table))?;
        let partitions = self.partitions_between(&registry, Family::System, lo, hi)?;

        let mut out = Vec::new();
        'partitions: for partition in partitions {
            let name = system_name(partition);
            let table = txn.open_table(system_table(&name)).map_err(map_err!(Table))?;
            for item in table
                .range((run_id, lo)..=(run_id, hi))
                .map_err(map_err!(Read))?
            {
                if out.len() >= limit {
                    break 'partitions;
                }
                let (_, value) = item.map_err(map_err!(Read))?;
                let point: SystemMetricPoint =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                out.push(point);
            }
        }
        Ok(out)
    }

    /// Registered partitions with their stored point counts.
    pub fn partitions(&self) -> StoreResult<Vec<PartitionInfo>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let registry = txn.open_table(PARTITIONS).map_err(map_err!(Table))?;
        let mut out = Vec::new();
        for item in registry.iter().map_err(map_err!(Read))? {
            let (key, count) = item.map_err(map_err!(Read))?;
            let (family, index) = key.value();
            let family = match family {
                "system" => Family::System,
                _ => Family::Metrics,
            };
            out.push(PartitionInfo {
                family: family.as_str(),
                index,
                start: from_micros(index.saturating_mul(self.options.span_us())),
                points: count.value(),
            });
        }
        Ok(out)
    }

    /// Partition indexes of a family overlapping `[lo, hi]`, ascending.
    pub(crate) fn partitions_between<T>(
        &self,
        registry: &T,
        family: Family,
        lo: i64,
        hi: i64,
    ) -> StoreResult<Vec<i64>>
    where
        T: ReadableTable<PartitionKey, u64>,
    {
        let first = self.options.partition_of(lo);
        let last = self.options.partition_of(hi);
        let mut out = Vec::new();
        for item in registry
            .range((family.as_str(), first)..=(family.as_str(), last))
            .map_err(map_err!(Read))?
        {
            let (key, _) = item.map_err(map_err!(Read))?;
            out.push(key.value().1);
        }
        Ok(out)
    }
}

/// Visit the points of one metric in `[lo, hi]` within a partition table.
/// The visitor returns `false` to stop early.
pub(crate) fn scan_metric<T>(
    table: &T,
    run_id: &str,
    metric_name: &str,
    lo: i64,
    hi: i64,
    mut visit: impl FnMut(i64, StoredPoint) -> bool,
) -> StoreResult<()>
where
    T: ReadableTable<PointKey, &'static [u8]>,
{
    for item in table
        .range((run_id, metric_name, lo)..=(run_id, metric_name, hi))
        .map_err(map_err!(Read))?
    {
        let (key, value) = item.map_err(map_err!(Read))?;
        let (_, _, t) = key.value();
        let stored: StoredPoint =
            serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        if !visit(t, stored) {
            break;
        }
    }
    Ok(())
}

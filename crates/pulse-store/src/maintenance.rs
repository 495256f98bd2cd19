//! Background maintenance: rollup materialization and retention eviction.
//!
//! Both jobs run on the store pool from one select loop, each on its own
//! interval, until the shutdown channel fires.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::StoreResult;
use crate::pool::StorePool;
use crate::retention::EvictionSummary;

/// Outcome of one maintenance job, handed to the report hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceReport {
    Rollups { buckets: usize, pending: u64 },
    Retention(EvictionSummary),
    Failed { job: &'static str },
}

/// Shortest tick either job accepts; `tokio::time::interval` panics on zero.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Called after every maintenance job.
pub type ReportHook = Arc<dyn Fn(&MaintenanceReport) + Send + Sync>;

pub struct Maintenance {
    pool: StorePool,
    rollup_interval: Duration,
    retention_interval: Duration,
    rollup_batch: usize,
    on_report: Option<ReportHook>,
}

impl Maintenance {
    pub fn new(
        pool: StorePool,
        rollup_interval: Duration,
        retention_interval: Duration,
        rollup_batch: usize,
    ) -> Self {
        Self {
            pool,
            rollup_interval: rollup_interval.max(MIN_INTERVAL),
            retention_interval: retention_interval.max(MIN_INTERVAL),
            rollup_batch: rollup_batch.max(1),
            on_report: None,
        }
    }

    pub fn with_report_hook(mut self, hook: ReportHook) -> Self {
        self.on_report = Some(hook);
        self
    }

    /// Drain the dirty set in chunks. Each chunk is its own transaction so
    /// ingestion is never blocked behind a long recompute.
    pub async fn run_rollups_once(&self) -> StoreResult<usize> {
        let batch = self.rollup_batch;
        let mut total = 0;
        loop {
            let processed = self.pool.run(move |s| s.materialize_rollups(batch)).await?;
            total += processed;
            if processed < batch {
                break;
            }
        }
        let pending = self.pool.run(|s| s.pending_rollups()).await?;
        self.report(MaintenanceReport::Rollups {
            buckets: total,
            pending,
        });
        Ok(total)
    }

    pub async fn run_retention_once(&self) -> StoreResult<EvictionSummary> {
        let now = Utc::now();
        let summary = self.pool.run(move |s| s.evict_expired(now)).await?;
        self.report(MaintenanceReport::Retention(summary));
        Ok(summary)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            rollup_secs = self.rollup_interval.as_secs(),
            retention_secs = self.retention_interval.as_secs(),
            "maintenance started"
        );

        let mut rollup_tick = tokio::time::interval(self.rollup_interval);
        let mut retention_tick = tokio::time::interval(self.retention_interval);
        rollup_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        retention_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = rollup_tick.tick() => {
                    if let Err(e) = self.run_rollups_once().await {
                        warn!(error = %e, "rollup pass failed");
                        self.report(MaintenanceReport::Failed { job: "rollup" });
                    }
                }
                _ = retention_tick.tick() => {
                    if let Err(e) = self.run_retention_once().await {
                        warn!(error = %e, "retention pass failed");
                        self.report(MaintenanceReport::Failed { job: "retention" });
                    }
                }
                _ = shutdown.changed() => {
                    info!("maintenance shutting down");
                    break;
                }
            }
        }
    }

    fn report(&self, report: MaintenanceReport) {
        if let Some(hook) = &self.on_report {
            hook(&report);
        }
    }
}

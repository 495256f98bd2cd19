//! pulse.toml configuration parser.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working single-node configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Widest accepted partition or rollup bucket.
pub const MAX_SPAN_SECS: u64 = 366 * 86_400;

/// Longest accepted retention window.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub rollup: RollupConfig,
    pub cache: CacheConfig,
    pub ingest: IngestConfig,
    pub query: QueryConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Size of the blocking worker pool that runs storage transactions.
    pub workers: usize,
    /// Width of one time partition.
    pub partition_span_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub metrics_days: u32,
    pub system_days: u32,
    pub rollup_days: u32,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollupConfig {
    pub bucket_secs: u64,
    pub interval_secs: u64,
    /// Dirty buckets recomputed per write transaction.
    pub batch_size: usize,
    /// `auto` resolution switches to rollups above this span.
    pub auto_threshold_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: u64,
    pub latest_ttl_secs: u64,
    pub stats_ttl_secs: u64,
    pub series_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub max_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    pub recent_window: usize,
    pub max_recent_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Outbound messages buffered per subscriber before the oldest is dropped.
    pub queue_capacity: usize,
    /// Quiet period after which a subscription is reported idle.
    pub idle_after_secs: u64,
    /// Upper bound on draining a closing subscription.
    pub close_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/pulse"),
            workers: 4,
            partition_span_secs: 86_400,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            metrics_days: 90,
            system_days: 7,
            rollup_days: 365,
            interval_secs: 3_600,
        }
    }
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            bucket_secs: 3_600,
            interval_secs: 60,
            batch_size: 500,
            auto_threshold_secs: 7 * 86_400,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            latest_ttl_secs: 60,
            stats_ttl_secs: 300,
            series_ttl_secs: 300,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1_000,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: 1_000,
            max_limit: 10_000,
            recent_window: 100,
            max_recent_window: 1_000,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            idle_after_secs: 30,
            close_timeout_secs: 5,
        }
    }
}

impl CacheConfig {
    pub fn latest_ttl(&self) -> Duration {
        Duration::from_secs(self.latest_ttl_secs)
    }

    pub fn stats_ttl(&self) -> Duration {
        Duration::from_secs(self.stats_ttl_secs)
    }

    pub fn series_ttl(&self) -> Duration {
        Duration::from_secs(self.series_ttl_secs)
    }
}

impl StreamConfig {
    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }
}

impl PulseConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: PulseConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values that would make a subsystem unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.storage.workers == 0, "storage.workers must be > 0"),
            (self.storage.partition_span_secs == 0, "storage.partition_span_secs must be > 0"),
            (
                self.storage.partition_span_secs > MAX_SPAN_SECS,
                "storage.partition_span_secs must be at most 366 days",
            ),
            (self.rollup.bucket_secs == 0, "rollup.bucket_secs must be > 0"),
            (self.rollup.bucket_secs > MAX_SPAN_SECS, "rollup.bucket_secs must be at most 366 days"),
            (self.rollup.batch_size == 0, "rollup.batch_size must be > 0"),
            (self.rollup.interval_secs == 0, "rollup.interval_secs must be > 0"),
            (self.retention.interval_secs == 0, "retention.interval_secs must be > 0"),
            (self.ingest.max_batch_size == 0, "ingest.max_batch_size must be > 0"),
            (self.query.max_limit == 0, "query.max_limit must be > 0"),
            (self.stream.queue_capacity == 0, "stream.queue_capacity must be > 0"),
            (self.retention.metrics_days == 0, "retention.metrics_days must be > 0"),
            (self.retention.system_days == 0, "retention.system_days must be > 0"),
            (
                self.retention.metrics_days > MAX_RETENTION_DAYS
                    || self.retention.system_days > MAX_RETENTION_DAYS
                    || self.retention.rollup_days > MAX_RETENTION_DAYS,
                "retention windows must be at most 36500 days",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(ConfigError::Invalid((*msg).to_string())),
            None => Ok(()),
        }
    }
}

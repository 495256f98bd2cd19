//! Domain types for Pulse.
//!
//! Points are immutable facts identified by `(run_id, metric_name, time)`.
//! Timestamps travel as RFC 3339 on the wire and as microseconds since the
//! Unix epoch inside the store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque run identifier minted by the run-lifecycle service.
pub type RunId = String;

/// Structured attributes attached to a metric point.
pub type Metadata = BTreeMap<String, MetadataValue>;

// ── Metadata ───────────────────────────────────────────────────────

/// A single metadata attribute. Only scalar kinds are representable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    /// Short name of the scalar kind, used in validation messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
        }
    }
}

// ── Metric points ──────────────────────────────────────────────────

/// One immutable `(run, metric, time) → value` fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub run_id: RunId,
    pub metric_name: String,
    pub time: DateTime<Utc>,
    /// Training step. A hint only; monotonicity is not enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl MetricPoint {
    /// Storage timestamp (microseconds since the Unix epoch).
    pub fn time_micros(&self) -> i64 {
        self.time.timestamp_micros()
    }
}

/// Resource telemetry sample for a run.
///
/// Every reading is optional; a sample must carry at least one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemMetricPoint {
    pub run_id: RunId,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_used_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_sent_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_recv_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_utilization: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_used_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_temperature_c: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_power_watts: Option<f64>,
}

impl SystemMetricPoint {
    pub fn time_micros(&self) -> i64 {
        self.time.timestamp_micros()
    }

    /// Floating-point readings by field name.
    pub fn float_readings(&self) -> [(&'static str, Option<f64>); 7] {
        [
            ("cpu_percent", self.cpu_percent),
            ("memory_percent", self.memory_percent),
            ("disk_percent", self.disk_percent),
            ("gpu_utilization", self.gpu_utilization),
            ("gpu_memory_percent", self.gpu_memory_percent),
            ("gpu_temperature_c", self.gpu_temperature_c),
            ("gpu_power_watts", self.gpu_power_watts),
        ]
    }

    /// True if at least one reading is present.
    pub fn has_readings(&self) -> bool {
        self.float_readings().iter().any(|(_, v)| v.is_some())
            || self.memory_used_bytes.is_some()
            || self.disk_used_bytes.is_some()
            || self.network_sent_bytes.is_some()
            || self.network_recv_bytes.is_some()
            || self.gpu_memory_used_bytes.is_some()
    }
}

// ── Derived records ────────────────────────────────────────────────

/// Precomputed aggregate of raw points over one time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupBucket {
    pub run_id: RunId,
    pub metric_name: String,
    pub bucket_start: DateTime<Utc>,
    /// Bucket width in seconds.
    pub bucket_secs: u64,
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    /// Sample standard deviation; `None` for single-point buckets.
    pub stddev: Option<f64>,
    pub sum: f64,
    /// Sum of squared deviations from the mean, kept so buckets can be merged.
    pub m2: f64,
}

/// The most recent value of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestValue {
    pub value: f64,
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
}

impl From<&MetricPoint> for LatestValue {
    fn from(p: &MetricPoint) -> Self {
        Self {
            value: p.value,
            time: p.time,
            step: p.step,
        }
    }
}

/// Summary statistics over a range of points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub stddev: Option<f64>,
    pub latest: Option<LatestValue>,
}

impl MetricStats {
    pub fn empty() -> Self {
        Self {
            count: 0,
            min: None,
            max: None,
            avg: None,
            stddev: None,
            latest: None,
        }
    }
}

// ── Queries ────────────────────────────────────────────────────────

/// Granularity requested for a series read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesResolution {
    /// Every stored point.
    #[default]
    Raw,
    /// Hourly rollup buckets.
    Rollup,
    /// Let the store decide based on the requested span.
    Auto,
}

impl SeriesResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            SeriesResolution::Raw => "raw",
            SeriesResolution::Rollup => "rollup",
            SeriesResolution::Auto => "auto",
        }
    }
}

/// Half-open-free inclusive time bounds; `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Bounds in storage microseconds.
    pub fn micros(&self) -> (i64, i64) {
        (
            self.start.map(|t| t.timestamp_micros()).unwrap_or(i64::MIN),
            self.end.map(|t| t.timestamp_micros()).unwrap_or(i64::MAX),
        )
    }

    /// Length of the range when both ends are bounded.
    pub fn span(&self) -> Option<chrono::Duration> {
        match (self.start, self.end) {
            (Some(s), Some(e)) => Some(e - s),
            _ => None,
        }
    }
}

/// Inclusive step bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepRange {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl StepRange {
    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Whether a point's step satisfies the bounds. Step-less points only
    /// match an unbounded range.
    pub fn contains(&self, step: Option<i64>) -> bool {
        if self.is_unbounded() {
            return true;
        }
        let Some(step) = step else { return false };
        self.min.is_none_or(|min| step >= min) && self.max.is_none_or(|max| step <= max)
    }
}

/// Convert storage microseconds back to a timestamp.
pub fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}

/// Drop sub-microsecond precision, so a timestamp equals what the store
/// will hand back for it.
pub fn truncate_micros(time: DateTime<Utc>) -> DateTime<Utc> {
    from_micros(time.timestamp_micros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_scalars_deserialize_untagged() {
        let json = r#"{"lr": 0.001, "epoch": 3, "phase": "train", "eval": false}"#;
        let meta: Metadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta["lr"], MetadataValue::Float(0.001));
        assert_eq!(meta["epoch"], MetadataValue::Int(3));
        assert_eq!(meta["phase"], MetadataValue::Text("train".into()));
        assert_eq!(meta["eval"], MetadataValue::Bool(false));
    }

    #[test]
    fn metadata_rejects_nested_values() {
        let json = r#"{"nested": {"a": 1}}"#;
        assert!(serde_json::from_str::<Metadata>(json).is_err());
    }

    #[test]
    fn point_omits_absent_optionals() {
        let p = MetricPoint {
            run_id: "r1".into(),
            metric_name: "loss".into(),
            time: from_micros(1_000_000),
            step: None,
            value: 0.5,
            metadata: None,
        };
        let json = serde_json::to_value(&p).unwrap();
        assert!(json.get("step").is_none());
        assert!(json.get("metadata").is_none());
        assert_eq!(p.time_micros(), 1_000_000);
    }

    #[test]
    fn truncation_matches_storage_precision() {
        let t: DateTime<Utc> = "2026-01-01T00:00:00.123456789Z".parse().unwrap();
        let truncated = truncate_micros(t);
        assert_eq!(truncated.to_rfc3339(), "2026-01-01T00:00:00.123456+00:00");
        assert_eq!(truncated.timestamp_micros(), t.timestamp_micros());
        assert_eq!(truncate_micros(truncated), truncated);
    }

    #[test]
    fn step_range_matching() {
        let r = StepRange {
            min: Some(2),
            max: Some(4),
        };
        assert!(!r.contains(Some(1)));
        assert!(r.contains(Some(2)));
        assert!(r.contains(Some(4)));
        assert!(!r.contains(None));
        assert!(StepRange::default().contains(None));
    }

    #[test]
    fn time_range_bounds() {
        let r = TimeRange::unbounded();
        assert_eq!(r.micros(), (i64::MIN, i64::MAX));
        assert!(r.span().is_none());

        let r = TimeRange {
            start: Some(from_micros(0)),
            end: Some(from_micros(3_600_000_000)),
        };
        assert_eq!(r.span(), Some(chrono::Duration::hours(1)));
    }

    #[test]
    fn system_point_reading_presence() {
        let mut p = SystemMetricPoint {
            run_id: "r1".into(),
            ..Default::default()
        };
        assert!(!p.has_readings());
        p.network_recv_bytes = Some(10);
        assert!(p.has_readings());
    }
}

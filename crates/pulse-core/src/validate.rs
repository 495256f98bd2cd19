//! Batch validation for ingestion.
//!
//! A batch is checked in full before anything is written. Every problem is
//! reported with the index of the offending point so the caller can fix the
//! batch and resend it.

use std::collections::HashMap;

use serde::Serialize;

use crate::types::{MetadataValue, MetricPoint, SystemMetricPoint};

/// Longest accepted metric name, in bytes.
pub const MAX_METRIC_NAME_LEN: usize = 255;

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointError {
    /// Index of the point in the batch; `None` for batch-level problems.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    pub field: String,
    pub message: String,
}

impl PointError {
    pub fn at(index: usize, field: &str, message: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn batch(field: &str, message: impl Into<String>) -> Self {
        Self {
            index: None,
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Checks shared by both point kinds: batch size and single-run scoping.
fn check_batch<'a>(
    run_ids: impl Iterator<Item = &'a str>,
    len: usize,
    max_batch_size: usize,
    errors: &mut Vec<PointError>,
) -> bool {
    if len == 0 {
        errors.push(PointError::batch("metrics", "batch is empty"));
        return false;
    }
    if len > max_batch_size {
        errors.push(PointError::batch(
            "metrics",
            format!("batch has {len} points, limit is {max_batch_size}"),
        ));
        return false;
    }

    let mut batch_run: Option<&str> = None;
    for (i, run_id) in run_ids.enumerate() {
        if run_id.trim().is_empty() {
            errors.push(PointError::at(i, "run_id", "run_id must not be empty"));
            continue;
        }
        match batch_run {
            None => batch_run = Some(run_id),
            Some(expected) if expected != run_id => errors.push(PointError::at(
                i,
                "run_id",
                format!("batch is scoped to run {expected:?}, got {run_id:?}"),
            )),
            Some(_) => {}
        }
    }
    true
}

/// Validate a batch of metric points.
pub fn validate_metric_batch(
    points: &[MetricPoint],
    max_batch_size: usize,
) -> Result<(), Vec<PointError>> {
    let mut errors = Vec::new();
    if !check_batch(
        points.iter().map(|p| p.run_id.as_str()),
        points.len(),
        max_batch_size,
        &mut errors,
    ) {
        return Err(errors);
    }

    let mut seen: HashMap<(&str, &str, i64), usize> = HashMap::with_capacity(points.len());
    for (i, p) in points.iter().enumerate() {
        let key = (p.run_id.as_str(), p.metric_name.as_str(), p.time_micros());
        if let Some(earlier) = seen.insert(key, i) {
            errors.push(PointError::at(
                i,
                "time",
                format!("point {earlier} has the same metric and time at microsecond precision"),
            ));
        }
        if p.metric_name.trim().is_empty() {
            errors.push(PointError::at(i, "metric_name", "metric_name must not be empty"));
        } else if p.metric_name.len() > MAX_METRIC_NAME_LEN {
            errors.push(PointError::at(
                i,
                "metric_name",
                format!("metric_name exceeds {MAX_METRIC_NAME_LEN} bytes"),
            ));
        }
        if !p.value.is_finite() {
            errors.push(PointError::at(
                i,
                "value",
                format!("value must be finite, got {}", p.value),
            ));
        }
        if let Some(meta) = &p.metadata {
            for (key, value) in meta {
                if let MetadataValue::Float(f) = value
                    && !f.is_finite()
                {
                    errors.push(PointError::at(
                        i,
                        "metadata",
                        format!("metadata {key:?} must be finite"),
                    ));
                }
            }
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Validate a batch of system telemetry points.
pub fn validate_system_batch(
    points: &[SystemMetricPoint],
    max_batch_size: usize,
) -> Result<(), Vec<PointError>> {
    let mut errors = Vec::new();
    if !check_batch(
        points.iter().map(|p| p.run_id.as_str()),
        points.len(),
        max_batch_size,
        &mut errors,
    ) {
        return Err(errors);
    }

    let mut seen: HashMap<(&str, i64), usize> = HashMap::with_capacity(points.len());
    for (i, p) in points.iter().enumerate() {
        if let Some(earlier) = seen.insert((p.run_id.as_str(), p.time_micros()), i) {
            errors.push(PointError::at(
                i,
                "time",
                format!("point {earlier} has the same time at microsecond precision"),
            ));
        }
        if !p.has_readings() {
            errors.push(PointError::at(i, "readings", "sample carries no readings"));
        }
        for (field, reading) in p.float_readings() {
            if let Some(v) = reading
                && !v.is_finite()
            {
                errors.push(PointError::at(i, field, format!("{field} must be finite, got {v}")));
            }
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metadata, from_micros};

    fn point(run: &str, name: &str, value: f64) -> MetricPoint {
        point_at(run, name, value, 0)
    }

    fn point_at(run: &str, name: &str, value: f64, us: i64) -> MetricPoint {
        MetricPoint {
            run_id: run.to_string(),
            metric_name: name.to_string(),
            time: from_micros(us),
            step: None,
            value,
            metadata: None,
        }
    }

    #[test]
    fn valid_batch_passes() {
        let batch = vec![point("r1", "loss", 0.9), point("r1", "acc", 0.1)];
        assert!(validate_metric_batch(&batch, 1000).is_ok());
    }

    #[test]
    fn empty_batch_rejected() {
        let errors = validate_metric_batch(&[], 1000).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].index, None);
    }

    #[test]
    fn oversize_batch_rejected() {
        let batch: Vec<_> = (0..5).map(|_| point("r1", "loss", 1.0)).collect();
        let errors = validate_metric_batch(&batch, 4).unwrap_err();
        assert!(errors[0].message.contains("limit is 4"));
    }

    #[test]
    fn non_finite_values_name_their_index() {
        let batch = vec![
            point_at("r1", "loss", 0.9, 0),
            point_at("r1", "loss", f64::NAN, 1),
            point_at("r1", "loss", f64::INFINITY, 2),
        ];
        let errors = validate_metric_batch(&batch, 1000).unwrap_err();
        let indexes: Vec<_> = errors.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![Some(1), Some(2)]);
        assert!(errors.iter().all(|e| e.field == "value"));
    }

    #[test]
    fn colliding_times_rejected() {
        let batch = vec![
            point_at("r1", "loss", 1.0, 10),
            point_at("r1", "acc", 1.0, 10),
            point_at("r1", "loss", 2.0, 10),
        ];
        let errors = validate_metric_batch(&batch, 1000).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].index, Some(2));
        assert_eq!(errors[0].field, "time");
        assert!(errors[0].message.contains("point 0"));
    }

    #[test]
    fn blank_metric_name_rejected() {
        let batch = vec![point("r1", "  ", 1.0)];
        let errors = validate_metric_batch(&batch, 1000).unwrap_err();
        assert_eq!(errors[0].field, "metric_name");
    }

    #[test]
    fn mixed_runs_rejected() {
        let batch = vec![point("r1", "loss", 1.0), point("r2", "loss", 1.0)];
        let errors = validate_metric_batch(&batch, 1000).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].index, Some(1));
        assert_eq!(errors[0].field, "run_id");
    }

    #[test]
    fn non_finite_metadata_rejected() {
        let mut p = point("r1", "loss", 1.0);
        let mut meta = Metadata::new();
        meta.insert("lr".into(), MetadataValue::Float(f64::NAN));
        p.metadata = Some(meta);
        let errors = validate_metric_batch(&[p], 1000).unwrap_err();
        assert_eq!(errors[0].field, "metadata");
    }

    #[test]
    fn system_batch_requires_readings() {
        let empty = SystemMetricPoint {
            run_id: "r1".into(),
            ..Default::default()
        };
        let mut ok = empty.clone();
        ok.cpu_percent = Some(42.0);
        let mut empty = empty;
        empty.time = from_micros(1);
        let mut bad = empty.clone();
        bad.time = from_micros(2);
        bad.gpu_utilization = Some(f64::NEG_INFINITY);

        let errors = validate_system_batch(&[ok, empty, bad], 1000).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| (e.index, e.field.as_str())).collect();
        assert_eq!(fields, vec![(Some(1), "readings"), (Some(2), "gpu_utilization")]);
    }

    #[test]
    fn system_samples_need_distinct_times() {
        let mut a = SystemMetricPoint {
            run_id: "r1".into(),
            cpu_percent: Some(1.0),
            ..Default::default()
        };
        a.time = from_micros(5);
        let b = a.clone();
        let errors = validate_system_batch(&[a, b], 1000).unwrap_err();
        assert_eq!(errors[0].index, Some(1));
        assert_eq!(errors[0].field, "time");
    }
}

//! Batch ingestion handlers.
//!
//! A batch goes through four steps in order: validate the whole batch,
//! write it in one storage transaction, invalidate the cache entries it
//! touched, and publish it once to live subscribers. Only the first two can
//! fail the request.
//!
//! Timestamps are kept to microsecond precision. Points that carry a `time`
//! are idempotent: resending them stores nothing new. Points without one are
//! stamped on arrival, and every stamp is a new identity, so a retried batch
//! of such points is stored twice. The receipt reports how many points were
//! stamped.

use std::collections::BTreeSet;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use pulse_core::{
    Metadata, MetricPoint, PointError, SystemMetricPoint, from_micros, truncate_micros,
    validate_metric_batch, validate_system_batch,
};

use crate::ApiState;
use crate::error::{ApiError, ApiResponse, ApiResult};

/// Request body for both ingestion paths.
///
/// Elements are parsed one by one so that a malformed point is reported
/// with its index instead of failing the whole body.
#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub metrics: Vec<Value>,
}

/// Metric point as sent by clients.
#[derive(Debug, Deserialize)]
struct IncomingPoint {
    run_id: String,
    metric_name: String,
    value: WireValue,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
    #[serde(default)]
    step: Option<i64>,
    #[serde(default)]
    metadata: Option<Metadata>,
}

/// JSON has no literal for NaN or infinities; clients that send them as
/// strings still get a per-index validation error. Any other string is not
/// a value.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireValue {
    Number(f64),
    Text(String),
}

impl WireValue {
    fn to_f64(&self) -> Option<f64> {
        match self {
            WireValue::Number(v) => Some(*v),
            WireValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "nan" => Some(f64::NAN),
                "inf" | "+inf" | "infinity" | "+infinity" => Some(f64::INFINITY),
                "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
                _ => None,
            },
        }
    }
}

/// Result of an accepted batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub run_id: String,
    /// Points in the batch.
    pub accepted: usize,
    /// Points whose `(run, metric, time)` identity was not stored before.
    pub new_points: usize,
    /// Live subscribers the batch was delivered to.
    pub subscribers: usize,
    /// Points sent without a `time` and stamped on arrival. Each stamp is a
    /// new identity, so resending these points stores them again.
    pub server_timestamped: usize,
}

fn check_size(len: usize, max: usize) -> Result<(), ApiError> {
    if len == 0 {
        return Err(ApiError::Validation(vec![PointError::batch("metrics", "batch is empty")]));
    }
    if len > max {
        return Err(ApiError::Validation(vec![PointError::batch(
            "metrics",
            format!("batch has {len} points, limit is {max}"),
        )]));
    }
    Ok(())
}

fn lacks_time(v: &Value) -> bool {
    v.get("time").is_none_or(Value::is_null)
}

/// Parsed points plus how many of them the server stamped.
struct Parsed<T> {
    points: Vec<T>,
    stamped: usize,
}

fn parse_metric_points(
    state: &ApiState,
    raw: Vec<Value>,
) -> Result<Parsed<MetricPoint>, ApiError> {
    let missing = raw.iter().filter(|v| lacks_time(v)).count();
    let mut next_time = if missing > 0 { state.clock.reserve(missing) } else { 0 };

    let mut points = Vec::with_capacity(raw.len());
    let mut errors = Vec::new();
    for (i, v) in raw.into_iter().enumerate() {
        let incoming: IncomingPoint = match serde_json::from_value(v) {
            Ok(p) => p,
            Err(e) => {
                errors.push(PointError::at(i, "point", e.to_string()));
                continue;
            }
        };
        let Some(value) = incoming.value.to_f64() else {
            errors.push(PointError::at(i, "value", "value must be a number"));
            continue;
        };
        let time = match incoming.time {
            Some(time) => truncate_micros(time),
            None => {
                next_time += 1;
                from_micros(next_time - 1)
            }
        };
        points.push(MetricPoint {
            run_id: incoming.run_id,
            metric_name: incoming.metric_name,
            time,
            step: incoming.step,
            value,
            metadata: incoming.metadata,
        });
    }

    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }
    Ok(Parsed {
        points,
        stamped: missing,
    })
}

fn parse_system_points(
    state: &ApiState,
    raw: Vec<Value>,
) -> Result<Parsed<SystemMetricPoint>, ApiError> {
    let missing = raw.iter().filter(|v| lacks_time(v)).count();
    let mut next_time = if missing > 0 { state.clock.reserve(missing) } else { 0 };

    let mut points = Vec::with_capacity(raw.len());
    let mut errors = Vec::new();
    for (i, mut v) in raw.into_iter().enumerate() {
        if lacks_time(&v)
            && let Some(obj) = v.as_object_mut()
        {
            obj.insert("time".to_string(), Value::String(from_micros(next_time).to_rfc3339()));
            next_time += 1;
        }
        match serde_json::from_value::<SystemMetricPoint>(v) {
            Ok(mut p) => {
                p.time = truncate_micros(p.time);
                points.push(p);
            }
            Err(e) => errors.push(PointError::at(i, "point", e.to_string())),
        }
    }

    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }
    Ok(Parsed {
        points,
        stamped: missing,
    })
}

fn parse_body(body: Result<Json<BatchRequest>, JsonRejection>) -> Result<Vec<Value>, ApiError> {
    match body {
        Ok(Json(req)) => Ok(req.metrics),
        Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
    }
}

/// POST /api/v1/metrics/batch
pub async fn ingest_metrics(
    State(state): State<ApiState>,
    body: Result<Json<BatchRequest>, JsonRejection>,
) -> ApiResult<IngestReceipt> {
    let max = state.config.ingest.max_batch_size;
    let Parsed { points, stamped } = parse_body(body)
        .and_then(|raw| {
            check_size(raw.len(), max)?;
            parse_metric_points(&state, raw)
        })
        .and_then(|parsed| {
            validate_metric_batch(&parsed.points, max).map_err(ApiError::Validation)?;
            Ok(parsed)
        })
        .inspect_err(|_| state.metrics.record_batch_rejected())?;

    let (summary, points) = state
        .pool
        .run(move |store| store.insert_metrics(&points).map(|summary| (summary, points)))
        .await
        .inspect_err(|e| {
            state.metrics.record_storage_error();
            warn!(error = %e, "metric batch write failed");
        })?;

    let run_id = points[0].run_id.clone();
    let touched: BTreeSet<&str> = points.iter().map(|p| p.metric_name.as_str()).collect();
    for metric in touched {
        if let Err(e) = state.cache.invalidate_metric(&run_id, metric).await {
            warn!(%run_id, metric, error = %e, "cache invalidation failed");
        }
    }

    let report = state.broadcaster.publish_metrics(&run_id, &points);
    state.metrics.record_publish(report.dropped);
    state.metrics.record_batch_accepted(points.len());
    debug!(
        %run_id,
        points = points.len(),
        new_points = summary.new_points,
        subscribers = report.delivered,
        "metric batch ingested"
    );

    Ok(ApiResponse::ok(IngestReceipt {
        run_id,
        accepted: points.len(),
        new_points: summary.new_points,
        subscribers: report.delivered,
        server_timestamped: stamped,
    }))
}

/// POST /api/v1/system-metrics/batch
pub async fn ingest_system_metrics(
    State(state): State<ApiState>,
    body: Result<Json<BatchRequest>, JsonRejection>,
) -> ApiResult<IngestReceipt> {
    let max = state.config.ingest.max_batch_size;
    let Parsed { points, stamped } = parse_body(body)
        .and_then(|raw| {
            check_size(raw.len(), max)?;
            parse_system_points(&state, raw)
        })
        .and_then(|parsed| {
            validate_system_batch(&parsed.points, max).map_err(ApiError::Validation)?;
            Ok(parsed)
        })
        .inspect_err(|_| state.metrics.record_batch_rejected())?;

    let (summary, points) = state
        .pool
        .run(move |store| store.insert_system_metrics(&points).map(|summary| (summary, points)))
        .await
        .inspect_err(|e| {
            state.metrics.record_storage_error();
            warn!(error = %e, "system batch write failed");
        })?;

    let run_id = points[0].run_id.clone();
    let report = state.broadcaster.publish_system(&run_id, &points);
    state.metrics.record_publish(report.dropped);
    state.metrics.record_system_batch_accepted(points.len());
    debug!(%run_id, points = points.len(), "system batch ingested");

    Ok(ApiResponse::ok(IngestReceipt {
        run_id,
        accepted: points.len(),
        new_points: summary.new_points,
        subscribers: report.delivered,
        server_timestamped: stamped,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use pulse_cache::{CacheError, CacheKey, CacheResult, CacheStore, CacheTtls, MetricCache};
    use pulse_core::PulseConfig;
    use pulse_store::SeriesQuery;
    use pulse_stream::{StreamEvent, SubscriptionFilter};
    use serde_json::json;

    use super::*;
    use crate::test_support::test_state;

    fn body(metrics: Value) -> Result<Json<BatchRequest>, JsonRejection> {
        Ok(Json(serde_json::from_value(json!({ "metrics": metrics })).unwrap()))
    }

    fn stored(state: &ApiState, run: &str) -> Vec<MetricPoint> {
        match state
            .pool
            .store()
            .query_series(&SeriesQuery::new(run, 1000))
            .unwrap()
        {
            pulse_store::SeriesData::Raw(points) => points,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepted_batch_is_stored_and_published() {
        let state = test_state();
        let sub = state.broadcaster.subscribe("r1", SubscriptionFilter::all());

        let Json(resp) = ingest_metrics(
            State(state.clone()),
            body(json!([
                { "run_id": "r1", "metric_name": "loss", "step": 1, "value": 0.9, "time": "2026-01-01T00:00:00Z" },
                { "run_id": "r1", "metric_name": "loss", "step": 2, "value": 0.7, "time": "2026-01-01T00:00:01Z" },
            ])),
        )
        .await
        .unwrap();

        let receipt = resp.data.unwrap();
        assert_eq!(receipt.accepted, 2);
        assert_eq!(receipt.new_points, 2);
        assert_eq!(receipt.subscribers, 1);
        assert_eq!(stored(&state, "r1").len(), 2);

        match sub.try_recv() {
            Some(StreamEvent::Metrics(points)) => assert_eq!(points.len(), 2),
            other => panic!("expected one metrics event, got {other:?}"),
        }
        assert!(sub.try_recv().is_none(), "one message per batch");
    }

    #[tokio::test]
    async fn non_finite_value_rejects_whole_batch() {
        let state = test_state();
        let err = ingest_metrics(
            State(state.clone()),
            body(json!([
                { "run_id": "r1", "metric_name": "loss", "value": 0.9 },
                { "run_id": "r1", "metric_name": "loss", "value": "NaN" },
                { "run_id": "r1", "metric_name": "loss", "value": "-Infinity" },
            ])),
        )
        .await
        .unwrap_err();

        match err {
            ApiError::Validation(errors) => {
                let indexes: Vec<_> = errors.iter().map(|e| e.index).collect();
                assert_eq!(indexes, vec![Some(1), Some(2)]);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(stored(&state, "r1").is_empty());
        assert_eq!(state.metrics.snapshot().batches_rejected, 1);
    }

    #[tokio::test]
    async fn numeric_strings_are_not_values() {
        let state = test_state();
        let err = ingest_metrics(
            State(state.clone()),
            body(json!([
                { "run_id": "r1", "metric_name": "loss", "value": "0.5" },
                { "run_id": "r1", "metric_name": "loss", "value": "inf" },
            ])),
        )
        .await
        .unwrap_err();
        match err {
            ApiError::Validation(errors) => {
                let found: Vec<_> = errors
                    .iter()
                    .map(|e| (e.index, e.message.as_str()))
                    .collect();
                assert_eq!(found[0], (Some(0), "value must be a number"));
                assert_eq!(found.len(), 1);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(stored(&state, "r1").is_empty());
    }

    #[tokio::test]
    async fn sub_microsecond_collision_rejected() {
        let state = test_state();
        let err = ingest_metrics(
            State(state.clone()),
            body(json!([
                { "run_id": "r1", "metric_name": "loss", "value": 1.0, "time": "2026-01-01T00:00:00.123456100Z" },
                { "run_id": "r1", "metric_name": "loss", "value": 2.0, "time": "2026-01-01T00:00:00.123456789Z" },
            ])),
        )
        .await
        .unwrap_err();
        match err {
            ApiError::Validation(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].index, Some(1));
                assert_eq!(errors[0].field, "time");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(stored(&state, "r1").is_empty());
    }

    #[tokio::test]
    async fn published_times_match_stored_times() {
        let state = test_state();
        let sub = state.broadcaster.subscribe("r1", SubscriptionFilter::all());
        ingest_metrics(
            State(state.clone()),
            body(json!([
                { "run_id": "r1", "metric_name": "loss", "value": 1.0, "time": "2026-01-01T00:00:00.123456789Z" },
            ])),
        )
        .await
        .unwrap();

        let stored = stored(&state, "r1");
        assert_eq!(stored[0].time.to_rfc3339(), "2026-01-01T00:00:00.123456+00:00");
        match sub.try_recv() {
            Some(StreamEvent::Metrics(points)) => assert_eq!(points[0].time, stored[0].time),
            other => panic!("expected metrics event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn receipt_counts_server_stamped_points() {
        let state = test_state();
        let batch = json!([
            { "run_id": "r1", "metric_name": "loss", "value": 0.9 },
            { "run_id": "r1", "metric_name": "loss", "value": 0.8, "time": "2026-01-01T00:00:00Z" },
        ]);
        let Json(resp) = ingest_metrics(State(state.clone()), body(batch.clone()))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap().server_timestamped, 1);

        // The stamped point is stored again on resend; the timed one is not.
        let Json(resp) = ingest_metrics(State(state.clone()), body(batch)).await.unwrap();
        let receipt = resp.data.unwrap();
        assert_eq!(receipt.new_points, 1);
        assert_eq!(stored(&state, "r1").len(), 3);
    }

    #[tokio::test]
    async fn malformed_point_reports_its_index() {
        let state = test_state();
        let err = ingest_metrics(
            State(state),
            body(json!([
                { "run_id": "r1", "metric_name": "loss", "value": 1.0 },
                { "run_id": "r1", "value": 1.0 },
            ])),
        )
        .await
        .unwrap_err();
        match err {
            ApiError::Validation(errors) => assert_eq!(errors[0].index, Some(1)),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversize_batch_rejected() {
        let mut config = PulseConfig::default();
        config.ingest.max_batch_size = 2;
        let state = crate::test_support::test_state_with(config);
        let points: Vec<_> = (0..3)
            .map(|i| json!({ "run_id": "r1", "metric_name": "loss", "value": i }))
            .collect();
        let err = ingest_metrics(State(state), body(Value::Array(points)))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(ref e) if e[0].index.is_none()));
    }

    #[tokio::test]
    async fn server_timestamps_are_distinct() {
        let state = test_state();
        let points: Vec<_> = (0..5)
            .map(|i| json!({ "run_id": "r1", "metric_name": "loss", "value": i }))
            .collect();
        ingest_metrics(State(state.clone()), body(Value::Array(points)))
            .await
            .unwrap();
        let stored = stored(&state, "r1");
        assert_eq!(stored.len(), 5);
        assert!(stored.windows(2).all(|w| w[0].time < w[1].time));
    }

    #[tokio::test]
    async fn reingest_with_explicit_times_is_idempotent() {
        let state = test_state();
        let batch = json!([
            { "run_id": "r1", "metric_name": "acc", "value": 0.5, "time": "2026-01-01T00:00:00Z" },
        ]);
        ingest_metrics(State(state.clone()), body(batch.clone())).await.unwrap();
        let Json(resp) = ingest_metrics(State(state.clone()), body(batch)).await.unwrap();
        assert_eq!(resp.data.unwrap().new_points, 0);
        assert_eq!(stored(&state, "r1").len(), 1);
    }

    struct BrokenCache;

    #[async_trait]
    impl CacheStore for BrokenCache {
        async fn get(&self, _key: &CacheKey) -> CacheResult<Option<Arc<[u8]>>> {
            Err(CacheError::Unavailable("down".into()))
        }

        async fn put(&self, _key: CacheKey, _value: Vec<u8>, _ttl: Duration) -> CacheResult<()> {
            Err(CacheError::Unavailable("down".into()))
        }

        async fn invalidate(&self, _key: &CacheKey) -> CacheResult<()> {
            Err(CacheError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn cache_failure_does_not_fail_ingest() {
        let cache = MetricCache::new(
            Arc::new(BrokenCache),
            CacheTtls::from_config(&Default::default()),
        );
        let state = test_state().with_cache(Arc::new(cache));
        let result = ingest_metrics(
            State(state.clone()),
            body(json!([{ "run_id": "r1", "metric_name": "loss", "value": 1.0 }])),
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(stored(&state, "r1").len(), 1);
    }

    #[tokio::test]
    async fn system_batch_fills_missing_time() {
        let state = test_state();
        let sub = state
            .broadcaster
            .subscribe("r1", SubscriptionFilter::all().with_system());
        let Json(resp) = ingest_system_metrics(
            State(state.clone()),
            body(json!([{ "run_id": "r1", "cpu_percent": 12.5 }])),
        )
        .await
        .unwrap();
        assert_eq!(resp.data.unwrap().accepted, 1);

        let points = state
            .pool
            .store()
            .query_system("r1", Default::default(), 10)
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].cpu_percent, Some(12.5));
        assert!(matches!(sub.try_recv(), Some(StreamEvent::System(_))));
    }

    #[tokio::test]
    async fn empty_system_sample_rejected() {
        let state = test_state();
        let err = ingest_system_metrics(State(state), body(json!([{ "run_id": "r1" }])))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(ref e) if e[0].field == "readings"));
    }
}

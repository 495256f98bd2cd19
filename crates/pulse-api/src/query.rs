//! Read handlers.
//!
//! Latest values and statistics are served cache-first and populated on a
//! miss. Series reads always go to storage. A cache that errors is treated
//! as a miss.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::HeaderName;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use pulse_cache::CacheKey;
use pulse_core::{
    LatestValue, MetricPoint, MetricStats, RollupBucket, SeriesResolution, StepRange,
    SystemMetricPoint, TimeRange,
};
use pulse_store::{SeriesData, SeriesQuery};

use crate::ApiState;
use crate::error::{ApiError, ApiResponse, ApiResult};

/// Response header naming the representation a series was answered with.
pub const RESOLUTION_HEADER: HeaderName = HeaderName::from_static("x-pulse-resolution");

#[derive(Debug, Deserialize)]
pub struct SeriesParams {
    pub run_id: String,
    pub metric_name: Option<String>,
    pub min_step: Option<i64>,
    pub max_step: Option<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub resolution: Option<SeriesResolution>,
}

#[derive(Debug, Deserialize)]
pub struct MetricParams {
    pub run_id: String,
    pub metric_name: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    pub run_id: String,
    pub metric_name: String,
    pub window: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RunParams {
    pub run_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SeriesResponse {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_name: Option<String>,
    pub resolution: SeriesResolution,
    pub count: usize,
    pub points: SeriesData,
}

/// Cached tail of a series. `points` holds at most `window` points,
/// ascending by time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentWindow {
    pub window: usize,
    pub points: Vec<MetricPoint>,
}

fn params<T: DeserializeOwned>(query: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    query
        .map(|Query(p)| p)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

fn require(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

fn time_range(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<TimeRange, ApiError> {
    if let (Some(s), Some(e)) = (start, end)
        && s > e
    {
        return Err(ApiError::BadRequest("start_time is after end_time".into()));
    }
    Ok(TimeRange { start, end })
}

fn limit(state: &ApiState, requested: Option<usize>) -> Result<usize, ApiError> {
    match requested {
        Some(0) => Err(ApiError::BadRequest("limit must be > 0".into())),
        Some(n) => Ok(n.min(state.config.query.max_limit)),
        None => Ok(state.config.query.default_limit),
    }
}

/// Cache read that degrades to a miss.
async fn cached<T: DeserializeOwned>(state: &ApiState, key: &CacheKey) -> Option<T> {
    match state.cache.get(key).await {
        Ok(hit) => hit,
        Err(e) => {
            warn!(%key, error = %e, "cache read failed, falling back to storage");
            None
        }
    }
}

async fn populate<T: Serialize>(state: &ApiState, key: CacheKey, value: &T) {
    if let Err(e) = state.cache.put(key, value).await {
        warn!(error = %e, "cache write failed");
    }
}

/// GET /api/v1/metrics/series
pub async fn get_series(
    State(state): State<ApiState>,
    query: Result<Query<SeriesParams>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let p = params(query)?;
    require("run_id", &p.run_id)?;
    if let (Some(min), Some(max)) = (p.min_step, p.max_step)
        && min > max
    {
        return Err(ApiError::BadRequest("min_step is greater than max_step".into()));
    }
    let resolution = p.resolution.unwrap_or_default();
    if resolution == SeriesResolution::Rollup && p.metric_name.is_none() {
        return Err(ApiError::BadRequest("rollup resolution requires metric_name".into()));
    }

    let query = SeriesQuery {
        run_id: p.run_id.clone(),
        metric_name: p.metric_name.clone(),
        time: time_range(p.start_time, p.end_time)?,
        steps: StepRange {
            min: p.min_step,
            max: p.max_step,
        },
        limit: limit(&state, p.limit)?,
        offset: p.offset.unwrap_or(0),
        resolution,
    };
    let data = state.pool.run(move |store| store.query_series(&query)).await?;
    let resolution = data.resolution();
    debug!(run_id = %p.run_id, points = data.len(), resolution = resolution.as_str(), "series read");

    Ok((
        [(RESOLUTION_HEADER, resolution.as_str())],
        ApiResponse::ok(SeriesResponse {
            run_id: p.run_id,
            metric_name: p.metric_name,
            resolution,
            count: data.len(),
            points: data,
        }),
    ))
}

/// GET /api/v1/metrics/latest
pub async fn get_latest(
    State(state): State<ApiState>,
    query: Result<Query<MetricParams>, QueryRejection>,
) -> ApiResult<LatestValue> {
    let p = params(query)?;
    require("run_id", &p.run_id)?;
    require("metric_name", &p.metric_name)?;

    let key = CacheKey::latest(&p.run_id, &p.metric_name);
    if let Some(latest) = cached::<LatestValue>(&state, &key).await {
        return Ok(ApiResponse::ok(latest));
    }

    let (run_id, metric_name) = (p.run_id.clone(), p.metric_name.clone());
    let point = state
        .pool
        .run(move |store| store.latest(&run_id, &metric_name))
        .await?;
    let Some(point) = point else {
        return Err(ApiError::NotFound(format!(
            "no data for metric {:?} in run {:?}",
            p.metric_name, p.run_id
        )));
    };
    let latest = LatestValue::from(&point);
    populate(&state, key, &latest).await;
    Ok(ApiResponse::ok(latest))
}

/// GET /api/v1/metrics/stats
///
/// Only whole-run statistics are cached; ranged requests always go to
/// storage.
pub async fn get_stats(
    State(state): State<ApiState>,
    query: Result<Query<MetricParams>, QueryRejection>,
) -> ApiResult<MetricStats> {
    let p = params(query)?;
    require("run_id", &p.run_id)?;
    require("metric_name", &p.metric_name)?;
    let range = time_range(p.start_time, p.end_time)?;

    let key = range
        .is_unbounded()
        .then(|| CacheKey::stats(&p.run_id, &p.metric_name));
    if let Some(key) = &key
        && let Some(stats) = cached::<MetricStats>(&state, key).await
    {
        return Ok(ApiResponse::ok(stats));
    }

    let (run_id, metric_name) = (p.run_id, p.metric_name);
    let stats = state
        .pool
        .run(move |store| store.stats(&run_id, &metric_name, range))
        .await?;
    if let Some(key) = key {
        populate(&state, key, &stats).await;
    }
    Ok(ApiResponse::ok(stats))
}

/// GET /api/v1/metrics/recent
pub async fn get_recent(
    State(state): State<ApiState>,
    query: Result<Query<RecentParams>, QueryRejection>,
) -> ApiResult<Vec<MetricPoint>> {
    let p = params(query)?;
    require("run_id", &p.run_id)?;
    require("metric_name", &p.metric_name)?;
    let q = &state.config.query;
    let window = match p.window {
        Some(0) => return Err(ApiError::BadRequest("window must be > 0".into())),
        Some(n) => n.min(q.max_recent_window),
        None => q.recent_window,
    };

    let key = CacheKey::series(&p.run_id, &p.metric_name);
    if let Some(hit) = cached::<RecentWindow>(&state, &key).await
        && hit.window >= window
    {
        let skip = hit.points.len().saturating_sub(window);
        return Ok(ApiResponse::ok(hit.points.into_iter().skip(skip).collect()));
    }

    let fetch = window.max(q.recent_window);
    let (run_id, metric_name) = (p.run_id, p.metric_name);
    let mut points = state
        .pool
        .run(move |store| store.recent(&run_id, &metric_name, fetch))
        .await?;
    populate(
        &state,
        key,
        &RecentWindow {
            window: fetch,
            points: points.clone(),
        },
    )
    .await;
    let skip = points.len().saturating_sub(window);
    points.drain(..skip);
    Ok(ApiResponse::ok(points))
}

/// GET /api/v1/metrics/rollups
pub async fn get_rollups(
    State(state): State<ApiState>,
    query: Result<Query<MetricParams>, QueryRejection>,
) -> ApiResult<Vec<RollupBucket>> {
    let p = params(query)?;
    require("run_id", &p.run_id)?;
    require("metric_name", &p.metric_name)?;
    let range = time_range(p.start_time, p.end_time)?;
    let buckets = state
        .pool
        .run(move |store| store.rollups(&p.run_id, &p.metric_name, range))
        .await?;
    Ok(ApiResponse::ok(buckets))
}

#[derive(Debug, Deserialize)]
pub struct NamesParams {
    pub run_id: String,
}

/// GET /api/v1/metrics/names
pub async fn get_metric_names(
    State(state): State<ApiState>,
    query: Result<Query<NamesParams>, QueryRejection>,
) -> ApiResult<Vec<String>> {
    let p = params(query)?;
    require("run_id", &p.run_id)?;
    let names = state
        .pool
        .run(move |store| store.metric_names(&p.run_id))
        .await?;
    Ok(ApiResponse::ok(names))
}

/// GET /api/v1/system-metrics/series
pub async fn get_system_series(
    State(state): State<ApiState>,
    query: Result<Query<RunParams>, QueryRejection>,
) -> ApiResult<Vec<SystemMetricPoint>> {
    let p = params(query)?;
    require("run_id", &p.run_id)?;
    let range = time_range(p.start_time, p.end_time)?;
    let limit = limit(&state, p.limit)?;
    let points = state
        .pool
        .run(move |store| store.query_system(&p.run_id, range, limit))
        .await?;
    Ok(ApiResponse::ok(points))
}

#[cfg(test)]
mod tests {
    use axum::Json;
    use axum::body::to_bytes;
    use axum::extract::State;
    use pulse_cache::CacheKind;
    use pulse_core::from_micros;

    use super::*;
    use crate::test_support::test_state;

    const HOUR_US: i64 = 3_600_000_000;

    fn point(metric: &str, step: i64, value: f64, time_us: i64) -> MetricPoint {
        MetricPoint {
            run_id: "r1".into(),
            metric_name: metric.into(),
            time: from_micros(time_us),
            step: Some(step),
            value,
            metadata: None,
        }
    }

    fn seed(state: &ApiState, points: &[MetricPoint]) {
        state.pool.store().insert_metrics(points).unwrap();
    }

    fn metric_params(metric: &str) -> Result<Query<MetricParams>, QueryRejection> {
        Ok(Query(MetricParams {
            run_id: "r1".into(),
            metric_name: metric.into(),
            start_time: None,
            end_time: None,
        }))
    }

    fn series_params() -> SeriesParams {
        SeriesParams {
            run_id: "r1".into(),
            metric_name: Some("loss".into()),
            min_step: None,
            max_step: None,
            start_time: None,
            end_time: None,
            limit: None,
            offset: None,
            resolution: None,
        }
    }

    #[tokio::test]
    async fn latest_populates_cache() {
        let state = test_state();
        seed(&state, &[point("loss", 1, 0.9, HOUR_US), point("loss", 2, 0.7, 2 * HOUR_US)]);

        let Json(resp) = get_latest(State(state.clone()), metric_params("loss")).await.unwrap();
        let latest = resp.data.unwrap();
        assert_eq!((latest.step, latest.value), (Some(2), 0.7));

        let key = CacheKey::new("r1", "loss", CacheKind::Latest);
        let cached: Option<LatestValue> = state.cache.get(&key).await.unwrap();
        assert_eq!(cached, Some(latest));
    }

    #[tokio::test]
    async fn latest_serves_cached_value_until_invalidated() {
        let state = test_state();
        seed(&state, &[point("loss", 1, 0.9, HOUR_US)]);
        get_latest(State(state.clone()), metric_params("loss")).await.unwrap();

        // Written behind the cache's back: still stale until invalidation.
        seed(&state, &[point("loss", 2, 0.1, 2 * HOUR_US)]);
        let Json(resp) = get_latest(State(state.clone()), metric_params("loss")).await.unwrap();
        assert_eq!(resp.data.unwrap().value, 0.9);

        state.cache.invalidate_metric("r1", "loss").await.unwrap();
        let Json(resp) = get_latest(State(state.clone()), metric_params("loss")).await.unwrap();
        assert_eq!(resp.data.unwrap().value, 0.1);
    }

    #[tokio::test]
    async fn latest_without_data_is_404() {
        let state = test_state();
        let err = get_latest(State(state), metric_params("loss")).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn stats_over_example_run() {
        let state = test_state();
        seed(&state, &[point("loss", 1, 0.9, HOUR_US), point("loss", 2, 0.7, 2 * HOUR_US)]);

        let Json(resp) = get_stats(State(state), metric_params("loss")).await.unwrap();
        let stats = resp.data.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.min, Some(0.7));
        assert_eq!(stats.max, Some(0.9));
        assert!((stats.avg.unwrap() - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn ranged_stats_are_not_cached() {
        let state = test_state();
        seed(&state, &[point("loss", 1, 0.9, HOUR_US)]);
        let params = MetricParams {
            run_id: "r1".into(),
            metric_name: "loss".into(),
            start_time: Some(from_micros(0)),
            end_time: Some(from_micros(10 * HOUR_US)),
        };
        get_stats(State(state.clone()), Ok(Query(params))).await.unwrap();

        let cached: Option<MetricStats> = state
            .cache
            .get(&CacheKey::stats("r1", "loss"))
            .await
            .unwrap();
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn inverted_time_range_is_rejected() {
        let state = test_state();
        let params = MetricParams {
            run_id: "r1".into(),
            metric_name: "loss".into(),
            start_time: Some(from_micros(2 * HOUR_US)),
            end_time: Some(from_micros(HOUR_US)),
        };
        let err = get_stats(State(state), Ok(Query(params))).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn series_step_filter_and_order() {
        let state = test_state();
        seed(
            &state,
            &[
                point("loss", 3, 0.5, 3 * HOUR_US),
                point("loss", 1, 0.9, HOUR_US),
                point("loss", 2, 0.7, 2 * HOUR_US),
            ],
        );
        let params = SeriesParams {
            min_step: Some(2),
            ..series_params()
        };
        let resp = get_series(State(state), Ok(Query(params)))
            .await
            .unwrap()
            .into_response();
        assert_eq!(resp.headers()[RESOLUTION_HEADER], "raw");

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["data"]["count"], 2);
        let steps: Vec<_> = json["data"]["points"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["step"].as_i64().unwrap())
            .collect();
        assert_eq!(steps, vec![2, 3]);
    }

    #[tokio::test]
    async fn rollup_series_needs_a_metric() {
        let state = test_state();
        let params = SeriesParams {
            metric_name: None,
            resolution: Some(SeriesResolution::Rollup),
            ..series_params()
        };
        let err = get_series(State(state), Ok(Query(params))).await.err().unwrap();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn zero_limit_is_rejected() {
        let state = test_state();
        let params = SeriesParams {
            limit: Some(0),
            ..series_params()
        };
        assert!(get_series(State(state), Ok(Query(params))).await.is_err());
    }

    #[tokio::test]
    async fn recent_window_serves_tail_from_cache() {
        let state = test_state();
        let points: Vec<_> = (0..10)
            .map(|i| point("acc", i, i as f64, (i + 1) * HOUR_US))
            .collect();
        seed(&state, &points);

        let recent = |window| {
            get_recent(
                State(state.clone()),
                Ok(Query(RecentParams {
                    run_id: "r1".into(),
                    metric_name: "acc".into(),
                    window: Some(window),
                })),
            )
        };
        let Json(resp) = recent(3).await.unwrap();
        let steps: Vec<_> = resp.data.unwrap().iter().map(|p| p.step).collect();
        assert_eq!(steps, vec![Some(7), Some(8), Some(9)]);

        let hits_before = state.cache.counters().hits;
        let Json(resp) = recent(2).await.unwrap();
        assert_eq!(resp.data.unwrap().len(), 2);
        assert_eq!(state.cache.counters().hits, hits_before + 1);
    }

    #[tokio::test]
    async fn metric_names_and_system_series() {
        let state = test_state();
        seed(&state, &[point("loss", 1, 0.9, HOUR_US), point("acc", 1, 0.1, HOUR_US)]);
        let Json(resp) = get_metric_names(
            State(state.clone()),
            Ok(Query(NamesParams { run_id: "r1".into() })),
        )
        .await
        .unwrap();
        assert_eq!(resp.data.unwrap(), vec!["acc".to_string(), "loss".to_string()]);

        let Json(resp) = get_system_series(
            State(state),
            Ok(Query(RunParams {
                run_id: "r1".into(),
                start_time: None,
                end_time: None,
                limit: None,
            })),
        )
        .await
        .unwrap();
        assert!(resp.data.unwrap().is_empty());
    }
}

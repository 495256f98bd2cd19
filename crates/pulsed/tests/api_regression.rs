//! Router-level regression tests.
//!
//! Drives the full router the daemon serves: ingestion, the query paths,
//! health and self-metrics.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tokio::sync::watch;
use tower::ServiceExt;

use pulse_api::{ApiState, build_router};
use pulse_core::PulseConfig;
use pulse_store::{MetricStore, StoreOptions, StorePool};

fn test_state(store: MetricStore) -> ApiState {
    let config = PulseConfig::default();
    let pool = StorePool::new(store, config.storage.workers);
    let (_tx, rx) = watch::channel(false);
    ApiState::new(pool, config, rx)
}

fn test_router() -> Router {
    let store = MetricStore::open_in_memory(StoreOptions::default()).unwrap();
    build_router(test_state(store))
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(router, req).await
}

async fn post(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    send(router, req).await
}

fn loss_batch() -> Value {
    json!({
        "metrics": [
            { "run_id": "run-1", "metric_name": "loss", "step": 1, "value": 0.9, "time": "2026-03-01T10:00:00Z" },
            { "run_id": "run-1", "metric_name": "loss", "step": 2, "value": 0.7, "time": "2026-03-01T10:00:01Z" },
        ]
    })
}

#[tokio::test]
async fn ingest_then_query_example_run() {
    let router = test_router();

    let (status, body) = post(&router, "/api/v1/metrics/batch", loss_batch()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["accepted"], 2);

    let (status, body) = get(&router, "/api/v1/metrics/series?run_id=run-1&metric_name=loss").await;
    assert_eq!(status, StatusCode::OK);
    let pairs: Vec<(i64, f64)> = body["data"]["points"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| (p["step"].as_i64().unwrap(), p["value"].as_f64().unwrap()))
        .collect();
    assert_eq!(pairs, vec![(1, 0.9), (2, 0.7)]);

    let (status, body) = get(&router, "/api/v1/metrics/latest?run_id=run-1&metric_name=loss").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["step"], 2);
    assert_eq!(body["data"]["value"], 0.7);

    let (status, body) = get(&router, "/api/v1/metrics/stats?run_id=run-1&metric_name=loss").await;
    assert_eq!(status, StatusCode::OK);
    let stats = &body["data"];
    assert_eq!(stats["count"], 2);
    assert_eq!(stats["min"], 0.7);
    assert_eq!(stats["max"], 0.9);
    assert!((stats["avg"].as_f64().unwrap() - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn invalid_point_persists_nothing() {
    let router = test_router();
    let batch = json!({
        "metrics": [
            { "run_id": "run-1", "metric_name": "loss", "value": 0.9 },
            { "run_id": "run-1", "metric_name": "loss", "value": "NaN" },
        ]
    });

    let (status, body) = post(&router, "/api/v1/metrics/batch", batch).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["errors"][0]["index"], 1);
    assert_eq!(body["errors"][0]["field"], "value");

    let (_, body) = get(&router, "/api/v1/metrics/series?run_id=run-1").await;
    assert_eq!(body["data"]["count"], 0);
}

#[tokio::test]
async fn reingest_is_idempotent() {
    let router = test_router();
    post(&router, "/api/v1/metrics/batch", loss_batch()).await;
    let (status, body) = post(&router, "/api/v1/metrics/batch", loss_batch()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["new_points"], 0);

    let (_, body) = get(&router, "/api/v1/metrics/series?run_id=run-1&metric_name=loss").await;
    assert_eq!(body["data"]["count"], 2);
}

#[tokio::test]
async fn resending_untimed_points_is_reported() {
    let router = test_router();
    let batch = json!({
        "metrics": [
            { "run_id": "run-1", "metric_name": "loss", "step": 1, "value": 0.9 },
            { "run_id": "run-1", "metric_name": "loss", "step": 2, "value": 0.7 },
        ]
    });
    let (_, body) = post(&router, "/api/v1/metrics/batch", batch.clone()).await;
    assert_eq!(body["data"]["server_timestamped"], 2);
    let (_, body) = post(&router, "/api/v1/metrics/batch", batch).await;
    assert_eq!(body["data"]["new_points"], 2);

    let (_, body) = get(&router, "/api/v1/metrics/stats?run_id=run-1&metric_name=loss").await;
    assert_eq!(body["data"]["count"], 4);
}

#[tokio::test]
async fn times_closer_than_a_microsecond_are_rejected() {
    let router = test_router();
    let batch = json!({
        "metrics": [
            { "run_id": "run-1", "metric_name": "loss", "value": 1.0, "time": "2026-01-01T00:00:00.123456100Z" },
            { "run_id": "run-1", "metric_name": "loss", "value": 2.0, "time": "2026-01-01T00:00:00.123456789Z" },
        ]
    });
    let (status, body) = post(&router, "/api/v1/metrics/batch", batch).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"][0]["index"], 1);
    assert_eq!(body["errors"][0]["field"], "time");

    let (_, body) = get(&router, "/api/v1/metrics/series?run_id=run-1").await;
    assert_eq!(body["data"]["count"], 0);
}

#[tokio::test]
async fn latest_after_new_batch_is_fresh() {
    let router = test_router();
    post(&router, "/api/v1/metrics/batch", loss_batch()).await;
    get(&router, "/api/v1/metrics/latest?run_id=run-1&metric_name=loss").await;

    let next = json!({
        "metrics": [
            { "run_id": "run-1", "metric_name": "loss", "step": 3, "value": 0.4, "time": "2026-03-01T10:00:02Z" },
        ]
    });
    post(&router, "/api/v1/metrics/batch", next).await;

    let (_, body) = get(&router, "/api/v1/metrics/latest?run_id=run-1&metric_name=loss").await;
    assert_eq!(body["data"]["step"], 3);
}

#[tokio::test]
async fn latest_for_unknown_metric_is_404() {
    let router = test_router();
    let (status, body) = get(&router, "/api/v1/metrics/latest?run_id=run-1&metric_name=loss").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn bad_query_parameters_are_400() {
    let router = test_router();
    let (status, _) = get(&router, "/api/v1/metrics/series?run_id=run-1&limit=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(
        &router,
        "/api/v1/metrics/series?run_id=run-1&start_time=2026-03-02T00:00:00Z&end_time=2026-03-01T00:00:00Z",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_body_is_400() {
    let router = test_router();
    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/metrics/batch")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn names_and_system_metrics() {
    let router = test_router();
    post(&router, "/api/v1/metrics/batch", loss_batch()).await;
    let (status, _) = post(
        &router,
        "/api/v1/system-metrics/batch",
        json!({ "metrics": [{ "run_id": "run-1", "gpu_utilization": 87.5, "time": "2026-03-01T10:00:00Z" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = get(&router, "/api/v1/metrics/names?run_id=run-1").await;
    assert_eq!(body["data"], json!(["loss"]));

    let (_, body) = get(&router, "/api/v1/system-metrics/series?run_id=run-1").await;
    assert_eq!(body["data"][0]["gpu_utilization"], 87.5);
}

#[tokio::test]
async fn healthz_and_metrics() {
    let router = test_router();
    post(&router, "/api/v1/metrics/batch", loss_batch()).await;

    let (status, body) = get(&router, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");

    let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("pulse_batches_accepted_total 1\n"));
    assert!(text.contains("pulse_points_ingested_total 2\n"));
    assert!(text.contains("pulse_requests_total{route=\"/api/v1/metrics/batch\"} 1"));
}

#[tokio::test]
async fn data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pulse.redb");

    {
        let store = MetricStore::open(&path, StoreOptions::default()).unwrap();
        let router = build_router(test_state(store));
        let (status, _) = post(&router, "/api/v1/metrics/batch", loss_batch()).await;
        assert_eq!(status, StatusCode::OK);
    }

    let store = MetricStore::open(&path, StoreOptions::default()).unwrap();
    let router = build_router(test_state(store));
    let (_, body) = get(&router, "/api/v1/metrics/stats?run_id=run-1&metric_name=loss").await;
    assert_eq!(body["data"]["count"], 2);
}

//! HTTP-level tests for the receiver router
//!
//! Each test builds its own storage roots and stats registry, then drives
//! the axum router in-process with `oneshot`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine};
use edge_receiver::config::ApiConfig;
use edge_receiver::{
    create_router, AppState, Base64JsonDecoder, IngestPipeline, IngestResponse, StatsRegistry,
    StatusResponse,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestServer {
    _dir: TempDir,
    image_dir: PathBuf,
    meta_dir: PathBuf,
    stats: Arc<StatsRegistry>,
    router: Router,
}

fn test_server(legacy_always_ok: bool) -> TestServer {
    test_server_with(ApiConfig {
        legacy_always_ok,
        ..ApiConfig::default()
    })
}

fn test_server_with(config: ApiConfig) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let image_dir = dir.path().join("image");
    let meta_dir = dir.path().join("meta");
    let stats = Arc::new(StatsRegistry::new());

    let pipeline = Arc::new(IngestPipeline::new(
        image_dir.clone(),
        meta_dir.clone(),
        Some(Arc::new(Base64JsonDecoder)),
        stats.clone(),
    ));

    let state = AppState {
        pipeline,
        stats: stats.clone(),
        image_dir: image_dir.clone(),
        meta_dir: meta_dir.clone(),
        legacy_always_ok: config.legacy_always_ok,
    };

    TestServer {
        _dir: dir,
        image_dir,
        meta_dir,
        stats,
        router: create_router(state, &config),
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn put(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .body(body.into())
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("host", "receiver.local:8080")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_put_image_stores_exact_bytes() {
    let server = test_server(false);
    let payload = b"\x89PNG\r\n\x1a\n\x00\x00binary".to_vec();

    let (status, body) = send(
        &server.router,
        put("/image/dev1/2024/frame001.jpg", payload.clone()),
    )
    .await;

    let expected = server.image_dir.join("dev1/2024/frame001.jpg");
    assert_eq!(status, StatusCode::OK);

    let response: IngestResponse = serde_json::from_value(body).unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.file_path, Some(expected.display().to_string()));
    assert!(response.error.is_none());
    assert_eq!(std::fs::read(&expected).unwrap(), payload);
}

#[tokio::test]
async fn test_put_meta_decodes_inference() {
    let server = test_server(false);
    let encoded = STANDARD.encode(r#"{"x":1}"#);
    let record = json!({"DeviceID": "dev1", "Inferences": [{"O": encoded}]});

    let (status, body) = send(
        &server.router,
        put("/meta/dev1/2024/result.txt", record.to_string()),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], 200);

    let stored: Value = serde_json::from_slice(
        &std::fs::read(server.meta_dir.join("dev1/2024/result.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(stored["DeviceID"], "dev1");
    assert_eq!(stored["Inferences"][0]["O"], encoded);
    assert_eq!(stored["DeserializedData"], json!({"x": 1}));
}

#[tokio::test]
async fn test_put_meta_invalid_payload_writes_nothing() {
    let server = test_server(false);
    let record = json!({"DeviceID": "dev1", "Inferences": [{"O": "%%%not-base64%%%"}]});

    let (status, body) = send(
        &server.router,
        put("/meta/dev1/2024/result.txt", record.to_string()),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["status"], 422);
    assert!(body["error"].is_string());
    assert!(body["process_time_ms"].is_u64());
    assert!(!server.meta_dir.join("dev1/2024/result.json").exists());
    assert_eq!(server.stats.snapshot().errors, 1);
}

#[tokio::test]
async fn test_put_meta_malformed_json() {
    let server = test_server(false);

    let (status, body) = send(&server.router, put("/meta/dev1/result.txt", "{oops")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);
    assert_eq!(server.stats.snapshot().errors, 1);
}

#[tokio::test]
async fn test_encoded_traversal_is_rejected() {
    let server = test_server(false);

    let (status, body) = send(
        &server.router,
        put("/image/%2e%2e/%2e%2e/etc/passed", "x"),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);
    assert!(!server.image_dir.exists());
    assert!(!server.image_dir.parent().unwrap().join("etc").exists());
}

#[tokio::test]
async fn test_oversized_body_is_counted_json_failure() {
    let server = test_server_with(ApiConfig {
        max_body_bytes: 10,
        ..ApiConfig::default()
    });

    let (status, body) = send(&server.router, put("/image/dev1/big.jpg", vec![0u8; 100])).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["status"], 413);
    assert!(body["error"].is_string());
    assert!(body["process_time_ms"].is_u64());
    assert!(!server.image_dir.join("dev1/big.jpg").exists());
    assert_eq!(server.stats.snapshot().errors, 1);
}

#[tokio::test]
async fn test_invalid_percent_encoding_is_counted_json_failure() {
    let server = test_server(false);

    let (status, body) = send(&server.router, put("/image/dev1/%FF.jpg", "x")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);

    let (status, body) = send(&server.router, put("/meta/dev1/%FF.txt", "{}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);

    assert!(!server.image_dir.exists());
    assert!(!server.meta_dir.exists());
    assert_eq!(server.stats.snapshot().errors, 2);
}

#[tokio::test]
async fn test_bare_prefix_is_an_empty_path() {
    let server = test_server(false);

    let (status, body) = send(&server.router, put("/image/", "x")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);

    let (status, body) = send(&server.router, put("/meta/", "{}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);

    assert_eq!(server.stats.snapshot().errors, 2);
}

#[tokio::test]
async fn test_legacy_mode_applies_to_rejected_requests() {
    let server = test_server_with(ApiConfig {
        legacy_always_ok: true,
        max_body_bytes: 10,
        ..ApiConfig::default()
    });

    let (status, body) = send(&server.router, put("/image/dev1/big.jpg", vec![0u8; 100])).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], 413);
    assert_eq!(server.stats.snapshot().errors, 1);
}

#[tokio::test]
async fn test_legacy_mode_keeps_transport_ok() {
    let server = test_server(true);

    let (status, body) = send(&server.router, put("/meta/dev1/result.txt", "not json")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], 400);
    assert!(body.get("file_path").is_none());
}

#[tokio::test]
async fn test_status_reports_counters_and_usage() {
    let server = test_server(false);

    send(&server.router, put("/image/dev1/a.jpg", vec![0u8; 100])).await;
    send(&server.router, put("/image/dev1/b.jpg", vec![0u8; 50])).await;
    send(&server.router, put("/meta/dev1/r.txt", r#"{"DeviceID":"dev1"}"#)).await;
    send(&server.router, put("/image/dev1/../x.jpg", "x")).await;

    let (status, body) = send(&server.router, get("/status")).await;
    assert_eq!(status, StatusCode::OK);

    let report: StatusResponse = serde_json::from_value(body).unwrap();
    assert_eq!(report.status, "running");
    assert_eq!(report.images_received, 2);
    assert_eq!(report.meta_received, 1);
    assert_eq!(report.errors, 1);
    assert_eq!(report.uptime.len(), 8);
    assert_eq!(report.disk_usage_bytes.images, 150);
    assert_eq!(
        report.disk_usage_bytes.meta,
        r#"{"DeviceID":"dev1"}"#.len() as u64
    );
    assert_eq!(
        report.disk_usage_bytes.total,
        report.disk_usage_bytes.images + report.disk_usage_bytes.meta
    );
    assert_eq!(report.image_dir, server.image_dir.display().to_string());
}

#[tokio::test]
async fn test_health() {
    let server = test_server(false);

    let (status, body) = send(&server.router, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_redirect_https() {
    let server = test_server(false);

    let (status, body) = send(&server.router, get("/redirect-https?a=b")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["redirect"],
        "https://receiver.local:8080/redirect-https?a=b"
    );
}

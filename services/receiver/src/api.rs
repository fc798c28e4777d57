use crate::config::ApiConfig;
use crate::disk_usage::{self, DiskUsage};
use crate::path_resolver::IngestKind;
use crate::pipeline::{IngestFailure, IngestPipeline, Stored};
use crate::stats::{format_uptime, StatsRegistry};
use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::{BytesRejection, PathRejection, QueryRejection},
        DefaultBodyLimit, OriginalUri, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, Span};
use uuid::Uuid;

const DEVICE_ID_HEADER: &str = "x-device-id";
const DEVICE_ID_QUERY: &str = "DeviceID";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub stats: Arc<StatsRegistry>,
    pub image_dir: PathBuf,
    pub meta_dir: PathBuf,
    /// Keep transport status 200 on failed uploads
    pub legacy_always_ok: bool,
}

/// Body of every upload response
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct IngestResponse {
    /// HTTP-style outcome code
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub process_time_ms: u64,
}

impl IngestResponse {
    fn stored(stored: &Stored) -> Self {
        Self {
            status: StatusCode::OK.as_u16(),
            file_path: Some(stored.file_path.display().to_string()),
            error: None,
            process_time_ms: stored.elapsed_ms,
        }
    }

    fn failed(failure: &IngestFailure) -> Self {
        Self {
            status: failure.error.status_code(),
            file_path: None,
            error: Some(failure.error.to_string()),
            process_time_ms: failure.elapsed_ms,
        }
    }
}

/// Service status
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    /// `HH:MM:SS`
    pub uptime: String,
    pub uptime_seconds: u64,
    pub images_received: u64,
    pub meta_received: u64,
    pub errors: u64,
    pub image_dir: String,
    pub meta_dir: String,
    pub disk_usage_bytes: DiskUsageResponse,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DiskUsageResponse {
    pub images: u64,
    pub meta: u64,
    pub total: u64,
}

impl From<DiskUsage> for DiskUsageResponse {
    fn from(u: DiskUsage) -> Self {
        Self {
            images: u.images,
            meta: u.meta,
            total: u.total,
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(AnyOrigin)
                .allow_methods(AnyOrigin)
                .allow_headers(AnyOrigin)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(AnyOrigin)
                .allow_headers(AnyOrigin)
        }
    } else {
        CorsLayer::new()
    };

    let catch_panic = CatchPanicLayer::custom(panic_handler(state.stats.clone()));

    // The bare prefixes carry no wildcard and fail as empty paths
    Router::new()
        .route("/image/", put(put_image))
        .route("/image/*path", put(put_image))
        .route("/meta/", put(put_meta))
        .route("/meta/*path", put(put_meta))
        .route("/status", get(get_status))
        .route("/health", get(health_check))
        .route("/redirect-https", get(redirect_https))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(catch_panic)
        .layer(cors)
        .with_state(state)
}

/// Receive an image
#[instrument(
    skip(state, path, query, headers, body),
    fields(request_id = %Uuid::new_v4(), device_id = tracing::field::Empty)
)]
async fn put_image(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let (path, body) = match upload_parts(path, body) {
        Ok(parts) => parts,
        Err(rejection) => return rejected(&state, IngestKind::Image, rejection),
    };

    let query = query.map(|Query(q)| q).unwrap_or_default();
    let device_id = image_device_id(&path, &headers, &query);
    Span::current().record("device_id", device_id.as_str());

    let result = state.pipeline.handle_image(&path, body).await;
    ingest_response(&state, result)
}

/// Receive an inference metadata record
#[instrument(skip(state, path, body), fields(request_id = %Uuid::new_v4()))]
async fn put_meta(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let (path, body) = match upload_parts(path, body) {
        Ok(parts) => parts,
        Err(rejection) => return rejected(&state, IngestKind::Metadata, rejection),
    };

    let result = state.pipeline.handle_metadata(&path, body).await;
    ingest_response(&state, result)
}

/// Path and body of an upload, or the status and text axum rejected it with
fn upload_parts(
    path: Result<Path<String>, PathRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Result<(String, Bytes), (StatusCode, String)> {
    let path = match path {
        Ok(Path(path)) => path,
        Err(PathRejection::MissingPathParams(_)) => String::new(),
        Err(rejection) => return Err((rejection.status(), rejection.body_text())),
    };
    let body = body.map_err(|rejection| (rejection.status(), rejection.body_text()))?;
    Ok((path, body))
}

/// Answer a request axum refused before it reached the pipeline
fn rejected(
    state: &AppState,
    kind: IngestKind,
    (status, detail): (StatusCode, String),
) -> Response {
    state.stats.record_error();
    error!(
        kind = kind.as_str(),
        status = status.as_u16(),
        error = %detail,
        "Request rejected"
    );

    failure_response(
        state,
        IngestResponse {
            status: status.as_u16(),
            file_path: None,
            error: Some(detail),
            process_time_ms: 0,
        },
    )
}

fn ingest_response(state: &AppState, result: Result<Stored, IngestFailure>) -> Response {
    match result {
        Ok(stored) => (StatusCode::OK, Json(IngestResponse::stored(&stored))).into_response(),
        Err(failure) => failure_response(state, IngestResponse::failed(&failure)),
    }
}

fn failure_response(state: &AppState, body: IngestResponse) -> Response {
    let transport = if state.legacy_always_ok {
        StatusCode::OK
    } else {
        StatusCode::from_u16(body.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    };
    (transport, Json(body)).into_response()
}

/// Device attribution for image uploads
///
/// The first segment of a multi-segment path names the device. Single
/// segment uploads fall back to the `X-Device-ID` header, then the
/// `DeviceID` query parameter.
pub fn image_device_id(
    path: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> String {
    let mut segments = path.split('/');
    if let (Some(first), Some(_)) = (segments.next(), segments.next()) {
        return first.to_string();
    }

    if let Some(device) = query.get(DEVICE_ID_QUERY) {
        return device.clone();
    }

    headers
        .get(DEVICE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

/// Counters, uptime and stored bytes
async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.stats.snapshot();
    let usage = disk_usage::measure(state.image_dir.clone(), state.meta_dir.clone()).await;

    Json(StatusResponse {
        status: "running".to_string(),
        uptime: format_uptime(snapshot.uptime_seconds),
        uptime_seconds: snapshot.uptime_seconds,
        images_received: snapshot.images_received,
        meta_received: snapshot.meta_received,
        errors: snapshot.errors,
        image_dir: state.image_dir.display().to_string(),
        meta_dir: state.meta_dir.display().to_string(),
        disk_usage_bytes: usage.into(),
    })
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Echo the request URL with an https scheme
async fn redirect_https(headers: HeaderMap, OriginalUri(uri): OriginalUri) -> impl IntoResponse {
    let url = request_url(&headers, &uri);
    Json(serde_json::json!({ "redirect": to_https(&url) }))
}

fn request_url(headers: &HeaderMap, uri: &Uri) -> String {
    if uri.scheme().is_some() {
        return uri.to_string();
    }
    match headers.get(header::HOST).and_then(|h| h.to_str().ok()) {
        Some(host) => format!("http://{}{}", host, uri),
        None => uri.to_string(),
    }
}

fn to_https(url: &str) -> String {
    match url.strip_prefix("http://") {
        Some(rest) => format!("https://{}", rest),
        None => url.to_string(),
    }
}

/// Turn a handler panic into a counted JSON 500
fn panic_handler(
    stats: Arc<StatsRegistry>,
) -> impl FnMut(Box<dyn Any + Send + 'static>) -> Response + Clone {
    move |err| {
        stats.record_error();
        panic_response(err)
    }
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    error!(panic = %detail, "Handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            "error": "Internal server error",
        })),
    )
        .into_response()
}

/// Start the receiver API server
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting receiver API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn};

use crate::config::CaptureConfig;
use crate::demux::BOUNDARY;
use crate::errors::TimelapseError;
use crate::preview::open_preview;
use crate::session::SessionStatus;
use crate::utils::redact_url;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u16>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            status: "success".to_string(),
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(message: &str, code: u16) -> ApiResponse<()> {
        ApiResponse {
            status: "error".to_string(),
            data: None,
            error: Some(message.to_string()),
            code: Some(code),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageData {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct KillData {
    pub killed: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub url: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/start", post(start_capture_handler))
        .route("/api/stop", post(stop_capture_handler))
        .route("/api/status", get(status_handler))
        .route("/api/stream", get(stream_handler))
        .route("/api/engine/kill", post(kill_engines_handler))
        .route("/api/health", get(health_handler))
        .with_state(state)
}

fn status_code_for(err: &TimelapseError) -> StatusCode {
    match err {
        TimelapseError::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
        TimelapseError::AlreadyRunning | TimelapseError::NoActiveSession => StatusCode::CONFLICT,
        TimelapseError::EngineUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        TimelapseError::SourceUnreachable { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &TimelapseError) -> Response {
    let status = status_code_for(err);
    (status, Json(ApiResponse::<()>::error(&err.to_string(), status.as_u16()))).into_response()
}

fn message_response(message: &str) -> Response {
    Json(ApiResponse::success(MessageData {
        message: message.to_string(),
    }))
    .into_response()
}

pub async fn start_capture_handler(
    State(state): State<AppState>,
    payload: Result<Json<CaptureConfig>, JsonRejection>,
) -> Response {
    let Json(config) = match payload {
        Ok(config) => config,
        Err(rejection) => {
            return error_response(&TimelapseError::invalid_config(rejection.body_text()));
        }
    };

    let source = redact_url(&config.url);
    match state.sessions.start(config).await {
        Ok(()) => message_response("Timelapse capture started"),
        Err(e) => {
            warn!("Failed to start capture from {}: {}", source, e);
            error_response(&e)
        }
    }
}

pub async fn stop_capture_handler(State(state): State<AppState>) -> Response {
    match state.sessions.stop().await {
        Ok(()) => message_response("Timelapse capture stopped, generating video"),
        Err(e) => error_response(&e),
    }
}

pub async fn status_handler(State(state): State<AppState>) -> Json<SessionStatus> {
    trace!("Status requested");
    Json(state.sessions.status().await)
}

pub async fn stream_handler(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let url = match query
        .url
        .filter(|u| !u.trim().is_empty())
        .or_else(|| state.preview.default_url.clone())
    {
        Some(url) => url,
        None => {
            return error_response(&TimelapseError::invalid_config("url query parameter is required"));
        }
    };

    let chunks = match open_preview(state.engine.as_ref(), &url, &state.preview).await {
        Ok(chunks) => chunks,
        Err(e) => {
            warn!("Failed to open preview of {}: {}", redact_url(&url), e);
            return error_response(&e);
        }
    };

    (
        [
            (header::CONTENT_TYPE, format!("multipart/x-mixed-replace; boundary={}", BOUNDARY)),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate".to_string()),
            (header::PRAGMA, "no-cache".to_string()),
        ],
        Body::from_stream(chunks),
    )
        .into_response()
}

pub async fn kill_engines_handler(State(state): State<AppState>) -> Response {
    for process in state.sessions.engine_processes() {
        info!("Killing engine process '{}' (pid {:?})", process.label, process.pid);
    }
    let killed = state.sessions.kill_all_engines();
    Json(ApiResponse::success(KillData { killed })).into_response()
}

pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

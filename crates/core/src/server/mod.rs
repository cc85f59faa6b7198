use std::path::Path as StdPath;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use crate::config::AppConfig;
use crate::error::RenderError;
use crate::job::{JobSnapshot, JobStatus, Scene};
use crate::service::{RenderService, ServiceHealth};

#[derive(Clone)]
pub struct AppState {
    service: RenderService,
    body_limit_bytes: usize,
}

impl AppState {
    pub fn new(service: RenderService, body_limit_bytes: usize) -> Self {
        Self {
            service,
            body_limit_bytes,
        }
    }

    pub fn service(&self) -> &RenderService {
        &self.service
    }
}

pub fn app_state_with_config(config: &AppConfig, data_dir: &StdPath) -> AppState {
    AppState::new(
        RenderService::from_config(config, data_dir),
        config.server.body_limit_bytes,
    )
}

/// Accepts both camelCase and snake_case field spellings.
#[derive(Debug, Deserialize)]
pub struct RenderRequest {
    #[serde(default, alias = "job_id")]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub scenes: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct RenderAccepted {
    pub status: JobStatus,
    pub id: String,
    pub duplicate: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub id: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub artifact_path: Option<String>,
    /// Jobs ahead of this one; only present while QUEUED.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(flatten)]
    pub service: ServiceHealth,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl From<JobSnapshot> for JobStatusResponse {
    fn from(job: JobSnapshot) -> Self {
        Self {
            id: job.id,
            status: job.status,
            error: job.error,
            artifact_path: job
                .artifact_path
                .map(|path| path.to_string_lossy().into_owned()),
            queue_position: None,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let body_limit = state.body_limit_bytes;

    Router::new()
        .route("/", get(root))
        .route("/ping", get(ping))
        .route("/echo", post(echo))
        .route("/health", get(health))
        .route("/render", post(submit_render))
        .route("/status/{id}", get(job_status))
        .route("/download/{id}", get(download_artifact))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> &'static str {
    "OK"
}

async fn ping() -> &'static str {
    "pong"
}

async fn echo(Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true, "body": body }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: state.service.health(),
    })
}

async fn submit_render(
    State(state): State<AppState>,
    payload: Result<Json<RenderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RenderAccepted>), AppError> {
    let Json(payload) = payload
        .map_err(|rejection| AppError::Rejected(rejection.status(), rejection.body_text()))?;

    let id = payload.id.as_ref().map(json_text).unwrap_or_default();
    let scenes = parse_scenes(payload.scenes.as_ref());

    let outcome = state.service.submit(&id, scenes)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(RenderAccepted {
            status: outcome.status,
            id: outcome.id,
            duplicate: outcome.duplicate,
        }),
    ))
}

async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusResponse>, AppError> {
    let snapshot = state.service.status(&id)?;
    let queued = snapshot.status == JobStatus::Queued;
    let mut response = JobStatusResponse::from(snapshot);
    if queued {
        response.queue_position = state.service.queue_position(&id);
    }
    Ok(Json(response))
}

async fn download_artifact(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let artifact = state.service.retrieve(&id).await?;

    let file = tokio::fs::File::open(&artifact.path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::from(RenderError::MissingArtifact {
                id: id.clone(),
                path: artifact.path.clone(),
            })
        } else {
            AppError::Internal(format!("failed to open artifact: {e}"))
        }
    })?;

    let mime = mime_guess::from_path(&artifact.path).first_or_octet_stream();
    let disposition = format!(
        "attachment; filename=\"{}\"",
        artifact.file_name.replace('"', "")
    );

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::CONTENT_LENGTH, artifact.size.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Non-array `scenes` parse as empty so the service reports the same
/// "No scenes provided" error as for `[]`.
fn parse_scenes(value: Option<&serde_json::Value>) -> Vec<Scene> {
    let Some(items) = value.and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .map(|item| {
            let text = item
                .get("onscreenText")
                .or_else(|| item.get("onscreen_text"))
                .map(json_text)
                .unwrap_or_default();
            Scene::new(text)
        })
        .collect()
}

/// Strings as-is, `null` as empty, other values in their JSON form.
fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug)]
pub enum AppError {
    /// An extractor rejection, keeping the status it chose.
    Rejected(StatusCode, String),
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Rejected(status, msg) => (status, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<RenderError> for AppError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::Validation(msg) => AppError::BadRequest(msg),
            RenderError::NotFound { .. } => AppError::NotFound(err.to_string()),
            RenderError::NotReady { .. } => AppError::BadRequest(err.to_string()),
            RenderError::MissingArtifact { ref id, ref path } => {
                warn!(job_id = %id, path = %path.display(), "DONE job has no artifact on disk");
                AppError::NotFound(err.to_string())
            }
            RenderError::Io(ref e) => {
                error!(error = %e, "Render service I/O failure");
                AppError::Internal(err.to_string())
            }
        }
    }
}

//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/sources` | Submit a source and start a generation request |
//! | `GET`  | `/requests` | Recent requests |
//! | `GET`  | `/requests/{id}` | Request status |
//! | `POST` | `/requests/{id}/retry` | Resume a failed request |
//! | `POST` | `/requests/{id}/cancel` | Cancel a request |
//! | `GET`  | `/documents/{id}/artifacts` | Artifacts generated for a document |
//! | `POST` | `/documents/{id}/regenerate` | Re-master a document's quiz |
//! | `POST` | `/sync` | Replay the offline write queue |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "request not found: 42" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use study_harness_core::models::{
    ArtifactType, Difficulty, GenerationOptions, GenerationRequest, SourceKind, StudyArtifact,
};
use study_harness_core::sync::DrainReport;

use crate::config::Config;
use crate::intake;
use crate::orchestrator::{Orchestrator, PipelineError};

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
}

/// Build the router. Split from [`run_server`] so tests can bind their own listener.
pub fn router(orchestrator: Orchestrator) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/sources", post(handle_submit))
        .route("/requests", get(handle_list_requests))
        .route("/requests/{id}", get(handle_status))
        .route("/requests/{id}/retry", post(handle_retry))
        .route("/requests/{id}/cancel", post(handle_cancel))
        .route("/documents/{id}/artifacts", get(handle_artifacts))
        .route("/documents/{id}/regenerate", post(handle_regenerate))
        .route("/sync", post(handle_sync))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(AppState { orchestrator })
}

/// Serve the API on `[server].bind` and drain the sync queue in the
/// background every `remote.sync_interval_secs`.
pub async fn run_server(config: &Config, orchestrator: Orchestrator) -> anyhow::Result<()> {
    let interval = Duration::from_secs(config.remote.sync_interval_secs);
    tokio::spawn(crate::sync_cmd::drain_loop(orchestrator.clone(), interval));

    let app = router(orchestrator);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "study harness API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let (status, code) = match &err {
            PipelineError::RequestNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            PipelineError::DocumentNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            PipelineError::InvalidState(_) => (StatusCode::CONFLICT, "conflict"),
            PipelineError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            warn!(error = %err, "request handling failed");
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /sources ============

/// Either `url`, or `content_base64` with a `filename`.
#[derive(Deserialize)]
struct SubmitBody {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    content_base64: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    artifact_type: String,
    #[serde(default)]
    item_count: Option<u32>,
    #[serde(default)]
    difficulty: Option<String>,
}

#[derive(Serialize)]
struct SubmitResponse {
    request_id: String,
    document_id: String,
}

async fn handle_submit(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let artifact_type: ArtifactType = body.artifact_type.parse().map_err(bad_request)?;
    let options = generation_options(body.item_count, body.difficulty.as_deref())?;
    let kind = match &body.kind {
        Some(k) => Some(k.parse::<SourceKind>().map_err(bad_request)?),
        None => None,
    };

    let (document, payload) = match (body.url, body.content_base64) {
        (Some(url), None) => intake::from_url(&url),
        (None, Some(content)) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(content.trim())
                .map_err(|e| bad_request(format!("content_base64 is not valid base64: {}", e)))?;
            let name = body.filename.unwrap_or_else(|| "upload".to_string());
            intake::from_upload(&name, bytes, kind)
        }
        _ => return Err(bad_request("provide exactly one of url or content_base64")),
    }
    .map_err(|e| bad_request(e.to_string()))?;

    let document_id = document.id.clone();
    let request_id = state
        .orchestrator
        .submit_source(document, payload, artifact_type, options)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            request_id,
            document_id,
        }),
    ))
}

fn generation_options(item_count: Option<u32>, difficulty: Option<&str>) -> Result<GenerationOptions, AppError> {
    let mut options = GenerationOptions::default();
    if let Some(count) = item_count {
        if count == 0 {
            return Err(bad_request("item_count must be > 0"));
        }
        options.item_count = count;
    }
    if let Some(difficulty) = difficulty {
        options.difficulty = difficulty.parse::<Difficulty>().map_err(bad_request)?;
    }
    Ok(options)
}

// ============ POST /documents/{id}/regenerate ============

#[derive(Deserialize, Default)]
struct RegenerateBody {
    #[serde(default)]
    item_count: Option<u32>,
    #[serde(default)]
    difficulty: Option<String>,
}

async fn handle_regenerate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RegenerateBody>>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let options = generation_options(body.item_count, body.difficulty.as_deref())?;
    let request_id = state.orchestrator.submit_regeneration(&id, options).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            request_id,
            document_id: id,
        }),
    ))
}

// ============ Requests ============

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    limit: Option<usize>,
}

async fn handle_list_requests(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<GenerationRequest>>, AppError> {
    let limit = params.limit.unwrap_or(20).min(200);
    Ok(Json(state.orchestrator.list_requests(limit).await?))
}

async fn handle_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<GenerationRequest>, AppError> {
    Ok(Json(state.orchestrator.request_status(&id).await?))
}

async fn handle_retry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<GenerationRequest>), AppError> {
    let resumed = state.orchestrator.spawn_retry(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(resumed)))
}

async fn handle_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<GenerationRequest>, AppError> {
    Ok(Json(state.orchestrator.cancel(&id).await?))
}

// ============ Artifacts and sync ============

async fn handle_artifacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<StudyArtifact>>, AppError> {
    Ok(Json(state.orchestrator.list_artifacts(&id).await?))
}

#[derive(Serialize)]
struct SyncResponse {
    synced: usize,
    conflicts: usize,
    still_pending: usize,
    blocked_documents: Vec<String>,
}

impl From<DrainReport> for SyncResponse {
    fn from(r: DrainReport) -> Self {
        Self {
            synced: r.synced,
            conflicts: r.conflicts,
            still_pending: r.still_pending,
            blocked_documents: r.blocked_documents,
        }
    }
}

async fn handle_sync(State(state): State<AppState>) -> Result<Json<SyncResponse>, AppError> {
    Ok(Json(state.orchestrator.drain().await?.into()))
}


//! HTTP transport for sync sessions, retention settings and authored
//! documents.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness, version and whether a run is active |
//! | `POST` | `/sync/{step}` | Start a step and stream its progress as text lines |
//! | `GET`  | `/sync/status` | Active run and the last terminal line |
//! | `POST` | `/sync/cancel` | Cancel the active run |
//! | `GET`/`PUT` | `/settings/versions` | Read or flip the retention toggle |
//! | `POST` | `/versions/purge` | Delete expired snapshots now |
//! | `POST` | `/versions/{id}/restore` | Restore a snapshot onto its document |
//! | `POST` | `/documents/{entity}` | Create an authored document |
//! | `PUT`  | `/documents/{entity}/{slug}` | Edit a document |
//! | `GET`  | `/documents/{entity}/{slug}/versions` | Snapshots, newest first |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "already_running", "message": "a sync run is already running (...)" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `already_running`
//! (409), `conflict` (409), `internal` (500).
//!
//! The body of `POST /sync/{step}` is `text/plain`, one line per event,
//! ending with the `done status=...` line. Closing the connection early does
//! not cancel the run; use `POST /sync/cancel`.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::editor::{DocumentEdit, Editor};
use crate::error::{EditError, RunnerError};
use crate::models::{Document, EntityType, VersionSnapshot};
use crate::pipeline::{PipelineContext, Step};
use crate::runner::{SyncRun, SyncRunner};

#[derive(Clone)]
struct AppState {
    runner: SyncRunner,
}

impl AppState {
    fn ctx(&self) -> &PipelineContext {
        self.runner.context()
    }
}

/// Starts the HTTP server on `[server].bind` and the periodic snapshot
/// purge. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let ctx = PipelineContext::open(config).await?;
    let runner = SyncRunner::new(ctx);

    spawn_purge_task(
        runner.clone(),
        Duration::from_secs(config.versions.purge_interval_secs),
    );

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "server listening");
    println!("csync server listening on http://{}", bind_addr);
    axum::serve(listener, router(runner)).await?;

    Ok(())
}

/// All routes over a shared runner. Exposed so callers can mount it on their
/// own listener.
pub fn router(runner: SyncRunner) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/sync/status", get(handle_sync_status))
        .route("/sync/cancel", post(handle_sync_cancel))
        .route("/sync/{step}", post(handle_sync_start))
        .route(
            "/settings/versions",
            get(handle_get_versions_setting).put(handle_put_versions_setting),
        )
        .route("/versions/purge", post(handle_purge))
        .route("/versions/{id}/restore", post(handle_restore))
        .route("/documents/{entity}", post(handle_create_document))
        .route("/documents/{entity}/{slug}", put(handle_edit_document))
        .route(
            "/documents/{entity}/{slug}/versions",
            get(handle_list_versions),
        )
        .layer(cors)
        .with_state(AppState { runner })
}

fn spawn_purge_task(runner: SyncRunner, every: Duration) {
    if every.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            match runner.context().retention.purge(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(deleted = n, "purged expired version snapshots"),
                Err(e) => tracing::warn!(error = %e, "scheduled snapshot purge failed"),
            }
        }
    });
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

fn internal(err: impl std::fmt::Display) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: err.to_string(),
    }
}

impl From<RunnerError> for AppError {
    fn from(err: RunnerError) -> Self {
        AppError {
            status: StatusCode::CONFLICT,
            code: "already_running",
            message: err.to_string(),
        }
    }
}

impl From<EditError> for AppError {
    fn from(err: EditError) -> Self {
        let (status, code) = match &err {
            EditError::NotFound { .. } | EditError::SnapshotNotFound(_) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            EditError::AlreadyExists { .. } => (StatusCode::CONFLICT, "conflict"),
            EditError::Invalid(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            EditError::Storage(_) => return internal(&err),
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

fn parse_entity(raw: &str) -> Result<EntityType, AppError> {
    raw.parse().map_err(|e: anyhow::Error| bad_request(e.to_string()))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    busy: bool,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        busy: state.runner.health().busy,
    })
}

// ============ /sync ============

async fn handle_sync_start(
    State(state): State<AppState>,
    Path(step): Path<String>,
) -> Result<Response, AppError> {
    let step: Step = step.parse().map_err(|e: anyhow::Error| bad_request(e.to_string()))?;
    let session = state.runner.start(step)?;

    let lines = session
        .into_stream()
        .map(|line| Ok::<_, Infallible>(format!("{}\n", line)));

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(lines),
    )
        .into_response())
}

#[derive(Serialize)]
struct SyncStatusResponse {
    current: Option<SyncRun>,
    last_run: Option<String>,
}

async fn handle_sync_status(State(state): State<AppState>) -> Json<SyncStatusResponse> {
    Json(SyncStatusResponse {
        current: state.runner.current(),
        last_run: state.runner.last_run(),
    })
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn handle_sync_cancel(State(state): State<AppState>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.runner.cancel(),
    })
}

// ============ /settings/versions ============

#[derive(Serialize, Deserialize)]
struct VersionsSetting {
    enabled: bool,
}

async fn handle_get_versions_setting(State(state): State<AppState>) -> Json<VersionsSetting> {
    Json(VersionsSetting {
        enabled: state.ctx().retention.is_enabled(),
    })
}

async fn handle_put_versions_setting(
    State(state): State<AppState>,
    Json(body): Json<VersionsSetting>,
) -> Json<VersionsSetting> {
    state.ctx().retention.set_enabled(body.enabled);
    Json(VersionsSetting {
        enabled: state.ctx().retention.is_enabled(),
    })
}

// ============ /versions ============

#[derive(Serialize)]
struct PurgeResponse {
    deleted: u64,
}

async fn handle_purge(State(state): State<AppState>) -> Result<Json<PurgeResponse>, AppError> {
    let deleted = state
        .ctx()
        .retention
        .purge(Utc::now())
        .await
        .map_err(internal)?;
    Ok(Json(PurgeResponse { deleted }))
}

async fn handle_restore(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Document>, AppError> {
    let ctx = state.ctx();
    let doc = Editor::new(ctx.store.as_ref(), &ctx.retention)
        .restore_snapshot(&id)
        .await?;
    Ok(Json(doc))
}

// ============ /documents ============

async fn handle_create_document(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Json(doc): Json<Document>,
) -> Result<(StatusCode, Json<Document>), AppError> {
    let entity = parse_entity(&entity)?;
    let ctx = state.ctx();
    let created = Editor::new(ctx.store.as_ref(), &ctx.retention)
        .create_document(entity, doc)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn handle_edit_document(
    State(state): State<AppState>,
    Path((entity, slug)): Path<(String, String)>,
    Json(edit): Json<DocumentEdit>,
) -> Result<Json<Document>, AppError> {
    let entity = parse_entity(&entity)?;
    let ctx = state.ctx();
    let doc = Editor::new(ctx.store.as_ref(), &ctx.retention)
        .edit_document(entity, &slug, edit)
        .await?;
    Ok(Json(doc))
}

#[derive(Serialize)]
struct VersionListResponse {
    versions: Vec<VersionSnapshot>,
}

async fn handle_list_versions(
    State(state): State<AppState>,
    Path((entity, slug)): Path<(String, String)>,
) -> Result<Json<VersionListResponse>, AppError> {
    let entity = parse_entity(&entity)?;
    let versions = state
        .ctx()
        .retention
        .list(entity.as_str(), &slug, Utc::now())
        .await
        .map_err(internal)?;
    Ok(Json(VersionListResponse { versions }))
}

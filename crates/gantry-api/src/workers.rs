// Worker registration endpoints
//
// Node-local workers authenticate with the shared worker token; the fleet's
// durable state still lives in the store, so these endpoints only wrap
// registration and clean exit.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use gantry_core::EngineError;
use gantry_storage::{EngineStore, RegisterWorker};

use crate::common::{ApiError, ListResponse};

/// Header carrying the shared worker token
pub const WORKER_TOKEN_HEADER: &str = "x-worker-token";

/// App state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EngineStore>,
    /// Shared secret required on registration calls; `None` disables the check
    pub worker_token: Option<String>,
}

/// Worker DTO
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Worker {
    pub id: Uuid,
    pub hostname: String,
    pub capabilities: Vec<String>,
    pub status: String,
    pub max_concurrent_steps: i32,
    pub current_step_count: i32,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl From<gantry_storage::WorkerRow> for Worker {
    fn from(row: gantry_storage::WorkerRow) -> Self {
        Self {
            id: row.id,
            hostname: row.hostname,
            capabilities: row.capabilities,
            status: row.status,
            max_concurrent_steps: row.max_concurrent_steps,
            current_step_count: row.current_step_count,
            last_heartbeat: row.last_heartbeat,
            started_at: row.started_at,
        }
    }
}

/// Request to register a worker
#[derive(Debug, Deserialize, ToSchema)]
pub struct RegisterWorkerRequest {
    pub hostname: String,
    /// Node types this worker executes; empty means any
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: i32,
}

fn default_max_concurrent_steps() -> i32 {
    10
}

/// Create worker routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/workers", get(list_workers).post(register_worker))
        .route("/api/workers/:id", delete(deregister_worker))
        .with_state(state)
}

fn check_token(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.worker_token else {
        return Ok(());
    };
    let provided = headers
        .get(WORKER_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided != expected {
        return Err(ApiError(EngineError::validation("invalid worker token")));
    }
    Ok(())
}

/// GET /api/workers
#[utoipa::path(
    get,
    path = "/api/workers",
    responses((status = 200, description = "Registered workers")),
    tag = "workers"
)]
pub async fn list_workers(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<Worker>>, ApiError> {
    let rows = state.store.list_workers().await?;
    Ok(Json(rows.into_iter().map(Worker::from).collect::<Vec<_>>().into()))
}

/// POST /api/workers
#[utoipa::path(
    post,
    path = "/api/workers",
    request_body = RegisterWorkerRequest,
    responses(
        (status = 201, description = "Worker registered", body = Worker),
        (status = 400, description = "Invalid worker token")
    ),
    tag = "workers"
)]
pub async fn register_worker(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterWorkerRequest>,
) -> Result<(StatusCode, Json<Worker>), ApiError> {
    check_token(&state, &headers)?;

    let row = state
        .store
        .register_worker(RegisterWorker {
            id: Uuid::now_v7(),
            hostname: req.hostname,
            capabilities: req.capabilities,
            max_concurrent_steps: req.max_concurrent_steps.max(1),
        })
        .await?;

    tracing::info!(worker_id = %row.id, "worker registered via API");
    Ok((StatusCode::CREATED, Json(row.into())))
}

/// DELETE /api/workers/{id}
#[utoipa::path(
    delete,
    path = "/api/workers/{id}",
    params(("id" = Uuid, Path, description = "Worker ID")),
    responses(
        (status = 204, description = "Worker deregistered"),
        (status = 404, description = "Worker not found")
    ),
    tag = "workers"
)]
pub async fn deregister_worker(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    check_token(&state, &headers)?;

    if state.store.deregister_worker(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(EngineError::not_found(format!("worker {}", id))))
    }
}

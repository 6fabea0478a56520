// Run and step read endpoints, plus cancellation

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use gantry_core::EngineError;
use gantry_engine::RunCoordinator;
use gantry_storage::{EngineStore, RunFilter};

use crate::common::{ApiError, ListResponse};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EngineStore>,
    pub coordinator: Arc<RunCoordinator>,
}

/// Run DTO
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Run {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version_id: Uuid,
    pub trigger_id: Option<Uuid>,
    pub status: String,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub error_data: Option<Value>,
    pub total_steps: i32,
    pub completed_steps: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<gantry_storage::RunRow> for Run {
    fn from(row: gantry_storage::RunRow) -> Self {
        Self {
            id: row.id,
            workflow_id: row.workflow_id,
            version_id: row.version_id,
            trigger_id: row.trigger_id,
            status: row.status,
            input_data: row.input_data,
            output_data: row.output_data,
            error_data: row.error_data,
            total_steps: row.total_steps,
            completed_steps: row.completed_steps,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

/// Step DTO
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Step {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub step_number: i32,
    pub iteration_index: i32,
    pub status: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub input_envelope: Value,
    pub output_envelope: Option<Value>,
    pub chosen_handle: Option<String>,
    pub error_details: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<gantry_storage::StepRow> for Step {
    fn from(row: gantry_storage::StepRow) -> Self {
        Self {
            id: row.id,
            run_id: row.run_id,
            node_id: row.node_id,
            node_type: row.node_type,
            step_number: row.step_number,
            iteration_index: row.iteration_index,
            status: row.status,
            attempt_count: row.attempt_count,
            max_attempts: row.max_attempts,
            input_envelope: row.input_envelope,
            output_envelope: row.output_envelope,
            chosen_handle: row.chosen_handle,
            error_details: row.error_details,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

/// Query parameters for listing runs
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListRunsParams {
    pub workflow_id: Option<Uuid>,
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub page: i64,
}

fn default_limit() -> i64 {
    20
}

/// Create run routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/workflow-runs", get(list_runs))
        .route("/api/workflow-runs/:run_id", get(get_run))
        .route("/api/workflow-runs/:run_id/steps", get(list_steps))
        .route("/api/workflow-runs/:run_id/cancel", post(cancel_run))
        .with_state(state)
}

/// GET /api/workflow-runs
#[utoipa::path(
    get,
    path = "/api/workflow-runs",
    params(
        ("workflow_id" = Option<Uuid>, Query, description = "Filter by workflow"),
        ("status" = Option<String>, Query, description = "Filter by status"),
        ("page" = Option<i64>, Query, description = "Page number (0-based)"),
        ("limit" = Option<i64>, Query, description = "Page size (default 20)")
    ),
    responses((status = 200, description = "List of runs")),
    tag = "runs"
)]
pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListRunsParams>,
) -> Result<Json<ListResponse<Run>>, ApiError> {
    let limit = params.limit.clamp(1, 200);
    let rows = state
        .store
        .list_runs(RunFilter {
            workflow_id: params.workflow_id,
            status: params.status,
            limit,
            offset: params.page.max(0) * limit,
        })
        .await?;

    Ok(Json(rows.into_iter().map(Run::from).collect::<Vec<_>>().into()))
}

/// GET /api/workflow-runs/{run_id}
#[utoipa::path(
    get,
    path = "/api/workflow-runs/{run_id}",
    params(("run_id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run found", body = Run),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Run>, ApiError> {
    let row = state
        .store
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found(format!("run {}", run_id))))?;
    Ok(Json(row.into()))
}

/// GET /api/workflow-runs/{run_id}/steps
#[utoipa::path(
    get,
    path = "/api/workflow-runs/{run_id}/steps",
    params(("run_id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Steps ordered by step number"),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn list_steps(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<ListResponse<Step>>, ApiError> {
    state
        .store
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found(format!("run {}", run_id))))?;

    let rows = state.store.list_steps(run_id).await?;
    Ok(Json(rows.into_iter().map(Step::from).collect::<Vec<_>>().into()))
}

/// POST /api/workflow-runs/{run_id}/cancel
#[utoipa::path(
    post,
    path = "/api/workflow-runs/{run_id}/cancel",
    params(("run_id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run cancelled"),
        (status = 404, description = "Run not found"),
        (status = 409, description = "Run already terminal")
    ),
    tag = "runs"
)]
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .get_run(run_id)
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found(format!("run {}", run_id))))?;

    if state.coordinator.cancel(run_id).await? {
        tracing::info!(%run_id, "run cancelled via API");
        Ok(StatusCode::OK)
    } else {
        Err(ApiError(EngineError::precondition(
            "run already reached a terminal status",
        )))
    }
}

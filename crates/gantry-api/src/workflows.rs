// Workflow CRUD, drafts, versions, deploy, execute, and draft node testing

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use gantry_core::{
    EngineError, Envelope, ExecutionContext, GraphDefinition, MemoryVariableStore, NodeKind,
    NodeOutcome, NodeRegistry, Trace,
};
use gantry_engine::coordinator::NewRun;
use gantry_engine::RunCoordinator;
use gantry_storage::{CreateTrigger, CreateWorkflow, EngineStore};

use crate::common::{ApiError, ListResponse};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EngineStore>,
    pub coordinator: Arc<RunCoordinator>,
    pub registry: Arc<NodeRegistry>,
}

/// Workflow DTO
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Workflow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<gantry_storage::WorkflowRow> for Workflow {
    fn from(row: gantry_storage::WorkflowRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Workflow version DTO
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version_number: i32,
    pub is_current: bool,
    pub definition: Value,
    pub created_at: DateTime<Utc>,
}

impl From<gantry_storage::WorkflowVersionRow> for WorkflowVersion {
    fn from(row: gantry_storage::WorkflowVersionRow) -> Self {
        Self {
            id: row.id,
            workflow_id: row.workflow_id,
            version_number: row.version_number,
            is_current: row.is_current,
            definition: row.definition,
            created_at: row.created_at,
        }
    }
}

/// Draft DTO
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Draft {
    pub workflow_id: Uuid,
    pub definition: Value,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a workflow
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateWorkflowRequest {
    pub name: String,
    /// Initial draft definition; defaults to an empty graph
    #[serde(default)]
    pub definition: Option<Value>,
}

/// Request to rename a workflow
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateWorkflowRequest {
    pub name: String,
}

/// Request to replace a draft
#[derive(Debug, Deserialize, ToSchema)]
pub struct PutDraftRequest {
    pub definition: Value,
}

/// Request to execute a workflow
#[derive(Debug, Deserialize, ToSchema)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub input: Option<Value>,
}

/// Response carrying the enqueued run id
#[derive(Debug, Serialize, ToSchema)]
pub struct ExecuteResponse {
    pub run_id: Uuid,
}

/// Request to test a single draft node
#[derive(Debug, Deserialize, ToSchema)]
pub struct TestNodeRequest {
    /// Input envelope payload
    #[serde(default)]
    pub data: Option<Value>,
    /// Configuration override; defaults to the node's draft config
    #[serde(default)]
    pub config: Option<Value>,
}

/// Outcome of a one-off node execution
#[derive(Debug, Serialize, ToSchema)]
pub struct TestNodeResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Create workflow routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/workflows", get(list_workflows).post(create_workflow))
        .route(
            "/api/workflows/:id",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/api/workflows/:id/draft", get(get_draft).put(put_draft))
        .route(
            "/api/workflows/:id/versions",
            get(list_versions).post(create_version),
        )
        .route(
            "/api/workflows/:id/versions/:version/deploy",
            post(deploy_version),
        )
        .route("/api/workflows/:id/execute", post(execute_workflow))
        .route(
            "/api/workflows/:id/draft/nodes/:node_id/test",
            post(test_draft_node),
        )
        .with_state(state)
}

fn empty_graph() -> Value {
    serde_json::json!({ "nodes": [], "edges": [] })
}

async fn require_workflow(
    state: &AppState,
    id: Uuid,
) -> Result<gantry_storage::WorkflowRow, ApiError> {
    state
        .store
        .get_workflow(id)
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found(format!("workflow {}", id))))
}

fn parse_definition(definition: &Value) -> Result<GraphDefinition, ApiError> {
    serde_json::from_value(definition.clone())
        .map_err(|e| ApiError(EngineError::validation(format!("invalid definition: {}", e))))
}

/// GET /api/workflows
#[utoipa::path(
    get,
    path = "/api/workflows",
    responses((status = 200, description = "List of workflows")),
    tag = "workflows"
)]
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<Workflow>>, ApiError> {
    let rows = state.store.list_workflows(None).await?;
    Ok(Json(
        rows.into_iter().map(Workflow::from).collect::<Vec<_>>().into(),
    ))
}

/// POST /api/workflows
#[utoipa::path(
    post,
    path = "/api/workflows",
    request_body = CreateWorkflowRequest,
    responses(
        (status = 201, description = "Workflow created", body = Workflow),
        (status = 400, description = "Invalid definition")
    ),
    tag = "workflows"
)]
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(req): Json<CreateWorkflowRequest>,
) -> Result<(StatusCode, Json<Workflow>), ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError(EngineError::validation("name must not be empty")));
    }
    let definition = req.definition.unwrap_or_else(empty_graph);
    parse_definition(&definition)?
        .validate()
        .map_err(|e| ApiError(EngineError::validation(e.to_string())))?;

    let row = state
        .store
        .create_workflow(CreateWorkflow {
            owner_id: Uuid::nil(),
            name: req.name,
            definition,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(row.into())))
}

/// GET /api/workflows/{id}
#[utoipa::path(
    get,
    path = "/api/workflows/{id}",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "Workflow found", body = Workflow),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflows"
)]
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Workflow>, ApiError> {
    Ok(Json(require_workflow(&state, id).await?.into()))
}

/// PUT /api/workflows/{id}
#[utoipa::path(
    put,
    path = "/api/workflows/{id}",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    request_body = UpdateWorkflowRequest,
    responses(
        (status = 200, description = "Workflow updated", body = Workflow),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflows"
)]
pub async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateWorkflowRequest>,
) -> Result<Json<Workflow>, ApiError> {
    let row = state
        .store
        .rename_workflow(id, &req.name)
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found(format!("workflow {}", id))))?;
    Ok(Json(row.into()))
}

/// DELETE /api/workflows/{id}
#[utoipa::path(
    delete,
    path = "/api/workflows/{id}",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    responses(
        (status = 204, description = "Workflow deleted"),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflows"
)]
pub async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.store.delete_workflow(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(EngineError::not_found(format!("workflow {}", id))))
    }
}

/// GET /api/workflows/{id}/draft
#[utoipa::path(
    get,
    path = "/api/workflows/{id}/draft",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    responses(
        (status = 200, description = "Current draft", body = Draft),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflows"
)]
pub async fn get_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Draft>, ApiError> {
    require_workflow(&state, id).await?;
    let draft = state
        .store
        .get_draft(id)
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found(format!("draft of workflow {}", id))))?;

    Ok(Json(Draft {
        workflow_id: draft.workflow_id,
        definition: draft.definition,
        updated_at: draft.updated_at,
    }))
}

/// PUT /api/workflows/{id}/draft
#[utoipa::path(
    put,
    path = "/api/workflows/{id}/draft",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    request_body = PutDraftRequest,
    responses(
        (status = 200, description = "Draft replaced", body = Draft),
        (status = 400, description = "Invalid definition"),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflows"
)]
pub async fn put_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PutDraftRequest>,
) -> Result<Json<Draft>, ApiError> {
    require_workflow(&state, id).await?;
    parse_definition(&req.definition)?
        .validate()
        .map_err(|e| ApiError(EngineError::validation(e.to_string())))?;

    let draft = state.store.put_draft(id, req.definition).await?;
    Ok(Json(Draft {
        workflow_id: draft.workflow_id,
        definition: draft.definition,
        updated_at: draft.updated_at,
    }))
}

/// GET /api/workflows/{id}/versions
#[utoipa::path(
    get,
    path = "/api/workflows/{id}/versions",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    responses((status = 200, description = "Version list")),
    tag = "workflows"
)]
pub async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ListResponse<WorkflowVersion>>, ApiError> {
    require_workflow(&state, id).await?;
    let rows = state.store.list_versions(id).await?;
    Ok(Json(
        rows.into_iter()
            .map(WorkflowVersion::from)
            .collect::<Vec<_>>()
            .into(),
    ))
}

/// POST /api/workflows/{id}/versions
///
/// Snapshots the draft into a new immutable version.
#[utoipa::path(
    post,
    path = "/api/workflows/{id}/versions",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    responses(
        (status = 201, description = "Version created", body = WorkflowVersion),
        (status = 400, description = "Draft fails validation"),
        (status = 404, description = "Workflow not found")
    ),
    tag = "workflows"
)]
pub async fn create_version(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<WorkflowVersion>), ApiError> {
    require_workflow(&state, id).await?;
    let draft = state
        .store
        .get_draft(id)
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found(format!("draft of workflow {}", id))))?;

    let graph = parse_definition(&draft.definition)?;
    graph
        .validate()
        .map_err(|e| ApiError(EngineError::validation(e.to_string())))?;
    let registry = state.registry.clone();
    graph
        .validate_cycles(|node_id| {
            graph
                .node(node_id)
                .and_then(|n| registry.kind_of(&n.node_type))
                .map(|k| k == NodeKind::Loop)
                .unwrap_or(false)
        })
        .map_err(|e| ApiError(EngineError::validation(e.to_string())))?;

    let version = state.store.create_version(id, draft.definition).await?;
    Ok((StatusCode::CREATED, Json(version.into())))
}

/// POST /api/workflows/{id}/versions/{version}/deploy
///
/// Atomically flips `is_current`, then reconciles the workflow's triggers
/// against the entry-point nodes of the deployed definition.
#[utoipa::path(
    post,
    path = "/api/workflows/{id}/versions/{version}/deploy",
    params(
        ("id" = Uuid, Path, description = "Workflow ID"),
        ("version" = i32, Path, description = "Version number")
    ),
    responses(
        (status = 200, description = "Version deployed", body = WorkflowVersion),
        (status = 404, description = "Workflow or version not found")
    ),
    tag = "workflows"
)]
pub async fn deploy_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(Uuid, i32)>,
) -> Result<Json<WorkflowVersion>, ApiError> {
    require_workflow(&state, id).await?;
    let deployed = state.store.deploy_version(id, version).await?;

    sync_triggers(&state, id, &deployed.definition).await?;

    tracing::info!(workflow_id = %id, version, "deployed version");
    Ok(Json(deployed.into()))
}

/// Recreate trigger rows from the deployed definition's entry-point nodes
async fn sync_triggers(state: &AppState, workflow_id: Uuid, definition: &Value) -> Result<(), ApiError> {
    let graph = parse_definition(definition)?;

    state.store.delete_workflow_triggers(workflow_id).await?;

    for node in &graph.nodes {
        let Some(NodeKind::Trigger) = state.registry.kind_of(&node.node_type) else {
            continue;
        };

        let provider = node
            .node_type
            .strip_suffix("_trigger")
            .unwrap_or(&node.node_type)
            .to_string();

        let token = if provider == "webhook" {
            Some(
                node.config
                    .get("token")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| Uuid::now_v7().simple().to_string()),
            )
        } else {
            None
        };

        state
            .store
            .create_trigger(CreateTrigger {
                workflow_id,
                provider,
                node_id: node.id.clone(),
                config: node.config.clone(),
                token,
                enabled: true,
            })
            .await?;
    }

    Ok(())
}

/// POST /api/workflows/{id}/execute
#[utoipa::path(
    post,
    path = "/api/workflows/{id}/execute",
    params(("id" = Uuid, Path, description = "Workflow ID")),
    request_body = ExecuteRequest,
    responses(
        (status = 202, description = "Run enqueued", body = ExecuteResponse),
        (status = 404, description = "Workflow not found"),
        (status = 409, description = "No deployed version")
    ),
    tag = "workflows"
)]
pub async fn execute_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<ExecuteResponse>), ApiError> {
    require_workflow(&state, id).await?;

    let run = state
        .coordinator
        .create_run(NewRun::new(
            id,
            req.input.unwrap_or_else(|| serde_json::json!({})),
        ))
        .await?;

    Ok((StatusCode::ACCEPTED, Json(ExecuteResponse { run_id: run.id })))
}

/// POST /api/workflows/{id}/draft/nodes/{node_id}/test
///
/// Runs a single node against the supplied envelope without persisting a
/// run. Variable writes go to a throwaway in-memory store.
#[utoipa::path(
    post,
    path = "/api/workflows/{id}/draft/nodes/{node_id}/test",
    params(
        ("id" = Uuid, Path, description = "Workflow ID"),
        ("node_id" = String, Path, description = "Node ID within the draft")
    ),
    request_body = TestNodeRequest,
    responses(
        (status = 200, description = "Execution outcome", body = TestNodeResponse),
        (status = 404, description = "Workflow or node not found")
    ),
    tag = "workflows"
)]
pub async fn test_draft_node(
    State(state): State<AppState>,
    Path((id, node_id)): Path<(Uuid, String)>,
    Json(req): Json<TestNodeRequest>,
) -> Result<Json<TestNodeResponse>, ApiError> {
    require_workflow(&state, id).await?;
    let draft = state
        .store
        .get_draft(id)
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found(format!("draft of workflow {}", id))))?;
    let graph = parse_definition(&draft.definition)?;
    let node = graph
        .node(&node_id)
        .ok_or_else(|| ApiError(EngineError::not_found(format!("node {}", node_id))))?;

    let definition = state.registry.get(&node.node_type).map_err(EngineError::from)?;

    let run_id = Uuid::now_v7();
    let trace = Trace::root(id, run_id).at_step(&node_id, 1, 1);
    let input = Envelope::new(req.data.unwrap_or_else(|| serde_json::json!({})), trace);
    let config = req.config.unwrap_or_else(|| node.config.clone());

    let ctx = ExecutionContext::new(
        id,
        run_id,
        node_id.clone(),
        Uuid::now_v7(),
        1,
        1,
        1,
        Arc::new(MemoryVariableStore::new()),
    );

    let response = match definition.execute(&ctx, &config, input).await {
        Ok(NodeOutcome::Envelope(env)) => TestNodeResponse {
            status: "completed".into(),
            data: Some(env.data),
            handle: None,
            error: None,
        },
        Ok(NodeOutcome::Branch { envelope, handle }) => TestNodeResponse {
            status: "completed".into(),
            data: Some(envelope.data),
            handle: Some(handle),
            error: None,
        },
        Ok(NodeOutcome::Items(items)) => TestNodeResponse {
            status: "completed".into(),
            data: Some(Value::Array(items.into_iter().map(|e| e.data).collect())),
            handle: None,
            error: None,
        },
        Ok(NodeOutcome::Suspend { child_run_id }) => TestNodeResponse {
            status: "suspended".into(),
            data: Some(serde_json::json!({ "child_run_id": child_run_id })),
            handle: None,
            error: None,
        },
        Err(e) => TestNodeResponse {
            status: "failed".into(),
            data: None,
            handle: None,
            error: Some(e.to_string()),
        },
    };

    Ok(Json(response))
}

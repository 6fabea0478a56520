// Node registry introspection and dynamic parameter options

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;

use gantry_core::{EngineError, NodeKind, NodeMeta, NodeRegistry, OptionItem};

use crate::common::{ApiError, ListResponse};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<NodeRegistry>,
}

/// Query parameters for listing node types
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListNodeTypesParams {
    /// Structural kind filter: `standard`, `trigger`, `branch`, `loop`,
    /// `merge`, `sub_workflow`
    pub kind: Option<String>,
}

/// Query parameters for dynamic option computation
#[derive(Debug, Deserialize, ToSchema)]
pub struct OptionsParams {
    /// JSON-encoded sibling parameter values
    pub context: Option<String>,
}

/// Create node-type routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/node-types", get(list_node_types))
        .route(
            "/api/node-types/:node_type/parameters/:parameter/options",
            get(parameter_options),
        )
        .with_state(state)
}

/// GET /api/node-types
#[utoipa::path(
    get,
    path = "/api/node-types",
    params(("kind" = Option<String>, Query, description = "Filter by structural kind")),
    responses(
        (status = 200, description = "Registered node types"),
        (status = 400, description = "Unknown kind filter")
    ),
    tag = "node-types"
)]
pub async fn list_node_types(
    State(state): State<AppState>,
    Query(params): Query<ListNodeTypesParams>,
) -> Result<Json<ListResponse<NodeMeta>>, ApiError> {
    let metas = match params.kind.as_deref() {
        None => state.registry.metas(),
        Some(kind) => {
            let kind: NodeKind = serde_json::from_value(serde_json::Value::String(kind.into()))
                .map_err(|_| {
                    ApiError(EngineError::validation(format!("unknown kind: {}", kind)))
                })?;
            state.registry.metas_of_kind(kind)
        }
    };

    Ok(Json(metas.into()))
}

/// GET /api/node-types/{node_type}/parameters/{parameter}/options
#[utoipa::path(
    get,
    path = "/api/node-types/{node_type}/parameters/{parameter}/options",
    params(
        ("node_type" = String, Path, description = "Registered node type"),
        ("parameter" = String, Path, description = "Parameter name"),
        ("context" = Option<String>, Query, description = "JSON-encoded sibling values")
    ),
    responses(
        (status = 200, description = "Options for the parameter"),
        (status = 404, description = "Unknown node type")
    ),
    tag = "node-types"
)]
pub async fn parameter_options(
    State(state): State<AppState>,
    Path((node_type, parameter)): Path<(String, String)>,
    Query(params): Query<OptionsParams>,
) -> Result<Json<ListResponse<OptionItem>>, ApiError> {
    let definition = state.registry.get(&node_type).map_err(EngineError::from)?;

    let siblings: serde_json::Value = match params.context.as_deref() {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| ApiError(EngineError::validation(format!("invalid context: {}", e))))?,
        None => serde_json::json!({}),
    };

    let options = definition
        .dynamic_options(&parameter, &siblings)
        .await
        .map_err(EngineError::from)?;

    Ok(Json(options.into()))
}

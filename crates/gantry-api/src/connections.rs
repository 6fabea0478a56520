// Connection (credential instance) endpoints
//
// The engine treats connection configuration as opaque: it is stored, listed,
// and handed verbatim to a node's execute via `connection_id`. Encryption at
// rest is a deployment concern outside this surface.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use gantry_core::EngineError;
use gantry_storage::{CreateConnection, EngineStore};

use crate::common::{ApiError, ListResponse};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EngineStore>,
}

/// Connection DTO
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Connection {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub provider: String,
    pub config: Value,
    pub created_at: DateTime<Utc>,
}

impl From<gantry_storage::ConnectionRow> for Connection {
    fn from(row: gantry_storage::ConnectionRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            name: row.name,
            provider: row.provider,
            config: row.config,
            created_at: row.created_at,
        }
    }
}

/// Request to create a connection
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateConnectionRequest {
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub config: Value,
}

/// Create connection routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/connections",
            get(list_connections).post(create_connection),
        )
        .route(
            "/api/connections/:id",
            get(get_connection).delete(delete_connection),
        )
        .with_state(state)
}

/// GET /api/connections
#[utoipa::path(
    get,
    path = "/api/connections",
    responses((status = 200, description = "List of connections")),
    tag = "connections"
)]
pub async fn list_connections(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<Connection>>, ApiError> {
    let rows = state.store.list_connections(None).await?;
    Ok(Json(
        rows.into_iter().map(Connection::from).collect::<Vec<_>>().into(),
    ))
}

/// POST /api/connections
#[utoipa::path(
    post,
    path = "/api/connections",
    request_body = CreateConnectionRequest,
    responses((status = 201, description = "Connection created", body = Connection)),
    tag = "connections"
)]
pub async fn create_connection(
    State(state): State<AppState>,
    Json(req): Json<CreateConnectionRequest>,
) -> Result<(StatusCode, Json<Connection>), ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError(EngineError::validation("name must not be empty")));
    }

    let row = state
        .store
        .create_connection(CreateConnection {
            owner_id: Uuid::nil(),
            name: req.name,
            provider: req.provider,
            config: req.config,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(row.into())))
}

/// GET /api/connections/{id}
#[utoipa::path(
    get,
    path = "/api/connections/{id}",
    params(("id" = Uuid, Path, description = "Connection ID")),
    responses(
        (status = 200, description = "Connection found", body = Connection),
        (status = 404, description = "Connection not found")
    ),
    tag = "connections"
)]
pub async fn get_connection(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Connection>, ApiError> {
    let row = state
        .store
        .get_connection(id)
        .await?
        .ok_or_else(|| ApiError(EngineError::not_found(format!("connection {}", id))))?;
    Ok(Json(row.into()))
}

/// DELETE /api/connections/{id}
#[utoipa::path(
    delete,
    path = "/api/connections/{id}",
    params(("id" = Uuid, Path, description = "Connection ID")),
    responses(
        (status = 204, description = "Connection deleted"),
        (status = 404, description = "Connection not found")
    ),
    tag = "connections"
)]
pub async fn delete_connection(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.store.delete_connection(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(EngineError::not_found(format!("connection {}", id))))
    }
}

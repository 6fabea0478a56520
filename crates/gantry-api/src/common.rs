// Common DTOs and error mapping for the public API
//
// These types are shared across multiple API endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use gantry_core::EngineError;

/// Standard error response for API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message describing what went wrong.
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Response wrapper for list endpoints.
/// All list endpoints return responses wrapped in a `data` field.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    /// Array of items returned by the list operation.
    pub data: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// Engine error carried across a handler boundary
///
/// Maps the behavioral taxonomy onto status codes: validation → 400,
/// not-found → 404, precondition → 409, everything else → 500. Raw store
/// errors are logged, never surfaced.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        Self(error)
    }
}

impl From<gantry_storage::StoreError> for ApiError {
    fn from(error: gantry_storage::StoreError) -> Self {
        Self(match error {
            gantry_storage::StoreError::RunNotFound(id) => {
                EngineError::not_found(format!("run {}", id))
            }
            gantry_storage::StoreError::StepNotFound(id) => {
                EngineError::not_found(format!("step {}", id))
            }
            gantry_storage::StoreError::NotFound(what) => EngineError::not_found(what),
            gantry_storage::StoreError::Conflict(msg) => EngineError::precondition(msg),
            other => EngineError::store(other.to_string()),
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            EngineError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            EngineError::NotFound(msg) => (StatusCode::NOT_FOUND, format!("not found: {}", msg)),
            EngineError::Precondition(msg) => (StatusCode::CONFLICT, msg.clone()),
            EngineError::Registry(e) => (StatusCode::NOT_FOUND, e.to_string()),
            other => {
                tracing::error!("internal error: {}", other);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (EngineError::validation("bad"), StatusCode::BAD_REQUEST),
            (EngineError::not_found("run"), StatusCode::NOT_FOUND),
            (EngineError::precondition("terminal"), StatusCode::CONFLICT),
            (
                EngineError::store("connection refused"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            let response = ApiError(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}

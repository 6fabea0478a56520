// Webhook ingestion endpoint
//
// POST /webhooks/{token} (other methods are routed too; the trigger's
// allowlist decides). Sync-mode calls hold the connection open until the run
// terminates; if the client disconnects mid-wait, the run is cancelled.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use serde_json::Value;
use uuid::Uuid;

use gantry_engine::{ResponseMode, WebhookDispatcher, WebhookOutcome, WebhookRequest};

use crate::common::ApiError;

/// Headers forwarded into the run's input data and the audit row
const FORWARDED_HEADERS: &[&str] = &["content-type", "user-agent", "x-request-id"];

/// App state
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<WebhookDispatcher>,
}

/// Create webhook routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/:token", any(handle_webhook))
        .with_state(state)
}

/// Cancels the run if the sync wait is dropped before completion
struct CancelOnDrop {
    dispatcher: Arc<WebhookDispatcher>,
    run_id: Uuid,
    armed: bool,
}

impl CancelOnDrop {
    fn new(dispatcher: Arc<WebhookDispatcher>, run_id: Uuid) -> Self {
        Self {
            dispatcher,
            run_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let dispatcher = self.dispatcher.clone();
            let run_id = self.run_id;
            tracing::info!(%run_id, "sync webhook client disconnected, cancelling run");
            tokio::spawn(async move {
                if let Err(e) = dispatcher.cancel_run(run_id).await {
                    tracing::warn!(%run_id, "disconnect cancellation failed: {}", e);
                }
            });
        }
    }
}

fn selected_headers(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for name in FORWARDED_HEADERS {
        if let Some(value) = headers.get(*name).and_then(|v| v.to_str().ok()) {
            map.insert(name.to_string(), Value::String(value.to_string()));
        }
    }
    Value::Object(map)
}

/// ANY /webhooks/{token}
#[utoipa::path(
    post,
    path = "/webhooks/{token}",
    params(("token" = String, Path, description = "Webhook token")),
    request_body = Vec<u8>,
    responses(
        (status = 202, description = "Run enqueued (async mode)"),
        (status = 200, description = "Run output (sync mode)"),
        (status = 404, description = "Unknown or disabled webhook"),
        (status = 504, description = "Sync wait timed out")
    ),
    tag = "webhooks"
)]
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(token): Path<String>,
    method: Method,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let body: Value = if body.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&body).into_owned())
        })
    };

    let secret = headers
        .get("x-webhook-secret")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let ingested = state
        .dispatcher
        .ingest(WebhookRequest {
            token,
            method: method.to_string(),
            headers: selected_headers(&headers),
            body,
            source_ip: Some(addr.ip().to_string()),
            secret,
        })
        .await?;

    match ingested.mode {
        ResponseMode::Async => {
            state.dispatcher.record_response(ingested.event_id, 202).await?;
            Ok((
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "run_id": ingested.run_id })),
            )
                .into_response())
        }
        ResponseMode::Sync {
            timeout,
            success_status,
        } => {
            let guard = CancelOnDrop::new(state.dispatcher.clone(), ingested.run_id);
            let outcome = state
                .dispatcher
                .wait_sync(ingested.run_id, timeout, success_status)
                .await;
            guard.disarm();

            let outcome = outcome?;
            let status = match &outcome {
                WebhookOutcome::Completed { status, .. } => *status as i32,
                WebhookOutcome::TimedOut { .. } => 504,
                WebhookOutcome::Accepted { .. } => 202,
            };
            state
                .dispatcher
                .record_response(ingested.event_id, status)
                .await?;

            Ok(match outcome {
                WebhookOutcome::Completed { status, body, .. } => {
                    let status = StatusCode::from_u16(status)
                        .unwrap_or(StatusCode::OK);
                    (status, Json(body)).into_response()
                }
                WebhookOutcome::TimedOut { run_id } => (
                    StatusCode::GATEWAY_TIMEOUT,
                    Json(serde_json::json!({ "run_id": run_id, "error": "run did not finish in time" })),
                )
                    .into_response(),
                WebhookOutcome::Accepted { run_id } => (
                    StatusCode::ACCEPTED,
                    Json(serde_json::json!({ "run_id": run_id })),
                )
                    .into_response(),
            })
        }
    }
}

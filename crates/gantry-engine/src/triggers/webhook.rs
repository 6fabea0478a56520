//! Webhook trigger dispatcher
//!
//! Behind `POST /webhooks/{token}`: resolves the token to a trigger, checks
//! the method allowlist and optional shared secret, persists an audit row,
//! and creates the run through the durable queue. Sync mode blocks until the
//! run terminates (up to the trigger's configured timeout) and returns its
//! output.
//!
//! Ingestion and the sync wait are separate steps so the HTTP layer can
//! cancel the run when its client disconnects mid-wait.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use gantry_core::{EngineError, RunStatus};
use gantry_storage::{CreateWebhookEvent, EngineStore, TriggerRow};

use crate::coordinator::{NewRun, RunCoordinator};

/// Poll interval while waiting for a sync-mode run
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default sync-mode wait before giving up on the run
const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 30;

/// An inbound webhook call
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub token: String,
    pub method: String,
    /// Selected request headers, persisted on the audit row
    pub headers: Value,
    pub body: Value,
    pub source_ip: Option<String>,
    /// Value of the `X-Webhook-Secret` header, if sent
    pub secret: Option<String>,
}

/// Response behavior configured on the trigger
#[derive(Debug, Clone)]
pub enum ResponseMode {
    /// Respond 202 with the run id immediately
    Async,

    /// Block until the run terminates
    Sync {
        timeout: Duration,
        success_status: u16,
    },
}

/// An accepted webhook call whose run now exists
#[derive(Debug)]
pub struct Ingested {
    pub run_id: Uuid,
    pub event_id: Uuid,
    pub mode: ResponseMode,
}

/// Result the HTTP layer translates into a response
#[derive(Debug)]
pub enum WebhookOutcome {
    /// Async mode: the run was enqueued
    Accepted { run_id: Uuid },

    /// Sync mode: the run terminated within the wait budget
    Completed {
        run_id: Uuid,
        status: u16,
        body: Value,
    },

    /// Sync mode: the run did not terminate within the wait budget
    TimedOut { run_id: Uuid },
}

pub struct WebhookDispatcher {
    store: Arc<dyn EngineStore>,
    coordinator: Arc<RunCoordinator>,
}

fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

fn method_allowed(trigger: &TriggerRow, method: &str) -> bool {
    match trigger.config.get("method") {
        None => true,
        Some(Value::String(allowed)) => allowed.eq_ignore_ascii_case(method),
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(|v| v.as_str())
            .any(|allowed| allowed.eq_ignore_ascii_case(method)),
        Some(_) => false,
    }
}

fn store_err(e: gantry_storage::StoreError) -> EngineError {
    EngineError::store(e.to_string())
}

impl WebhookDispatcher {
    pub fn new(store: Arc<dyn EngineStore>, coordinator: Arc<RunCoordinator>) -> Self {
        Self { store, coordinator }
    }

    /// Validate the call, record the audit row, and create the run
    #[instrument(skip(self, request), fields(token = %request.token, method = %request.method))]
    pub async fn ingest(&self, request: WebhookRequest) -> Result<Ingested, EngineError> {
        let trigger = self
            .store
            .get_trigger_by_token(&request.token)
            .await
            .map_err(store_err)?
            .filter(|t| t.enabled)
            .ok_or_else(|| EngineError::not_found("webhook"))?;

        if !method_allowed(&trigger, &request.method) {
            return Err(EngineError::validation(format!(
                "method {} not allowed for this webhook",
                request.method
            )));
        }

        if let Some(expected) = trigger.config.get("secret").and_then(|v| v.as_str()) {
            // Compare digests so length never leaks through the comparison
            let provided = request.secret.as_deref().unwrap_or("");
            if sha256_hex(expected) != sha256_hex(provided) {
                return Err(EngineError::validation("invalid webhook secret"));
            }
        }

        let event = self
            .store
            .record_webhook_event(CreateWebhookEvent {
                trigger_id: trigger.id,
                payload: request.body.clone(),
                headers: request.headers.clone(),
                source_ip: request.source_ip.clone(),
            })
            .await
            .map_err(store_err)?;

        self.store
            .touch_trigger(trigger.id)
            .await
            .map_err(store_err)?;

        // The body crosses into the run as a string; headers and method ride
        // alongside for the entry node to inspect
        let body_text = serde_json::to_string(&request.body)
            .map_err(|e| EngineError::validation(format!("unserializable body: {}", e)))?;
        let input_data = serde_json::json!({
            "body": body_text,
            "headers": request.headers,
            "method": request.method,
        });

        let run = self
            .coordinator
            .create_run(NewRun {
                workflow_id: trigger.workflow_id,
                input_data,
                variables: serde_json::json!({}),
                trigger_id: Some(trigger.id),
                entry_node_id: Some(trigger.node_id.clone()),
                parent_step_id: None,
                timeout_seconds: None,
            })
            .await?;

        info!(trigger_id = %trigger.id, run_id = %run.id, "webhook created run");

        let sync = trigger
            .config
            .get("mode")
            .and_then(|v| v.as_str())
            .map(|m| m == "sync")
            .unwrap_or(false);

        let mode = if sync {
            let timeout = trigger
                .config
                .get("timeout_seconds")
                .and_then(|v| v.as_u64())
                .unwrap_or(DEFAULT_SYNC_TIMEOUT_SECS);
            let success_status = trigger
                .config
                .get("response_status")
                .and_then(|v| v.as_u64())
                .unwrap_or(200) as u16;
            ResponseMode::Sync {
                timeout: Duration::from_secs(timeout),
                success_status,
            }
        } else {
            ResponseMode::Async
        };

        Ok(Ingested {
            run_id: run.id,
            event_id: event.id,
            mode,
        })
    }

    /// Handle a webhook arrival end to end (ingest + optional sync wait)
    pub async fn dispatch(&self, request: WebhookRequest) -> Result<WebhookOutcome, EngineError> {
        let ingested = self.ingest(request).await?;

        match ingested.mode {
            ResponseMode::Async => {
                self.record_response(ingested.event_id, 202).await?;
                Ok(WebhookOutcome::Accepted {
                    run_id: ingested.run_id,
                })
            }
            ResponseMode::Sync {
                timeout,
                success_status,
            } => {
                let outcome = self
                    .wait_sync(ingested.run_id, timeout, success_status)
                    .await?;
                let status = match &outcome {
                    WebhookOutcome::Completed { status, .. } => *status as i32,
                    WebhookOutcome::TimedOut { .. } => 504,
                    WebhookOutcome::Accepted { .. } => 202,
                };
                self.record_response(ingested.event_id, status).await?;
                Ok(outcome)
            }
        }
    }

    /// Record the HTTP status served for an audit row
    pub async fn record_response(&self, event_id: Uuid, status: i32) -> Result<(), EngineError> {
        self.store
            .set_webhook_event_status(event_id, status)
            .await
            .map_err(store_err)
    }

    /// Poll a run until it terminates or the wait budget is spent
    pub async fn wait_sync(
        &self,
        run_id: Uuid,
        timeout: Duration,
        success_status: u16,
    ) -> Result<WebhookOutcome, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let Some(run) = self.store.get_run(run_id).await.map_err(store_err)? else {
                return Err(EngineError::not_found(format!("run {}", run_id)));
            };

            let status: RunStatus = run.status.parse().map_err(EngineError::store)?;
            if status.is_terminal() {
                let (code, body) = match status {
                    RunStatus::Completed => {
                        (success_status, run.output_data.unwrap_or(Value::Null))
                    }
                    RunStatus::Failed => (500, run.error_data.unwrap_or(Value::Null)),
                    _ => (
                        409,
                        serde_json::json!({ "error": format!("run {}", status) }),
                    ),
                };
                return Ok(WebhookOutcome::Completed {
                    run_id,
                    status: code,
                    body,
                });
            }

            if tokio::time::Instant::now() >= deadline {
                debug!(%run_id, "sync webhook wait timed out");
                return Ok(WebhookOutcome::TimedOut { run_id });
            }

            tokio::time::sleep(SYNC_POLL_INTERVAL).await;
        }
    }

    /// Cancel a run whose sync caller disconnected
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<bool, EngineError> {
        self.coordinator.cancel(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn trigger_with_config(config: Value) -> TriggerRow {
        TriggerRow {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            provider: "webhook".into(),
            node_id: "hook".into(),
            config,
            token: Some("abc".into()),
            enabled: true,
            last_checked: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_method_allowlist() {
        let any = trigger_with_config(json!({}));
        assert!(method_allowed(&any, "POST"));
        assert!(method_allowed(&any, "GET"));

        let post_only = trigger_with_config(json!({"method": "POST"}));
        assert!(method_allowed(&post_only, "post"));
        assert!(!method_allowed(&post_only, "GET"));

        let list = trigger_with_config(json!({"method": ["POST", "PUT"]}));
        assert!(method_allowed(&list, "PUT"));
        assert!(!method_allowed(&list, "DELETE"));
    }

    #[test]
    fn test_secret_digest_comparison() {
        assert_eq!(sha256_hex("s3cret"), sha256_hex("s3cret"));
        assert_ne!(sha256_hex("s3cret"), sha256_hex("other"));
    }
}

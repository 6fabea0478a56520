// Database models (internal, may differ from public DTOs)

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================
// Workflow models
// ============================================

/// Workflow row from database
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable snapshot of a workflow definition
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowVersionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version_number: i32,
    pub definition: serde_json::Value,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
}

/// Mutable working copy, one per workflow
#[derive(Debug, Clone, FromRow)]
pub struct DraftRow {
    pub workflow_id: Uuid,
    pub definition: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a workflow
#[derive(Debug, Clone)]
pub struct CreateWorkflow {
    pub owner_id: Uuid,
    pub name: String,
    /// Initial draft definition
    pub definition: serde_json::Value,
}

// ============================================
// Trigger models
// ============================================

/// Persisted binding of a trigger provider to a workflow entry-point node
#[derive(Debug, Clone, FromRow)]
pub struct TriggerRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// Provider family, e.g. `schedule` or `webhook`
    pub provider: String,
    /// Entry-point node id within the workflow graph
    pub node_id: String,
    /// Provider-specific configuration (`cron`, `method`, `secret`, ...)
    pub config: serde_json::Value,
    /// Webhook ingestion token; `NULL` for non-webhook providers
    pub token: Option<String>,
    pub enabled: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a trigger
#[derive(Debug, Clone)]
pub struct CreateTrigger {
    pub workflow_id: Uuid,
    pub provider: String,
    pub node_id: String,
    pub config: serde_json::Value,
    pub token: Option<String>,
    pub enabled: bool,
}

// ============================================
// Run models
// ============================================

/// One execution of a workflow version
#[derive(Debug, Clone, FromRow)]
pub struct RunRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version_id: Uuid,
    pub trigger_id: Option<Uuid>,
    /// Set when this run was launched by a sub-workflow call node
    pub parent_step_id: Option<Uuid>,
    pub status: String,
    pub input_data: serde_json::Value,
    /// Initial variable snapshot seeded into the first envelopes
    pub variables: serde_json::Value,
    pub retry_policy: serde_json::Value,
    pub timeout_seconds: Option<i64>,
    pub assigned_worker_id: Option<Uuid>,
    pub worker_heartbeat_at: Option<DateTime<Utc>>,
    /// Monotonic counter handing out `step_number`s; next unassigned value
    pub next_step_number: i32,
    pub total_steps: i32,
    pub completed_steps: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_data: Option<serde_json::Value>,
    pub error_data: Option<serde_json::Value>,
}

/// Input for creating a run (inserted atomically with its `start_run` item)
#[derive(Debug, Clone)]
pub struct CreateRun {
    pub workflow_id: Uuid,
    pub version_id: Uuid,
    pub trigger_id: Option<Uuid>,
    pub parent_step_id: Option<Uuid>,
    pub input_data: serde_json::Value,
    pub variables: serde_json::Value,
    pub retry_policy: serde_json::Value,
    pub timeout_seconds: Option<i64>,
    /// Entry-point node the initial frontier grows from; `None` means every
    /// entry-point node of the version
    pub entry_node_id: Option<String>,
}

/// Filter for listing runs
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub workflow_id: Option<Uuid>,
    pub status: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

// ============================================
// Step models
// ============================================

/// One execution of one node within a run
#[derive(Debug, Clone, FromRow)]
pub struct StepRow {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Graph node id
    pub node_id: String,
    pub node_type: String,
    pub step_number: i32,
    /// Distinguishes loop/for-each re-entries of the same node
    pub iteration_index: i32,
    pub status: String,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub input_envelope: serde_json::Value,
    pub output_envelope: Option<serde_json::Value>,
    /// Handle selector recorded by branching nodes
    pub chosen_handle: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub assigned_worker_id: Option<Uuid>,
    /// Child run a sub-workflow call step is suspended on
    pub waiting_on_run: Option<Uuid>,
    /// Step ids this step depends on (fan-in)
    pub depends_on: Vec<Uuid>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for creating a step
#[derive(Debug, Clone)]
pub struct CreateStep {
    pub run_id: Uuid,
    pub node_id: String,
    pub node_type: String,
    pub step_number: i32,
    pub iteration_index: i32,
    pub max_attempts: i32,
    pub input_envelope: serde_json::Value,
    pub depends_on: Vec<Uuid>,
}

// ============================================
// Queue models
// ============================================

/// Durable work item
#[derive(Debug, Clone, FromRow)]
pub struct QueueItemRow {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: Option<Uuid>,
    pub queue_type: String,
    /// Node type for capability matching; `NULL` items match any worker
    pub node_type: Option<String>,
    pub priority: i32,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<Uuid>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub payload: serde_json::Value,
}

/// Input for enqueueing a work item
#[derive(Debug, Clone)]
pub struct EnqueueItem {
    pub run_id: Uuid,
    pub step_id: Option<Uuid>,
    pub queue_type: gantry_core::QueueType,
    pub node_type: Option<String>,
    /// `None` uses the queue type's default priority
    pub priority: Option<i32>,
    /// `None` means immediately claimable
    pub available_at: Option<DateTime<Utc>>,
    pub max_attempts: i32,
    pub payload: serde_json::Value,
}

impl EnqueueItem {
    pub fn new(run_id: Uuid, queue_type: gantry_core::QueueType) -> Self {
        Self {
            run_id,
            step_id: None,
            queue_type,
            node_type: None,
            priority: None,
            available_at: None,
            max_attempts: 5,
            payload: serde_json::json!({}),
        }
    }

    pub fn for_step(mut self, step_id: Uuid, node_type: impl Into<String>) -> Self {
        self.step_id = Some(step_id);
        self.node_type = Some(node_type.into());
        self
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ============================================
// Worker models
// ============================================

/// Registered worker process
#[derive(Debug, Clone, FromRow)]
pub struct WorkerRow {
    pub id: Uuid,
    pub hostname: String,
    /// Node types this worker executes; empty means any
    pub capabilities: Vec<String>,
    pub status: String,
    pub max_concurrent_steps: i32,
    pub current_step_count: i32,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

/// Input for registering a worker
#[derive(Debug, Clone)]
pub struct RegisterWorker {
    pub id: Uuid,
    pub hostname: String,
    pub capabilities: Vec<String>,
    pub max_concurrent_steps: i32,
}

// ============================================
// Variable models
// ============================================

/// Scoped variable row
#[derive(Debug, Clone, FromRow)]
pub struct VariableRow {
    pub scope: String,
    pub scope_key: String,
    pub name: String,
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

// ============================================
// Webhook event models
// ============================================

/// Audit record of one webhook arrival
#[derive(Debug, Clone, FromRow)]
pub struct WebhookEventRow {
    pub id: Uuid,
    pub trigger_id: Uuid,
    pub payload: serde_json::Value,
    pub headers: serde_json::Value,
    pub source_ip: Option<String>,
    pub response_status: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// Input for recording a webhook event
#[derive(Debug, Clone)]
pub struct CreateWebhookEvent {
    pub trigger_id: Uuid,
    pub payload: serde_json::Value,
    pub headers: serde_json::Value,
    pub source_ip: Option<String>,
}

// ============================================
// Connection models
// ============================================

/// Credential instance referenced by nodes via `connection_id`
///
/// The engine only reads the configuration and hands it to the node's
/// execute; interpreting it is the node's concern.
#[derive(Debug, Clone, FromRow)]
pub struct ConnectionRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub provider: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a connection
#[derive(Debug, Clone)]
pub struct CreateConnection {
    pub owner_id: Uuid,
    pub name: String,
    pub provider: String,
    pub config: serde_json::Value,
}

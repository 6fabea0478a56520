//! EngineStore trait definition

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use gantry_core::{RunStatus, VariableScope, WorkerStatus};

use crate::models::*;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Run not found
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Step not found
    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    /// Queue item not found
    #[error("queue item not found: {0}")]
    ItemNotFound(Uuid),

    /// Workflow or version not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic precondition failed (row not in the expected status)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn database(e: impl std::fmt::Display) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Outcome of nacking a queue item
#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    /// The item was returned to the queue
    Requeued {
        attempt: u32,
        available_at: DateTime<Utc>,
    },

    /// Delivery attempts exhausted; the owning step/run was marked failed
    /// and a `complete_run` item enqueued
    Exhausted,
}

/// Advisory-lock key for the cluster-wide reaper/scheduler leader
pub const LEADER_KEY: i64 = 0x6761_6e74_7279_0001;

/// Store for engine state and the work queue
///
/// Implementations must be thread-safe. The queue lives in the same store as
/// run state so enqueue + state change commit atomically; the store is the
/// authority for "now" during claiming.
#[async_trait]
pub trait EngineStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Create a workflow; its definition becomes the initial draft
    async fn create_workflow(&self, input: CreateWorkflow) -> Result<WorkflowRow, StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRow>, StoreError>;

    async fn list_workflows(&self, owner_id: Option<Uuid>) -> Result<Vec<WorkflowRow>, StoreError>;

    async fn rename_workflow(&self, id: Uuid, name: &str)
        -> Result<Option<WorkflowRow>, StoreError>;

    /// Delete a workflow and, by ownership cascade, its versions, draft,
    /// triggers, runs, steps, and queue items
    async fn delete_workflow(&self, id: Uuid) -> Result<bool, StoreError>;

    // =========================================================================
    // Draft Operations
    // =========================================================================

    async fn get_draft(&self, workflow_id: Uuid) -> Result<Option<DraftRow>, StoreError>;

    /// Replace the draft, bumping `updated_at`
    async fn put_draft(
        &self,
        workflow_id: Uuid,
        definition: serde_json::Value,
    ) -> Result<DraftRow, StoreError>;

    // =========================================================================
    // Version Operations
    // =========================================================================

    /// Snapshot a definition into a new immutable version
    /// (auto-increments `version_number`)
    async fn create_version(
        &self,
        workflow_id: Uuid,
        definition: serde_json::Value,
    ) -> Result<WorkflowVersionRow, StoreError>;

    async fn list_versions(&self, workflow_id: Uuid)
        -> Result<Vec<WorkflowVersionRow>, StoreError>;

    async fn get_version(&self, version_id: Uuid)
        -> Result<Option<WorkflowVersionRow>, StoreError>;

    async fn get_version_by_number(
        &self,
        workflow_id: Uuid,
        version_number: i32,
    ) -> Result<Option<WorkflowVersionRow>, StoreError>;

    /// The version with `is_current = true`, if any
    async fn current_version(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowVersionRow>, StoreError>;

    /// Atomically flip `is_current` so new triggers use this version
    async fn deploy_version(
        &self,
        workflow_id: Uuid,
        version_number: i32,
    ) -> Result<WorkflowVersionRow, StoreError>;

    // =========================================================================
    // Trigger Operations
    // =========================================================================

    async fn create_trigger(&self, input: CreateTrigger) -> Result<TriggerRow, StoreError>;

    async fn get_trigger(&self, id: Uuid) -> Result<Option<TriggerRow>, StoreError>;

    async fn get_trigger_by_token(&self, token: &str) -> Result<Option<TriggerRow>, StoreError>;

    async fn list_triggers(
        &self,
        provider: Option<&str>,
        enabled_only: bool,
    ) -> Result<Vec<TriggerRow>, StoreError>;

    async fn list_workflow_triggers(&self, workflow_id: Uuid)
        -> Result<Vec<TriggerRow>, StoreError>;

    async fn set_trigger_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, StoreError>;

    /// Update `last_checked` to now
    async fn touch_trigger(&self, id: Uuid) -> Result<(), StoreError>;

    async fn delete_workflow_triggers(&self, workflow_id: Uuid) -> Result<u64, StoreError>;

    // =========================================================================
    // Run Operations
    // =========================================================================

    /// Create a run row and its `start_run` queue item in one transaction
    ///
    /// A trigger firing either produces exactly one run row and one item, or
    /// neither.
    async fn create_run(&self, input: CreateRun) -> Result<RunRow, StoreError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<RunRow>, StoreError>;

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunRow>, StoreError>;

    /// `pending` → `running` with an optimistic status precondition; records
    /// the starting worker and `started_at`
    async fn mark_run_running(&self, id: Uuid, worker_id: Uuid) -> Result<bool, StoreError>;

    /// Refresh the run-level worker heartbeat
    async fn heartbeat_run(&self, id: Uuid, worker_id: Uuid) -> Result<(), StoreError>;

    /// Move a run to a terminal status; no-op (false) if already terminal
    async fn finish_run(
        &self,
        id: Uuid,
        status: RunStatus,
        output_data: Option<serde_json::Value>,
        error_data: Option<serde_json::Value>,
    ) -> Result<bool, StoreError>;

    /// `pending`/`running` → `cancelled`; false if already terminal
    async fn cancel_run(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Reserve `count` consecutive step numbers; returns the first
    ///
    /// Also advances the run's `total_steps` counter, which the coordinator
    /// checks against `max_steps_per_run`.
    async fn allocate_step_numbers(&self, run_id: Uuid, count: i32) -> Result<i32, StoreError>;

    /// Running runs whose `started_at + timeout_seconds` has passed
    async fn list_overdue_runs(&self, now: DateTime<Utc>) -> Result<Vec<RunRow>, StoreError>;

    // =========================================================================
    // Step Operations
    // =========================================================================

    /// Insert a step; returns `None` when a step for the same
    /// `(run_id, node_id, iteration_index)` already exists
    async fn create_step(&self, input: CreateStep) -> Result<Option<StepRow>, StoreError>;

    async fn get_step(&self, id: Uuid) -> Result<Option<StepRow>, StoreError>;

    async fn get_step_by_node(
        &self,
        run_id: Uuid,
        node_id: &str,
        iteration_index: i32,
    ) -> Result<Option<StepRow>, StoreError>;

    /// Steps of a run ordered by `step_number`
    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRow>, StoreError>;

    /// `pending` → `running`, incrementing `attempt_count`; returns the
    /// updated row or `None` if the step was not pending
    async fn mark_step_running(
        &self,
        id: Uuid,
        worker_id: Uuid,
    ) -> Result<Option<StepRow>, StoreError>;

    /// `running` → `completed`, persisting the output envelope
    async fn complete_step(
        &self,
        id: Uuid,
        output_envelope: serde_json::Value,
        chosen_handle: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// `running` → `failed` (terminal)
    ///
    /// `output_envelope`, when given, is the input envelope with the failure
    /// appended to its error trail, kept so error-handling nodes downstream
    /// can consume it.
    async fn fail_step(
        &self,
        id: Uuid,
        error_details: serde_json::Value,
        output_envelope: Option<serde_json::Value>,
    ) -> Result<bool, StoreError>;

    /// Reassign a `running` step to the worker holding its requeued item
    ///
    /// Used after a lease reap: the original worker died mid-execution, so
    /// the step never left `running`. The attempt count is preserved (the
    /// node must be idempotent). Steps suspended on a child run are not
    /// taken over.
    async fn reassign_running_step(
        &self,
        id: Uuid,
        worker_id: Uuid,
    ) -> Result<Option<StepRow>, StoreError>;

    /// `running` → `pending` with a future `next_retry_at`
    ///
    /// Permitted only while `attempt_count < max_attempts`.
    async fn schedule_step_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        error_details: serde_json::Value,
    ) -> Result<bool, StoreError>;

    /// Record that a running step is suspended on a child run
    async fn set_step_waiting(&self, id: Uuid, child_run_id: Uuid) -> Result<bool, StoreError>;

    /// Mark every non-terminal step of a run `skipped` (cancellation)
    async fn skip_non_terminal_steps(&self, run_id: Uuid) -> Result<u64, StoreError>;

    async fn count_non_terminal_steps(&self, run_id: Uuid) -> Result<i64, StoreError>;

    /// Record an additional fan-in dependency on an existing step
    async fn append_step_dependency(&self, id: Uuid, dep: Uuid) -> Result<(), StoreError>;

    // =========================================================================
    // Queue Operations
    // =========================================================================

    /// Enqueue a work item
    async fn enqueue(&self, item: EnqueueItem) -> Result<QueueItemRow, StoreError>;

    /// Atomically claim up to `max_items` claimable items
    ///
    /// An item is claimable iff unclaimed and `available_at <= now`, and its
    /// `node_type` (when step-bound) is within the worker's capability set
    /// (an empty set matches everything). Ordered by
    /// `(priority DESC, available_at ASC, created_at ASC)`. Two workers can
    /// never claim the same item.
    async fn claim_items(
        &self,
        worker_id: Uuid,
        capabilities: &[String],
        max_items: usize,
    ) -> Result<Vec<QueueItemRow>, StoreError>;

    /// Delete a handled item
    async fn ack_item(&self, id: Uuid) -> Result<(), StoreError>;

    /// Return an item to the queue after a delivery failure
    ///
    /// Increments `attempt_count`. Once attempts are exhausted the owning
    /// step/run is marked failed and a `complete_run` item is enqueued, all
    /// in the same transaction.
    async fn nack_item(
        &self,
        id: Uuid,
        reason: &str,
        backoff: Duration,
    ) -> Result<NackOutcome, StoreError>;

    /// Release items held by workers whose heartbeat predates the deadline
    async fn reap_expired_leases(
        &self,
        heartbeat_deadline: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Remove every queue item of a run (cancellation)
    async fn purge_run_items(&self, run_id: Uuid) -> Result<u64, StoreError>;

    /// Outstanding items for a run, optionally excluding the one in hand
    async fn count_outstanding_items(
        &self,
        run_id: Uuid,
        exclude: Option<Uuid>,
    ) -> Result<i64, StoreError>;

    // =========================================================================
    // Worker Registry Operations
    // =========================================================================

    /// Register (or re-register) a worker
    async fn register_worker(&self, input: RegisterWorker) -> Result<WorkerRow, StoreError>;

    async fn worker_heartbeat(
        &self,
        id: Uuid,
        current_step_count: i32,
        status: WorkerStatus,
    ) -> Result<bool, StoreError>;

    async fn get_worker(&self, id: Uuid) -> Result<Option<WorkerRow>, StoreError>;

    async fn list_workers(&self) -> Result<Vec<WorkerRow>, StoreError>;

    /// Clean exit: mark the worker `dead`
    async fn deregister_worker(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Mark workers with stale heartbeats `dead`; returns their ids
    async fn mark_dead_workers(
        &self,
        heartbeat_deadline: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;

    // =========================================================================
    // Variable Operations
    // =========================================================================

    async fn get_variable(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    async fn set_variable(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn delete_variable(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
    ) -> Result<(), StoreError>;

    async fn list_variables(
        &self,
        scope: VariableScope,
        scope_key: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>, StoreError>;

    /// Drop every variable of one scope instance (run cleanup)
    async fn clear_scope_variables(
        &self,
        scope: VariableScope,
        scope_key: &str,
    ) -> Result<u64, StoreError>;

    // =========================================================================
    // Webhook Event Operations
    // =========================================================================

    async fn record_webhook_event(
        &self,
        input: CreateWebhookEvent,
    ) -> Result<WebhookEventRow, StoreError>;

    async fn set_webhook_event_status(&self, id: Uuid, status: i32) -> Result<(), StoreError>;

    // =========================================================================
    // Connection Operations
    // =========================================================================

    async fn create_connection(&self, input: CreateConnection)
        -> Result<ConnectionRow, StoreError>;

    async fn get_connection(&self, id: Uuid) -> Result<Option<ConnectionRow>, StoreError>;

    async fn list_connections(
        &self,
        owner_id: Option<Uuid>,
    ) -> Result<Vec<ConnectionRow>, StoreError>;

    async fn delete_connection(&self, id: Uuid) -> Result<bool, StoreError>;

    // =========================================================================
    // Leader Election
    // =========================================================================

    /// Try to become (or stay) the holder of the cluster-wide lock `key`
    ///
    /// The holder runs the reaper and the cron scheduler; fail-over is
    /// automatic when the lock is released or the holder's session dies.
    async fn try_acquire_leadership(&self, key: i64, holder: Uuid) -> Result<bool, StoreError>;

    /// Release the lock if `holder` owns it
    async fn release_leadership(&self, key: i64, holder: Uuid) -> Result<(), StoreError>;
}

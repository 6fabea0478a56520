//! In-memory implementation of EngineStore for testing
//!
//! Provides the same semantics as the PostgreSQL implementation: exclusive
//! claims, optimistic status preconditions, nack escalation, and lease
//! reaping. A single write lock stands in for transaction isolation.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use gantry_core::{QueueType, RunStatus, StepStatus, VariableScope, WorkerStatus};

use crate::models::*;
use crate::store::{EngineStore, NackOutcome, StoreError};

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, WorkflowRow>,
    drafts: HashMap<Uuid, DraftRow>,
    versions: HashMap<Uuid, WorkflowVersionRow>,
    triggers: HashMap<Uuid, TriggerRow>,
    runs: HashMap<Uuid, RunRow>,
    steps: HashMap<Uuid, StepRow>,
    items: HashMap<Uuid, QueueItemRow>,
    workers: HashMap<Uuid, WorkerRow>,
    variables: BTreeMap<(String, String, String), serde_json::Value>,
    webhook_events: HashMap<Uuid, WebhookEventRow>,
    connections: HashMap<Uuid, ConnectionRow>,
    leaders: HashMap<i64, Uuid>,
}

/// In-memory implementation of EngineStore
///
/// # Example
///
/// ```
/// use gantry_storage::InMemoryEngineStore;
///
/// let store = InMemoryEngineStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryEngineStore {
    inner: RwLock<Inner>,
}

impl InMemoryEngineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unclaimed, currently claimable items
    pub fn claimable_item_count(&self) -> usize {
        let now = Utc::now();
        self.inner
            .read()
            .items
            .values()
            .filter(|i| i.claimed_at.is_none() && i.available_at <= now)
            .count()
    }

    /// Total queue items, claimed or not
    pub fn item_count(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn run_count(&self) -> usize {
        self.inner.read().runs.len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }
}

fn exhausted_error(reason: &str) -> serde_json::Value {
    serde_json::json!({
        "reason": gantry_core::error::reason::DELIVERY_EXHAUSTED,
        "message": reason,
    })
}

impl Inner {
    fn finish_run_locked(
        &mut self,
        id: Uuid,
        status: RunStatus,
        output_data: Option<serde_json::Value>,
        error_data: Option<serde_json::Value>,
    ) -> Result<bool, StoreError> {
        let run = self.runs.get_mut(&id).ok_or(StoreError::RunNotFound(id))?;
        let current: RunStatus = run.status.parse().map_err(StoreError::Database)?;
        if current.is_terminal() {
            return Ok(false);
        }

        run.status = status.to_string();
        run.completed_at = Some(Utc::now());
        if output_data.is_some() {
            run.output_data = output_data;
        }
        if error_data.is_some() {
            run.error_data = error_data;
        }
        Ok(true)
    }

    fn enqueue_locked(&mut self, item: EnqueueItem) -> QueueItemRow {
        let row = QueueItemRow {
            id: Uuid::now_v7(),
            run_id: item.run_id,
            step_id: item.step_id,
            queue_type: item.queue_type.to_string(),
            node_type: item.node_type,
            priority: item
                .priority
                .unwrap_or_else(|| item.queue_type.default_priority()),
            available_at: item.available_at.unwrap_or_else(Utc::now),
            created_at: Utc::now(),
            claimed_at: None,
            claimed_by: None,
            attempt_count: 0,
            max_attempts: item.max_attempts,
            last_error: None,
            payload: item.payload,
        };
        self.items.insert(row.id, row.clone());
        row
    }
}

#[async_trait]
impl EngineStore for InMemoryEngineStore {
    // =========================================================================
    // Workflows
    // =========================================================================

    async fn create_workflow(&self, input: CreateWorkflow) -> Result<WorkflowRow, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let row = WorkflowRow {
            id: Uuid::now_v7(),
            owner_id: input.owner_id,
            name: input.name,
            created_at: now,
            updated_at: now,
        };
        inner.drafts.insert(
            row.id,
            DraftRow {
                workflow_id: row.id,
                definition: input.definition,
                updated_at: now,
            },
        );
        inner.workflows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRow>, StoreError> {
        Ok(self.inner.read().workflows.get(&id).cloned())
    }

    async fn list_workflows(&self, owner_id: Option<Uuid>) -> Result<Vec<WorkflowRow>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<WorkflowRow> = inner
            .workflows
            .values()
            .filter(|w| owner_id.is_none_or(|o| w.owner_id == o))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn rename_workflow(
        &self,
        id: Uuid,
        name: &str,
    ) -> Result<Option<WorkflowRow>, StoreError> {
        let mut inner = self.inner.write();
        Ok(inner.workflows.get_mut(&id).map(|w| {
            w.name = name.to_string();
            w.updated_at = Utc::now();
            w.clone()
        }))
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let existed = inner.workflows.remove(&id).is_some();
        if existed {
            inner.drafts.remove(&id);
            inner.versions.retain(|_, v| v.workflow_id != id);
            inner.triggers.retain(|_, t| t.workflow_id != id);
            let run_ids: Vec<Uuid> = inner
                .runs
                .values()
                .filter(|r| r.workflow_id == id)
                .map(|r| r.id)
                .collect();
            inner.runs.retain(|_, r| r.workflow_id != id);
            inner.steps.retain(|_, s| !run_ids.contains(&s.run_id));
            inner.items.retain(|_, i| !run_ids.contains(&i.run_id));
        }
        Ok(existed)
    }

    // =========================================================================
    // Drafts
    // =========================================================================

    async fn get_draft(&self, workflow_id: Uuid) -> Result<Option<DraftRow>, StoreError> {
        Ok(self.inner.read().drafts.get(&workflow_id).cloned())
    }

    async fn put_draft(
        &self,
        workflow_id: Uuid,
        definition: serde_json::Value,
    ) -> Result<DraftRow, StoreError> {
        let mut inner = self.inner.write();
        let row = DraftRow {
            workflow_id,
            definition,
            updated_at: Utc::now(),
        };
        inner.drafts.insert(workflow_id, row.clone());
        Ok(row)
    }

    // =========================================================================
    // Versions
    // =========================================================================

    async fn create_version(
        &self,
        workflow_id: Uuid,
        definition: serde_json::Value,
    ) -> Result<WorkflowVersionRow, StoreError> {
        let mut inner = self.inner.write();
        if !inner.workflows.contains_key(&workflow_id) {
            return Err(StoreError::NotFound(format!("workflow {}", workflow_id)));
        }

        let next = inner
            .versions
            .values()
            .filter(|v| v.workflow_id == workflow_id)
            .map(|v| v.version_number)
            .max()
            .unwrap_or(0)
            + 1;

        let row = WorkflowVersionRow {
            id: Uuid::now_v7(),
            workflow_id,
            version_number: next,
            definition,
            is_current: false,
            created_at: Utc::now(),
        };
        inner.versions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn list_versions(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowVersionRow>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<WorkflowVersionRow> = inner
            .versions
            .values()
            .filter(|v| v.workflow_id == workflow_id)
            .cloned()
            .collect();
        rows.sort_by_key(|v| v.version_number);
        Ok(rows)
    }

    async fn get_version(
        &self,
        version_id: Uuid,
    ) -> Result<Option<WorkflowVersionRow>, StoreError> {
        Ok(self.inner.read().versions.get(&version_id).cloned())
    }

    async fn get_version_by_number(
        &self,
        workflow_id: Uuid,
        version_number: i32,
    ) -> Result<Option<WorkflowVersionRow>, StoreError> {
        Ok(self
            .inner
            .read()
            .versions
            .values()
            .find(|v| v.workflow_id == workflow_id && v.version_number == version_number)
            .cloned())
    }

    async fn current_version(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowVersionRow>, StoreError> {
        Ok(self
            .inner
            .read()
            .versions
            .values()
            .find(|v| v.workflow_id == workflow_id && v.is_current)
            .cloned())
    }

    async fn deploy_version(
        &self,
        workflow_id: Uuid,
        version_number: i32,
    ) -> Result<WorkflowVersionRow, StoreError> {
        let mut inner = self.inner.write();

        let target_id = inner
            .versions
            .values()
            .find(|v| v.workflow_id == workflow_id && v.version_number == version_number)
            .map(|v| v.id)
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "version {} of workflow {}",
                    version_number, workflow_id
                ))
            })?;

        for version in inner.versions.values_mut() {
            if version.workflow_id == workflow_id {
                version.is_current = version.id == target_id;
            }
        }

        Ok(inner.versions.get(&target_id).cloned().unwrap())
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    async fn create_trigger(&self, input: CreateTrigger) -> Result<TriggerRow, StoreError> {
        let mut inner = self.inner.write();
        let row = TriggerRow {
            id: Uuid::now_v7(),
            workflow_id: input.workflow_id,
            provider: input.provider,
            node_id: input.node_id,
            config: input.config,
            token: input.token,
            enabled: input.enabled,
            last_checked: None,
            created_at: Utc::now(),
        };
        inner.triggers.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_trigger(&self, id: Uuid) -> Result<Option<TriggerRow>, StoreError> {
        Ok(self.inner.read().triggers.get(&id).cloned())
    }

    async fn get_trigger_by_token(&self, token: &str) -> Result<Option<TriggerRow>, StoreError> {
        Ok(self
            .inner
            .read()
            .triggers
            .values()
            .find(|t| t.token.as_deref() == Some(token))
            .cloned())
    }

    async fn list_triggers(
        &self,
        provider: Option<&str>,
        enabled_only: bool,
    ) -> Result<Vec<TriggerRow>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<TriggerRow> = inner
            .triggers
            .values()
            .filter(|t| provider.is_none_or(|p| t.provider == p))
            .filter(|t| !enabled_only || t.enabled)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.created_at);
        Ok(rows)
    }

    async fn list_workflow_triggers(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<TriggerRow>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<TriggerRow> = inner
            .triggers
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.created_at);
        Ok(rows)
    }

    async fn set_trigger_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        Ok(inner
            .triggers
            .get_mut(&id)
            .map(|t| {
                t.enabled = enabled;
            })
            .is_some())
    }

    async fn touch_trigger(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(trigger) = inner.triggers.get_mut(&id) {
            trigger.last_checked = Some(Utc::now());
        }
        Ok(())
    }

    async fn delete_workflow_triggers(&self, workflow_id: Uuid) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let before = inner.triggers.len();
        inner.triggers.retain(|_, t| t.workflow_id != workflow_id);
        Ok((before - inner.triggers.len()) as u64)
    }

    // =========================================================================
    // Runs
    // =========================================================================

    async fn create_run(&self, input: CreateRun) -> Result<RunRow, StoreError> {
        let mut inner = self.inner.write();
        let row = RunRow {
            id: Uuid::now_v7(),
            workflow_id: input.workflow_id,
            version_id: input.version_id,
            trigger_id: input.trigger_id,
            parent_step_id: input.parent_step_id,
            status: RunStatus::Pending.to_string(),
            input_data: input.input_data,
            variables: input.variables,
            retry_policy: input.retry_policy,
            timeout_seconds: input.timeout_seconds,
            assigned_worker_id: None,
            worker_heartbeat_at: None,
            next_step_number: 1,
            total_steps: 0,
            completed_steps: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output_data: None,
            error_data: None,
        };
        inner.runs.insert(row.id, row.clone());

        // Run row + start_run item appear together or not at all
        inner.enqueue_locked(
            EnqueueItem::new(row.id, QueueType::StartRun)
                .with_payload(serde_json::json!({ "entry_node_id": input.entry_node_id })),
        );

        Ok(row)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<RunRow>, StoreError> {
        Ok(self.inner.read().runs.get(&id).cloned())
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunRow>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<RunRow> = inner
            .runs
            .values()
            .filter(|r| filter.workflow_id.is_none_or(|w| r.workflow_id == w))
            .filter(|r| filter.status.as_deref().is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = filter.offset.max(0) as usize;
        let limit = if filter.limit <= 0 { 50 } else { filter.limit } as usize;
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn mark_run_running(&self, id: Uuid, worker_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let run = inner.runs.get_mut(&id).ok_or(StoreError::RunNotFound(id))?;
        if run.status != RunStatus::Pending.to_string() {
            return Ok(false);
        }
        run.status = RunStatus::Running.to_string();
        run.assigned_worker_id = Some(worker_id);
        run.worker_heartbeat_at = Some(Utc::now());
        run.started_at.get_or_insert_with(Utc::now);
        Ok(true)
    }

    async fn heartbeat_run(&self, id: Uuid, worker_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(run) = inner.runs.get_mut(&id) {
            if run.status == RunStatus::Running.to_string() {
                run.worker_heartbeat_at = Some(Utc::now());
                run.assigned_worker_id = Some(worker_id);
            }
        }
        Ok(())
    }

    async fn finish_run(
        &self,
        id: Uuid,
        status: RunStatus,
        output_data: Option<serde_json::Value>,
        error_data: Option<serde_json::Value>,
    ) -> Result<bool, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "finish_run requires a terminal status, got {}",
                status
            )));
        }
        self.inner
            .write()
            .finish_run_locked(id, status, output_data, error_data)
    }

    async fn cancel_run(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner
            .write()
            .finish_run_locked(id, RunStatus::Cancelled, None, None)
    }

    async fn allocate_step_numbers(&self, run_id: Uuid, count: i32) -> Result<i32, StoreError> {
        let mut inner = self.inner.write();
        let run = inner
            .runs
            .get_mut(&run_id)
            .ok_or(StoreError::RunNotFound(run_id))?;
        let first = run.next_step_number;
        run.next_step_number += count;
        run.total_steps += count;
        Ok(first)
    }

    async fn list_overdue_runs(&self, now: DateTime<Utc>) -> Result<Vec<RunRow>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running.to_string())
            .filter(|r| match (r.timeout_seconds, r.started_at) {
                (Some(timeout), Some(started)) => {
                    started + chrono::Duration::seconds(timeout) < now
                }
                _ => false,
            })
            .cloned()
            .collect())
    }

    // =========================================================================
    // Steps
    // =========================================================================

    async fn create_step(&self, input: CreateStep) -> Result<Option<StepRow>, StoreError> {
        let mut inner = self.inner.write();

        let exists = inner.steps.values().any(|s| {
            s.run_id == input.run_id
                && s.node_id == input.node_id
                && s.iteration_index == input.iteration_index
        });
        if exists {
            return Ok(None);
        }

        let row = StepRow {
            id: Uuid::now_v7(),
            run_id: input.run_id,
            node_id: input.node_id,
            node_type: input.node_type,
            step_number: input.step_number,
            iteration_index: input.iteration_index,
            status: StepStatus::Pending.to_string(),
            attempt_count: 0,
            max_attempts: input.max_attempts,
            input_envelope: input.input_envelope,
            output_envelope: None,
            chosen_handle: None,
            error_details: None,
            assigned_worker_id: None,
            waiting_on_run: None,
            depends_on: input.depends_on,
            next_retry_at: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        inner.steps.insert(row.id, row.clone());
        Ok(Some(row))
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<StepRow>, StoreError> {
        Ok(self.inner.read().steps.get(&id).cloned())
    }

    async fn get_step_by_node(
        &self,
        run_id: Uuid,
        node_id: &str,
        iteration_index: i32,
    ) -> Result<Option<StepRow>, StoreError> {
        Ok(self
            .inner
            .read()
            .steps
            .values()
            .find(|s| {
                s.run_id == run_id && s.node_id == node_id && s.iteration_index == iteration_index
            })
            .cloned())
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRow>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<StepRow> = inner
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.step_number);
        Ok(rows)
    }

    async fn mark_step_running(
        &self,
        id: Uuid,
        worker_id: Uuid,
    ) -> Result<Option<StepRow>, StoreError> {
        let mut inner = self.inner.write();
        let Some(step) = inner.steps.get_mut(&id) else {
            return Ok(None);
        };
        if step.status != StepStatus::Pending.to_string() {
            return Ok(None);
        }
        step.status = StepStatus::Running.to_string();
        step.attempt_count += 1;
        step.assigned_worker_id = Some(worker_id);
        step.started_at.get_or_insert_with(Utc::now);
        step.next_retry_at = None;
        Ok(Some(step.clone()))
    }

    async fn complete_step(
        &self,
        id: Uuid,
        output_envelope: serde_json::Value,
        chosen_handle: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let Some(step) = inner.steps.get_mut(&id) else {
            return Ok(false);
        };
        if step.status != StepStatus::Running.to_string() {
            return Ok(false);
        }
        step.status = StepStatus::Completed.to_string();
        step.output_envelope = Some(output_envelope);
        step.chosen_handle = chosen_handle.map(String::from);
        step.waiting_on_run = None;
        step.completed_at = Some(Utc::now());

        let run_id = step.run_id;
        if let Some(run) = inner.runs.get_mut(&run_id) {
            run.completed_steps += 1;
        }
        Ok(true)
    }

    async fn fail_step(
        &self,
        id: Uuid,
        error_details: serde_json::Value,
        output_envelope: Option<serde_json::Value>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let Some(step) = inner.steps.get_mut(&id) else {
            return Ok(false);
        };
        let status: StepStatus = step.status.parse().map_err(StoreError::Database)?;
        if status.is_terminal() {
            return Ok(false);
        }
        step.status = StepStatus::Failed.to_string();
        step.error_details = Some(error_details);
        if output_envelope.is_some() {
            step.output_envelope = output_envelope;
        }
        step.waiting_on_run = None;
        step.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn reassign_running_step(
        &self,
        id: Uuid,
        worker_id: Uuid,
    ) -> Result<Option<StepRow>, StoreError> {
        let mut inner = self.inner.write();
        let Some(step) = inner.steps.get_mut(&id) else {
            return Ok(None);
        };
        if step.status != StepStatus::Running.to_string() || step.waiting_on_run.is_some() {
            return Ok(None);
        }
        step.assigned_worker_id = Some(worker_id);
        Ok(Some(step.clone()))
    }

    async fn schedule_step_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        error_details: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let Some(step) = inner.steps.get_mut(&id) else {
            return Ok(false);
        };
        if step.status != StepStatus::Running.to_string()
            || step.attempt_count >= step.max_attempts
        {
            return Ok(false);
        }
        step.status = StepStatus::Pending.to_string();
        step.next_retry_at = Some(next_retry_at);
        step.error_details = Some(error_details);
        step.assigned_worker_id = None;
        Ok(true)
    }

    async fn set_step_waiting(&self, id: Uuid, child_run_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let Some(step) = inner.steps.get_mut(&id) else {
            return Ok(false);
        };
        if step.status != StepStatus::Running.to_string() {
            return Ok(false);
        }
        step.waiting_on_run = Some(child_run_id);
        Ok(true)
    }

    async fn skip_non_terminal_steps(&self, run_id: Uuid) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let mut skipped = 0;
        for step in inner.steps.values_mut().filter(|s| s.run_id == run_id) {
            let status: StepStatus = step.status.parse().map_err(StoreError::Database)?;
            if !status.is_terminal() {
                step.status = StepStatus::Skipped.to_string();
                step.completed_at = Some(Utc::now());
                skipped += 1;
            }
        }
        Ok(skipped)
    }

    async fn count_non_terminal_steps(&self, run_id: Uuid) -> Result<i64, StoreError> {
        let inner = self.inner.read();
        let count = inner
            .steps
            .values()
            .filter(|s| s.run_id == run_id)
            .filter(|s| {
                s.status == StepStatus::Pending.to_string()
                    || s.status == StepStatus::Running.to_string()
            })
            .count();
        Ok(count as i64)
    }

    async fn append_step_dependency(&self, id: Uuid, dep: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(step) = inner.steps.get_mut(&id) {
            if !step.depends_on.contains(&dep) {
                step.depends_on.push(dep);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Queue
    // =========================================================================

    async fn enqueue(&self, item: EnqueueItem) -> Result<QueueItemRow, StoreError> {
        Ok(self.inner.write().enqueue_locked(item))
    }

    async fn claim_items(
        &self,
        worker_id: Uuid,
        capabilities: &[String],
        max_items: usize,
    ) -> Result<Vec<QueueItemRow>, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let mut claimable: Vec<Uuid> = inner
            .items
            .values()
            .filter(|i| i.claimed_at.is_none() && i.available_at <= now)
            .filter(|i| match &i.node_type {
                None => true,
                Some(node_type) => {
                    capabilities.is_empty() || capabilities.iter().any(|c| c == node_type)
                }
            })
            .map(|i| i.id)
            .collect();

        claimable.sort_by(|a, b| {
            let ia = &inner.items[a];
            let ib = &inner.items[b];
            ib.priority
                .cmp(&ia.priority)
                .then(ia.available_at.cmp(&ib.available_at))
                .then(ia.created_at.cmp(&ib.created_at))
        });
        claimable.truncate(max_items);

        let mut claimed = Vec::with_capacity(claimable.len());
        for id in claimable {
            let item = inner.items.get_mut(&id).unwrap();
            item.claimed_at = Some(now);
            item.claimed_by = Some(worker_id);
            claimed.push(item.clone());
        }
        Ok(claimed)
    }

    async fn ack_item(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.write().items.remove(&id);
        Ok(())
    }

    async fn nack_item(
        &self,
        id: Uuid,
        reason: &str,
        backoff: Duration,
    ) -> Result<NackOutcome, StoreError> {
        let mut inner = self.inner.write();

        let (run_id, step_id, queue_type, next_attempt, max_attempts) = {
            let item = inner.items.get(&id).ok_or(StoreError::ItemNotFound(id))?;
            (
                item.run_id,
                item.step_id,
                item.queue_type.clone(),
                item.attempt_count + 1,
                item.max_attempts,
            )
        };

        if next_attempt < max_attempts {
            let available_at =
                Utc::now() + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
            let item = inner.items.get_mut(&id).unwrap();
            item.attempt_count = next_attempt;
            item.claimed_at = None;
            item.claimed_by = None;
            item.available_at = available_at;
            item.last_error = Some(reason.to_string());
            return Ok(NackOutcome::Requeued {
                attempt: next_attempt as u32,
                available_at,
            });
        }

        let error = exhausted_error(reason);
        if let Some(step_id) = step_id {
            if let Some(step) = inner.steps.get_mut(&step_id) {
                let status: StepStatus = step.status.parse().map_err(StoreError::Database)?;
                if !status.is_terminal() {
                    step.status = StepStatus::Failed.to_string();
                    step.error_details = Some(error);
                    step.completed_at = Some(Utc::now());
                }
            }
        } else {
            inner.finish_run_locked(run_id, RunStatus::Failed, None, Some(error))?;
        }

        inner.items.remove(&id);
        if queue_type != QueueType::CompleteRun.to_string() {
            inner.enqueue_locked(EnqueueItem::new(run_id, QueueType::CompleteRun));
        }
        Ok(NackOutcome::Exhausted)
    }

    async fn reap_expired_leases(
        &self,
        heartbeat_deadline: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.inner.write();

        let live_workers: Vec<Uuid> = inner
            .workers
            .values()
            .filter(|w| w.last_heartbeat >= heartbeat_deadline)
            .map(|w| w.id)
            .collect();

        let mut reaped = Vec::new();
        for item in inner.items.values_mut() {
            if item.claimed_at.is_some()
                && !item.claimed_by.map(|w| live_workers.contains(&w)).unwrap_or(false)
            {
                item.claimed_at = None;
                item.claimed_by = None;
                reaped.push(item.id);
            }
        }
        Ok(reaped)
    }

    async fn purge_run_items(&self, run_id: Uuid) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let before = inner.items.len();
        inner.items.retain(|_, i| i.run_id != run_id);
        Ok((before - inner.items.len()) as u64)
    }

    async fn count_outstanding_items(
        &self,
        run_id: Uuid,
        exclude: Option<Uuid>,
    ) -> Result<i64, StoreError> {
        let inner = self.inner.read();
        let count = inner
            .items
            .values()
            .filter(|i| i.run_id == run_id)
            .filter(|i| exclude.is_none_or(|e| i.id != e))
            .count();
        Ok(count as i64)
    }

    // =========================================================================
    // Workers
    // =========================================================================

    async fn register_worker(&self, input: RegisterWorker) -> Result<WorkerRow, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let row = WorkerRow {
            id: input.id,
            hostname: input.hostname,
            capabilities: input.capabilities,
            status: WorkerStatus::Idle.to_string(),
            max_concurrent_steps: input.max_concurrent_steps,
            current_step_count: 0,
            last_heartbeat: now,
            started_at: inner
                .workers
                .get(&input.id)
                .map(|w| w.started_at)
                .unwrap_or(now),
        };
        inner.workers.insert(row.id, row.clone());
        Ok(row)
    }

    async fn worker_heartbeat(
        &self,
        id: Uuid,
        current_step_count: i32,
        status: WorkerStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        Ok(inner
            .workers
            .get_mut(&id)
            .map(|w| {
                w.last_heartbeat = Utc::now();
                w.current_step_count = current_step_count;
                w.status = status.to_string();
            })
            .is_some())
    }

    async fn get_worker(&self, id: Uuid) -> Result<Option<WorkerRow>, StoreError> {
        Ok(self.inner.read().workers.get(&id).cloned())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRow>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<WorkerRow> = inner.workers.values().cloned().collect();
        rows.sort_by_key(|w| w.started_at);
        Ok(rows)
    }

    async fn deregister_worker(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        Ok(inner
            .workers
            .get_mut(&id)
            .map(|w| {
                w.status = WorkerStatus::Dead.to_string();
            })
            .is_some())
    }

    async fn mark_dead_workers(
        &self,
        heartbeat_deadline: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.inner.write();
        let mut dead = Vec::new();
        for worker in inner.workers.values_mut() {
            if worker.last_heartbeat < heartbeat_deadline
                && worker.status != WorkerStatus::Dead.to_string()
            {
                worker.status = WorkerStatus::Dead.to_string();
                dead.push(worker.id);
            }
        }
        Ok(dead)
    }

    // =========================================================================
    // Variables
    // =========================================================================

    async fn get_variable(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let key = (scope.to_string(), scope_key.to_string(), name.to_string());
        Ok(self.inner.read().variables.get(&key).cloned())
    }

    async fn set_variable(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let key = (scope.to_string(), scope_key.to_string(), name.to_string());
        self.inner.write().variables.insert(key, value);
        Ok(())
    }

    async fn delete_variable(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let key = (scope.to_string(), scope_key.to_string(), name.to_string());
        self.inner.write().variables.remove(&key);
        Ok(())
    }

    async fn list_variables(
        &self,
        scope: VariableScope,
        scope_key: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>, StoreError> {
        let scope = scope.to_string();
        let inner = self.inner.read();
        Ok(inner
            .variables
            .iter()
            .filter(|((s, k, _), _)| *s == scope && k == scope_key)
            .map(|((_, _, name), value)| (name.clone(), value.clone()))
            .collect())
    }

    async fn clear_scope_variables(
        &self,
        scope: VariableScope,
        scope_key: &str,
    ) -> Result<u64, StoreError> {
        let scope = scope.to_string();
        let mut inner = self.inner.write();
        let before = inner.variables.len();
        inner
            .variables
            .retain(|(s, k, _), _| !(*s == scope && k == scope_key));
        Ok((before - inner.variables.len()) as u64)
    }

    // =========================================================================
    // Webhook events
    // =========================================================================

    async fn record_webhook_event(
        &self,
        input: CreateWebhookEvent,
    ) -> Result<WebhookEventRow, StoreError> {
        let mut inner = self.inner.write();
        let row = WebhookEventRow {
            id: Uuid::now_v7(),
            trigger_id: input.trigger_id,
            payload: input.payload,
            headers: input.headers,
            source_ip: input.source_ip,
            response_status: None,
            created_at: Utc::now(),
        };
        inner.webhook_events.insert(row.id, row.clone());
        Ok(row)
    }

    async fn set_webhook_event_status(&self, id: Uuid, status: i32) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(event) = inner.webhook_events.get_mut(&id) {
            event.response_status = Some(status);
        }
        Ok(())
    }

    // =========================================================================
    // Connections
    // =========================================================================

    async fn create_connection(
        &self,
        input: CreateConnection,
    ) -> Result<ConnectionRow, StoreError> {
        let mut inner = self.inner.write();
        let row = ConnectionRow {
            id: Uuid::now_v7(),
            owner_id: input.owner_id,
            name: input.name,
            provider: input.provider,
            config: input.config,
            created_at: Utc::now(),
        };
        inner.connections.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_connection(&self, id: Uuid) -> Result<Option<ConnectionRow>, StoreError> {
        Ok(self.inner.read().connections.get(&id).cloned())
    }

    async fn list_connections(
        &self,
        owner_id: Option<Uuid>,
    ) -> Result<Vec<ConnectionRow>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<ConnectionRow> = inner
            .connections
            .values()
            .filter(|c| owner_id.is_none_or(|o| c.owner_id == o))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn delete_connection(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.inner.write().connections.remove(&id).is_some())
    }

    // =========================================================================
    // Leader election
    // =========================================================================

    async fn try_acquire_leadership(&self, key: i64, holder: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        match inner.leaders.get(&key) {
            Some(current) => Ok(*current == holder),
            None => {
                inner.leaders.insert(key, holder);
                Ok(true)
            }
        }
    }

    async fn release_leadership(&self, key: i64, holder: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner.leaders.get(&key) == Some(&holder) {
            inner.leaders.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded_run(store: &InMemoryEngineStore) -> RunRow {
        let workflow = store
            .create_workflow(CreateWorkflow {
                owner_id: Uuid::now_v7(),
                name: "wf".into(),
                definition: json!({"nodes": [], "edges": []}),
            })
            .await
            .unwrap();
        let version = store
            .create_version(workflow.id, json!({"nodes": [], "edges": []}))
            .await
            .unwrap();
        store
            .create_run(CreateRun {
                workflow_id: workflow.id,
                version_id: version.id,
                trigger_id: None,
                parent_step_id: None,
                input_data: json!({}),
                variables: json!({}),
                retry_policy: json!({}),
                timeout_seconds: None,
                entry_node_id: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_run_enqueues_start_item() {
        let store = InMemoryEngineStore::new();
        let run = seeded_run(&store).await;

        assert_eq!(store.item_count(), 1);
        let items = store
            .claim_items(Uuid::now_v7(), &[], 10)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].run_id, run.id);
        assert_eq!(items[0].queue_type, "start_run");
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemoryEngineStore::new();
        seeded_run(&store).await;

        let worker_a = Uuid::now_v7();
        let worker_b = Uuid::now_v7();

        let a = store.claim_items(worker_a, &[], 10).await.unwrap();
        let b = store.claim_items(worker_b, &[], 10).await.unwrap();

        assert_eq!(a.len(), 1);
        assert!(b.is_empty(), "second worker must not claim the same item");
    }

    #[tokio::test]
    async fn test_claim_respects_capabilities() {
        let store = InMemoryEngineStore::new();
        let run = seeded_run(&store).await;
        // Consume the start_run item
        let bootstrap = store.claim_items(Uuid::now_v7(), &[], 10).await.unwrap();
        store.ack_item(bootstrap[0].id).await.unwrap();

        let step = store
            .create_step(CreateStep {
                run_id: run.id,
                node_id: "n1".into(),
                node_type: "llm".into(),
                step_number: 1,
                iteration_index: 0,
                max_attempts: 3,
                input_envelope: json!({}),
                depends_on: vec![],
            })
            .await
            .unwrap()
            .unwrap();
        store
            .enqueue(
                EnqueueItem::new(run.id, QueueType::ExecuteStep).for_step(step.id, "llm"),
            )
            .await
            .unwrap();

        let plain = store
            .claim_items(Uuid::now_v7(), &["http_request".into()], 10)
            .await
            .unwrap();
        assert!(plain.is_empty(), "worker without the capability must not claim");

        let gpu = store
            .claim_items(Uuid::now_v7(), &["llm".into()], 10)
            .await
            .unwrap();
        assert_eq!(gpu.len(), 1);
    }

    #[tokio::test]
    async fn test_nack_requeues_with_backoff() {
        let store = InMemoryEngineStore::new();
        seeded_run(&store).await;
        let worker = Uuid::now_v7();

        let items = store.claim_items(worker, &[], 1).await.unwrap();
        let outcome = store
            .nack_item(items[0].id, "store hiccup", Duration::from_secs(30))
            .await
            .unwrap();

        match outcome {
            NackOutcome::Requeued { attempt, .. } => assert_eq!(attempt, 1),
            other => panic!("expected requeue, got {:?}", other),
        }
        // Backed off: not yet claimable
        assert_eq!(store.claimable_item_count(), 0);
        assert_eq!(store.item_count(), 1);
    }

    #[tokio::test]
    async fn test_nack_exhaustion_fails_run() {
        let store = InMemoryEngineStore::new();
        let run = seeded_run(&store).await;
        let worker = Uuid::now_v7();

        let mut outcome = NackOutcome::Exhausted;
        for _ in 0..5 {
            let items = store.claim_items(worker, &[], 1).await.unwrap();
            let start = items.iter().find(|i| i.queue_type == "start_run");
            let Some(item) = start else { break };
            outcome = store
                .nack_item(item.id, "boom", Duration::ZERO)
                .await
                .unwrap();
        }

        assert_eq!(outcome, NackOutcome::Exhausted);
        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(run.status, "failed");
        // A complete_run item was left for finalization
        let items = store.claim_items(worker, &[], 10).await.unwrap();
        assert!(items.iter().any(|i| i.queue_type == "complete_run"));
    }

    #[tokio::test]
    async fn test_reap_returns_items_from_dead_workers() {
        let store = InMemoryEngineStore::new();
        seeded_run(&store).await;

        let worker = Uuid::now_v7();
        store
            .register_worker(RegisterWorker {
                id: worker,
                hostname: "host-a".into(),
                capabilities: vec![],
                max_concurrent_steps: 4,
            })
            .await
            .unwrap();

        let items = store.claim_items(worker, &[], 10).await.unwrap();
        assert_eq!(items.len(), 1);

        // Heartbeat is current: nothing to reap
        let reaped = store
            .reap_expired_leases(Utc::now() - chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(reaped.is_empty());

        // Deadline in the future makes the heartbeat stale
        let reaped = store
            .reap_expired_leases(Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(store.claimable_item_count(), 1);
    }

    #[tokio::test]
    async fn test_terminal_run_is_stable() {
        let store = InMemoryEngineStore::new();
        let run = seeded_run(&store).await;

        store.mark_run_running(run.id, Uuid::now_v7()).await.unwrap();
        assert!(store
            .finish_run(run.id, RunStatus::Completed, Some(json!({"ok": true})), None)
            .await
            .unwrap());

        // A second transition must not change status or output
        assert!(!store
            .finish_run(run.id, RunStatus::Failed, Some(json!({"ok": false})), None)
            .await
            .unwrap());
        let row = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.output_data, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_step_identity_unique_per_iteration() {
        let store = InMemoryEngineStore::new();
        let run = seeded_run(&store).await;

        let make = |iteration| CreateStep {
            run_id: run.id,
            node_id: "n1".into(),
            node_type: "noop".into(),
            step_number: 1,
            iteration_index: iteration,
            max_attempts: 1,
            input_envelope: json!({}),
            depends_on: vec![],
        };

        assert!(store.create_step(make(0)).await.unwrap().is_some());
        assert!(store.create_step(make(0)).await.unwrap().is_none());
        assert!(store.create_step(make(1)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_deploy_flips_current_exclusively() {
        let store = InMemoryEngineStore::new();
        let workflow = store
            .create_workflow(CreateWorkflow {
                owner_id: Uuid::now_v7(),
                name: "wf".into(),
                definition: json!({}),
            })
            .await
            .unwrap();

        let v1 = store.create_version(workflow.id, json!({})).await.unwrap();
        let v2 = store.create_version(workflow.id, json!({})).await.unwrap();
        assert_eq!(v1.version_number, 1);
        assert_eq!(v2.version_number, 2);

        store.deploy_version(workflow.id, 1).await.unwrap();
        store.deploy_version(workflow.id, 2).await.unwrap();

        let versions = store.list_versions(workflow.id).await.unwrap();
        let current: Vec<i32> = versions
            .iter()
            .filter(|v| v.is_current)
            .map(|v| v.version_number)
            .collect();
        assert_eq!(current, vec![2]);
    }

    #[tokio::test]
    async fn test_leadership_is_exclusive() {
        let store = InMemoryEngineStore::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();

        assert!(store.try_acquire_leadership(1, a).await.unwrap());
        assert!(!store.try_acquire_leadership(1, b).await.unwrap());
        // Re-entrant for the holder
        assert!(store.try_acquire_leadership(1, a).await.unwrap());

        store.release_leadership(1, a).await.unwrap();
        assert!(store.try_acquire_leadership(1, b).await.unwrap());
    }
}

//! Run coordinator
//!
//! Creates runs from triggers and API calls, computes which steps become
//! pending after each completion (branch handles, join rules, for-each
//! fan-out), detects run completion, and drives run-level state transitions.
//! The coordinator holds no state of its own; every decision is made against
//! freshly loaded rows.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use gantry_core::error::reason;
use gantry_core::json::deep_merge;
use gantry_core::{
    EngineConfig, EngineError, Envelope, GraphDefinition, NodeError, NodeKind, NodeRegistry,
    NodeSpec, RetryPolicy, RunStatus, StepStatus, Trace, VariableScope,
};
use gantry_storage::{CreateRun, CreateStep, EngineStore, RunRow, StepRow, WorkflowVersionRow};

use crate::queue::WorkQueue;

/// Request to create a run
#[derive(Debug, Clone)]
pub struct NewRun {
    pub workflow_id: Uuid,
    pub input_data: Value,
    pub variables: Value,
    pub trigger_id: Option<Uuid>,
    pub entry_node_id: Option<String>,
    pub parent_step_id: Option<Uuid>,
    pub timeout_seconds: Option<i64>,
}

impl NewRun {
    pub fn new(workflow_id: Uuid, input_data: Value) -> Self {
        Self {
            workflow_id,
            input_data,
            variables: Value::Object(Default::default()),
            trigger_id: None,
            entry_node_id: None,
            parent_step_id: None,
            timeout_seconds: None,
        }
    }
}

/// Drives run-level state transitions and graph traversal
pub struct RunCoordinator {
    store: Arc<dyn EngineStore>,
    registry: Arc<NodeRegistry>,
    queue: WorkQueue,
    config: EngineConfig,
}

fn store_err(e: gantry_storage::StoreError) -> EngineError {
    EngineError::store(e.to_string())
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn EngineStore>,
        registry: Arc<NodeRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            queue: WorkQueue::new(store.clone()),
            store,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn kind_of(&self, node_type: &str) -> NodeKind {
        self.registry.kind_of(node_type).unwrap_or(NodeKind::Standard)
    }

    fn parse_graph(&self, version: &WorkflowVersionRow) -> Result<GraphDefinition, EngineError> {
        serde_json::from_value(version.definition.clone())
            .map_err(|e| EngineError::validation(format!("invalid graph definition: {}", e)))
    }

    /// Load the version and graph a run executes against
    pub async fn load_run_graph(
        &self,
        run: &RunRow,
    ) -> Result<(WorkflowVersionRow, GraphDefinition), EngineError> {
        let version = self
            .store
            .get_version(run.version_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| EngineError::not_found(format!("version {}", run.version_id)))?;
        let graph = self.parse_graph(&version)?;
        Ok((version, graph))
    }

    fn run_retry_policy(run: &RunRow) -> RetryPolicy {
        serde_json::from_value(run.retry_policy.clone()).unwrap_or_default()
    }

    // =========================================================================
    // Run creation
    // =========================================================================

    /// Create a run against the workflow's current version
    ///
    /// The run row and its `start_run` queue item commit atomically in the
    /// store; a trigger firing produces both or neither.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn create_run(&self, request: NewRun) -> Result<RunRow, EngineError> {
        let version = self
            .store
            .current_version(request.workflow_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| {
                EngineError::precondition(format!(
                    "workflow {} has no deployed version",
                    request.workflow_id
                ))
            })?;

        let run = self
            .store
            .create_run(CreateRun {
                workflow_id: request.workflow_id,
                version_id: version.id,
                trigger_id: request.trigger_id,
                parent_step_id: request.parent_step_id,
                input_data: request.input_data,
                variables: request.variables,
                retry_policy: serde_json::to_value(RetryPolicy::default())
                    .unwrap_or_else(|_| Value::Object(Default::default())),
                timeout_seconds: request.timeout_seconds,
                entry_node_id: request.entry_node_id,
            })
            .await
            .map_err(store_err)?;

        info!(run_id = %run.id, version = version.version_number, "created run");
        Ok(run)
    }

    // =========================================================================
    // Start-run handling
    // =========================================================================

    /// Materialize the initial step frontier of a run
    ///
    /// Idempotent: re-delivery after a crash re-creates nothing (step identity
    /// is `(run, node, iteration)`) and duplicate execute items are absorbed
    /// by the `pending` precondition on steps.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn start_run(
        &self,
        run_id: Uuid,
        entry_node_id: Option<&str>,
        worker_id: Uuid,
    ) -> Result<(), EngineError> {
        let Some(run) = self.store.get_run(run_id).await.map_err(store_err)? else {
            warn!(%run_id, "start_run for missing run");
            return Ok(());
        };

        let status: RunStatus = run.status.parse().map_err(EngineError::store)?;
        if status.is_terminal() {
            return Ok(());
        }

        self.store
            .mark_run_running(run_id, worker_id)
            .await
            .map_err(store_err)?;

        let (_, graph) = self.load_run_graph(&run).await?;

        // Resolve the frontier: downstream of the firing trigger node, or of
        // every entry point for manual invocations
        let entry_nodes: Vec<&NodeSpec> = match entry_node_id {
            Some(id) => graph.node(id).into_iter().collect(),
            None => {
                let triggers = graph
                    .entry_points(|n| self.kind_of(&n.node_type) == NodeKind::Trigger);
                if triggers.is_empty() {
                    // No trigger nodes: roots of the graph are the frontier
                    graph
                        .nodes
                        .iter()
                        .filter(|n| graph.incoming(&n.id).next().is_none())
                        .collect()
                } else {
                    triggers
                }
            }
        };

        let mut frontier: Vec<&NodeSpec> = Vec::new();
        for entry in entry_nodes {
            if self.kind_of(&entry.node_type) == NodeKind::Trigger {
                // Trigger nodes are never executed; their successors are
                for edge in graph.successors(&entry.id, None) {
                    if let Some(node) = graph.node(&edge.target) {
                        if !frontier.iter().any(|n| n.id == node.id) {
                            frontier.push(node);
                        }
                    }
                }
            } else if !frontier.iter().any(|n| n.id == entry.id) {
                frontier.push(entry);
            }
        }

        if frontier.is_empty() {
            debug!(%run_id, "empty frontier, finalizing immediately");
            self.queue
                .enqueue_complete_run(run_id)
                .await
                .map_err(store_err)?;
            return Ok(());
        }

        let root_trace = Trace::root(run.workflow_id, run.id);
        let variables: BTreeMap<String, Value> =
            serde_json::from_value(run.variables.clone()).unwrap_or_default();
        let root_env = Envelope::new(run.input_data.clone(), root_trace).with_variables(variables);

        let policy = Self::run_retry_policy(&run);
        let first = self.allocate_checked(&run, frontier.len() as i32).await?;

        for (offset, node) in frontier.into_iter().enumerate() {
            let step_number = first + offset as i32;
            let env = root_env.with_trace(root_env.trace.at_step(&node.id, step_number, 1));
            self.spawn_step(&run, node, step_number, 0, env, vec![], &policy)
                .await?;
        }

        Ok(())
    }

    // =========================================================================
    // Frontier computation after a step terminates
    // =========================================================================

    /// Compute and enqueue the successors of a just-completed step
    #[instrument(skip(self, run, graph, step), fields(run_id = %run.id, node_id = %step.node_id))]
    pub async fn advance_after_completion(
        &self,
        run: &RunRow,
        graph: &GraphDefinition,
        step: &StepRow,
    ) -> Result<(), EngineError> {
        let output_env = step
            .output_envelope
            .clone()
            .and_then(|v| serde_json::from_value::<Envelope>(v).ok())
            .unwrap_or_else(|| {
                Envelope::empty(Trace::root(run.workflow_id, run.id).at_step(
                    &step.node_id,
                    step.step_number,
                    step.attempt_count.max(1) as u32,
                ))
            });

        let policy = Self::run_retry_policy(run);
        let edges = graph.successors(&step.node_id, step.chosen_handle.as_deref());
        let source_kind = self.kind_of(&step.node_type);

        for edge in edges {
            let Some(target) = graph.node(&edge.target) else {
                continue;
            };

            if self.kind_of(&target.node_type) == NodeKind::Merge {
                self.converge_on_merge(run, graph, target, step, &policy)
                    .await?;
                continue;
            }

            if source_kind == NodeKind::Loop {
                // One downstream traversal per element, each with its own
                // iteration index
                let elements: Vec<Value> = match output_env.data.as_array() {
                    Some(items) => items.clone(),
                    None => vec![output_env.data.clone()],
                };
                if elements.is_empty() {
                    continue;
                }
                let first = self.allocate_checked(run, elements.len() as i32).await?;
                for (index, element) in elements.into_iter().enumerate() {
                    let step_number = first + index as i32;
                    let env = output_env
                        .with_data(element)
                        .with_trace(output_env.trace.at_step(&target.id, step_number, 1));
                    self.spawn_step(
                        run,
                        target,
                        step_number,
                        index as i32,
                        env,
                        vec![step.id],
                        &policy,
                    )
                    .await?;
                }
            } else {
                let step_number = self.allocate_checked(run, 1).await?;
                let env = output_env
                    .with_trace(output_env.trace.at_step(&target.id, step_number, 1));
                self.spawn_step(
                    run,
                    target,
                    step_number,
                    step.iteration_index,
                    env,
                    vec![step.id],
                    &policy,
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Merge-node convergence: the merge step is created only once every
    /// instantiated predecessor step is terminal
    async fn converge_on_merge(
        &self,
        run: &RunRow,
        graph: &GraphDefinition,
        merge_node: &NodeSpec,
        completed_step: &StepRow,
        policy: &RetryPolicy,
    ) -> Result<(), EngineError> {
        let pred_nodes = graph.predecessor_nodes(&merge_node.id);
        let steps = self.store.list_steps(run.id).await.map_err(store_err)?;

        let pred_steps: Vec<&StepRow> = steps
            .iter()
            .filter(|s| pred_nodes.contains(&s.node_id.as_str()))
            .collect();

        let all_terminal = pred_steps.iter().all(|s| {
            s.status
                .parse::<StepStatus>()
                .map(|st| st.is_terminal())
                .unwrap_or(false)
        });
        let completed: Vec<&StepRow> = pred_steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed.to_string())
            .copied()
            .collect();

        if !all_terminal || completed.is_empty() {
            debug!(node_id = %merge_node.id, "merge not ready yet");
            return Ok(());
        }

        // Inputs ordered by step_number; the merge node applies its strategy
        let mut inputs = completed.clone();
        inputs.sort_by_key(|s| s.step_number);

        let mut datas = Vec::with_capacity(inputs.len());
        let mut variables: BTreeMap<String, Value> = BTreeMap::new();
        let mut errors = Vec::new();
        for step in &inputs {
            if let Some(env) = step
                .output_envelope
                .clone()
                .and_then(|v| serde_json::from_value::<Envelope>(v).ok())
            {
                datas.push(env.data);
                variables.extend(env.variables);
                errors.extend(env.errors);
            }
        }

        let step_number = self.allocate_checked(run, 1).await?;
        let trace = Trace::root(run.workflow_id, run.id).at_step(&merge_node.id, step_number, 1);
        let mut env = Envelope::new(Value::Array(datas), trace).with_variables(variables);
        env.errors = errors;

        let depends_on = inputs.iter().map(|s| s.id).collect();
        let created = self
            .spawn_step(run, merge_node, step_number, 0, env, depends_on, policy)
            .await?;
        if !created {
            // Another predecessor's worker won the race; record the fan-in
            if let Some(existing) = self
                .store
                .get_step_by_node(run.id, &merge_node.id, 0)
                .await
                .map_err(store_err)?
            {
                self.store
                    .append_step_dependency(existing.id, completed_step.id)
                    .await
                    .map_err(store_err)?;
            }
        }
        Ok(())
    }

    /// Create a pending step and enqueue its execution
    ///
    /// Returns false when a step for the same `(node, iteration)` already
    /// exists (first-completed predecessor wins under the default join).
    async fn spawn_step(
        &self,
        run: &RunRow,
        node: &NodeSpec,
        step_number: i32,
        iteration_index: i32,
        input: Envelope,
        depends_on: Vec<Uuid>,
        policy: &RetryPolicy,
    ) -> Result<bool, EngineError> {
        let input_envelope = serde_json::to_value(&input)
            .map_err(|e| EngineError::store(format!("envelope serialization: {}", e)))?;

        let created = self
            .store
            .create_step(CreateStep {
                run_id: run.id,
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
                step_number,
                iteration_index,
                max_attempts: policy.max_attempts as i32,
                input_envelope,
                depends_on,
            })
            .await
            .map_err(store_err)?;

        match created {
            Some(step) => {
                self.queue
                    .enqueue_execute_step(&step)
                    .await
                    .map_err(store_err)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reserve step numbers, enforcing the per-run step budget
    async fn allocate_checked(&self, run: &RunRow, count: i32) -> Result<i32, EngineError> {
        let first = self
            .store
            .allocate_step_numbers(run.id, count)
            .await
            .map_err(store_err)?;

        let highest = first + count - 1;
        if highest as u32 > self.config.max_steps_per_run {
            warn!(run_id = %run.id, highest, "step budget exceeded");
            self.abort_run(
                run.id,
                RunStatus::Failed,
                serde_json::json!({ "reason": reason::STEP_BUDGET_EXCEEDED }),
            )
            .await?;
            return Err(EngineError::BudgetExceeded(
                reason::STEP_BUDGET_EXCEEDED.to_string(),
            ));
        }
        Ok(first)
    }

    // =========================================================================
    // Failure handling
    // =========================================================================

    /// Record a node execution failure on a running step
    ///
    /// Retryable failures revert the step to `pending` with a future
    /// `next_retry_at` and enqueue a `retry_step` item. Terminal failures
    /// route the error envelope along `error`-handle edges when present.
    #[instrument(skip(self, run, graph, step), fields(run_id = %run.id, step_id = %step.id))]
    pub async fn handle_step_failure(
        &self,
        run: &RunRow,
        graph: &GraphDefinition,
        step: &StepRow,
        error: &NodeError,
    ) -> Result<(), EngineError> {
        let policy = Self::run_retry_policy(run);
        let attempt = step.attempt_count;
        let error_details = serde_json::json!({
            "message": error.to_string(),
            "attempt": attempt,
            "retryable": error.is_retryable(),
        });

        if error.is_retryable() && attempt < step.max_attempts {
            let delay = policy.delay_for_attempt(attempt as u32 + 1);
            let next_retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

            if self
                .store
                .schedule_step_retry(step.id, next_retry_at, error_details)
                .await
                .map_err(store_err)?
            {
                self.queue
                    .enqueue_retry_step(step, next_retry_at)
                    .await
                    .map_err(store_err)?;
                debug!(step_id = %step.id, attempt, ?delay, "scheduled step retry");
            }
            return Ok(());
        }

        // Terminal failure; keep the error envelope as the step output so
        // error handlers can consume it
        let input_env: Option<Envelope> =
            serde_json::from_value(step.input_envelope.clone()).ok();
        let error_env = input_env
            .clone()
            .map(|env| env.add_error(step.node_id.clone(), error.to_string(), None));
        let error_env_value = error_env
            .as_ref()
            .and_then(|env| serde_json::to_value(env).ok());

        self.store
            .fail_step(step.id, error_details, error_env_value)
            .await
            .map_err(store_err)?;

        let handlers = graph.error_handlers(&step.node_id);
        if handlers.is_empty() {
            return Ok(());
        }

        let Some(error_env) = error_env else {
            return Ok(());
        };
        for edge in handlers {
            let Some(target) = graph.node(&edge.target) else {
                continue;
            };
            let step_number = self.allocate_checked(run, 1).await?;
            let env = error_env
                .with_trace(error_env.trace.at_step(&target.id, step_number, 1));
            self.spawn_step(
                run,
                target,
                step_number,
                step.iteration_index,
                env,
                vec![step.id],
                &policy,
            )
            .await?;
        }

        Ok(())
    }

    // =========================================================================
    // Completion detection & finalization
    // =========================================================================

    /// Enqueue `complete_run` once no steps or items remain outstanding
    pub async fn check_run_completion(
        &self,
        run_id: Uuid,
        exclude_item: Option<Uuid>,
    ) -> Result<(), EngineError> {
        let non_terminal = self
            .store
            .count_non_terminal_steps(run_id)
            .await
            .map_err(store_err)?;
        if non_terminal > 0 {
            return Ok(());
        }

        let outstanding = self
            .store
            .count_outstanding_items(run_id, exclude_item)
            .await
            .map_err(store_err)?;
        if outstanding > 0 {
            return Ok(());
        }

        self.queue
            .enqueue_complete_run(run_id)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    /// Handle a `complete_run` item: compute the terminal status, persist the
    /// run output, release run-scoped variables, and resume a suspended
    /// parent step when this was a child run
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn finalize_run(&self, run_id: Uuid) -> Result<(), EngineError> {
        let Some(run) = self.store.get_run(run_id).await.map_err(store_err)? else {
            return Ok(());
        };

        let status: RunStatus = run.status.parse().map_err(EngineError::store)?;
        if !status.is_terminal() {
            // A complete_run item can arrive early (nack escalation while
            // sibling steps are still in flight); the eventual completion
            // check re-enqueues one
            let in_flight = self
                .store
                .count_non_terminal_steps(run_id)
                .await
                .map_err(store_err)?;
            if in_flight > 0 {
                debug!(%run_id, in_flight, "complete_run deferred, steps still in flight");
                return Ok(());
            }

            let (_, graph) = self.load_run_graph(&run).await?;
            let steps = self.store.list_steps(run_id).await.map_err(store_err)?;

            // A failed step with no error-path consumer fails the run
            let failed_unconsumed = steps.iter().find(|s| {
                s.status == StepStatus::Failed.to_string()
                    && graph.error_handlers(&s.node_id).is_empty()
            });

            let (terminal, error_data) = match failed_unconsumed {
                Some(failed) => (RunStatus::Failed, failed.error_details.clone()),
                None => (RunStatus::Completed, None),
            };

            let output = Self::compute_run_output(&graph, &steps);
            self.store
                .finish_run(run_id, terminal, Some(output), error_data)
                .await
                .map_err(store_err)?;
            info!(%run_id, status = %terminal, "finalized run");
        }

        // Run-scoped variables die with the run
        self.store
            .clear_scope_variables(VariableScope::Run, &run_id.to_string())
            .await
            .map_err(store_err)?;

        if let Some(parent_step_id) = run.parent_step_id {
            self.resume_parent(run_id, parent_step_id).await?;
        }

        Ok(())
    }

    /// Output of a run: the deep-merged data of its leaf completed steps
    fn compute_run_output(graph: &GraphDefinition, steps: &[StepRow]) -> Value {
        let mut leaves: Vec<&StepRow> = steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed.to_string())
            .filter(|s| graph.successors(&s.node_id, None).is_empty())
            .collect();

        if leaves.is_empty() {
            // Fall back to the last completed step
            leaves = steps
                .iter()
                .filter(|s| s.status == StepStatus::Completed.to_string())
                .max_by_key(|s| s.step_number)
                .into_iter()
                .collect();
        }

        leaves.sort_by_key(|s| s.step_number);
        let mut output = Value::Object(Default::default());
        let mut single = None;
        for step in &leaves {
            if let Some(env) = step
                .output_envelope
                .clone()
                .and_then(|v| serde_json::from_value::<Envelope>(v).ok())
            {
                if leaves.len() == 1 {
                    single = Some(env.data);
                } else {
                    deep_merge(&mut output, &env.data);
                }
            }
        }
        single.unwrap_or(output)
    }

    /// Resume the sub-workflow call step a terminal child run belongs to
    async fn resume_parent(
        &self,
        child_run_id: Uuid,
        parent_step_id: Uuid,
    ) -> Result<(), EngineError> {
        let Some(child) = self.store.get_run(child_run_id).await.map_err(store_err)? else {
            return Ok(());
        };
        let Some(parent_step) = self
            .store
            .get_step(parent_step_id)
            .await
            .map_err(store_err)?
        else {
            return Ok(());
        };
        let Some(parent_run) = self
            .store
            .get_run(parent_step.run_id)
            .await
            .map_err(store_err)?
        else {
            return Ok(());
        };

        let parent_status: RunStatus = parent_run.status.parse().map_err(EngineError::store)?;
        if parent_status.is_terminal() {
            return Ok(());
        }

        let (_, graph) = self.load_run_graph(&parent_run).await?;
        let child_status: RunStatus = child.status.parse().map_err(EngineError::store)?;

        if child_status == RunStatus::Completed {
            let trace = Trace::root(parent_run.workflow_id, parent_run.id).at_step(
                &parent_step.node_id,
                parent_step.step_number,
                parent_step.attempt_count.max(1) as u32,
            );
            let env = Envelope::new(child.output_data.clone().unwrap_or(Value::Null), trace);
            let env_value = serde_json::to_value(&env)
                .map_err(|e| EngineError::store(format!("envelope serialization: {}", e)))?;

            if self
                .store
                .complete_step(parent_step.id, env_value, None)
                .await
                .map_err(store_err)?
            {
                if let Some(updated) = self
                    .store
                    .get_step(parent_step.id)
                    .await
                    .map_err(store_err)?
                {
                    self.advance_after_completion(&parent_run, &graph, &updated)
                        .await?;
                }
            }
        } else {
            let error = NodeError::failed(format!(
                "child run {} ended {}",
                child_run_id, child_status
            ));
            // Child retries already happened inside the child run
            self.handle_step_failure(&parent_run, &graph, &parent_step, &error)
                .await?;
        }

        self.check_run_completion(parent_run.id, None).await
    }

    // =========================================================================
    // Cancellation, timeout, budget
    // =========================================================================

    /// Cancel a run: non-terminal steps become `skipped`, its queue items are
    /// removed, and a `complete_run` item performs the final bookkeeping
    pub async fn cancel(&self, run_id: Uuid) -> Result<bool, EngineError> {
        let cancelled = self.store.cancel_run(run_id).await.map_err(store_err)?;
        if cancelled {
            self.store
                .skip_non_terminal_steps(run_id)
                .await
                .map_err(store_err)?;
            self.store
                .purge_run_items(run_id)
                .await
                .map_err(store_err)?;
            self.queue
                .enqueue_complete_run(run_id)
                .await
                .map_err(store_err)?;
            info!(%run_id, "cancelled run");
        }
        Ok(cancelled)
    }

    /// Force a run into a terminal status (timeout, budget exceeded)
    pub async fn abort_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_data: Value,
    ) -> Result<bool, EngineError> {
        let changed = self
            .store
            .finish_run(run_id, status, None, Some(error_data))
            .await
            .map_err(store_err)?;
        if changed {
            self.store
                .skip_non_terminal_steps(run_id)
                .await
                .map_err(store_err)?;
            self.store
                .purge_run_items(run_id)
                .await
                .map_err(store_err)?;
            self.queue
                .enqueue_complete_run(run_id)
                .await
                .map_err(store_err)?;
        }
        Ok(changed)
    }
}

#[async_trait]
impl gantry_core::node::RunLauncher for RunCoordinator {
    async fn launch_child(
        &self,
        workflow_id: Uuid,
        input: Envelope,
        parent_step_id: Uuid,
    ) -> Result<Uuid, NodeError> {
        let variables = serde_json::to_value(&input.variables)
            .unwrap_or_else(|_| Value::Object(Default::default()));

        let run = self
            .create_run(NewRun {
                workflow_id,
                input_data: input.data,
                variables,
                trigger_id: None,
                entry_node_id: None,
                parent_step_id: Some(parent_step_id),
                timeout_seconds: None,
            })
            .await
            .map_err(|e| NodeError::failed(format!("failed to launch child run: {}", e)))?;

        Ok(run.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deep_merge_last_writer_wins() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        deep_merge(&mut base, &json!({"b": 2, "nested": {"y": 3}}));

        assert_eq!(base, json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 3}}));
    }

    #[test]
    fn test_deep_merge_scalar_replaces_object() {
        let mut base = json!({"a": {"deep": true}});
        deep_merge(&mut base, &json!({"a": 5}));
        assert_eq!(base, json!({"a": 5}));
    }

    #[test]
    fn test_new_run_defaults() {
        let request = NewRun::new(Uuid::now_v7(), json!({"x": 1}));
        assert!(request.trigger_id.is_none());
        assert!(request.entry_node_id.is_none());
        assert_eq!(request.variables, json!({}));
    }
}

//! Step execution
//!
//! Dispatches claimed queue items. Every handler is idempotent against
//! redelivery: optimistic status preconditions absorb duplicate items, and a
//! crash between state change and ack only causes re-handling, never loss.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use gantry_core::error::reason;
use gantry_core::node::RunLauncher;
use gantry_core::{
    EngineError, Envelope, ExecutionContext, NodeError, NodeOutcome, QueueType, RunStatus,
    StepStatus, Trace, VariableStore,
};
use gantry_engine::{PersistentVariableStore, RunCoordinator};
use gantry_storage::{EngineStore, QueueItemRow, RunRow, StepRow};

/// How often an executing step checks for run-level cancellation
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Executes claimed queue items on behalf of one worker
pub struct StepExecutor {
    coordinator: Arc<RunCoordinator>,
    store: Arc<dyn EngineStore>,
    variables: Arc<dyn VariableStore>,
    worker_id: Uuid,
}

fn store_err(e: gantry_storage::StoreError) -> EngineError {
    EngineError::store(e.to_string())
}

impl StepExecutor {
    pub fn new(coordinator: Arc<RunCoordinator>, worker_id: Uuid) -> Self {
        let store = coordinator.store().clone();
        Self {
            variables: Arc::new(PersistentVariableStore::new(store.clone())),
            coordinator,
            store,
            worker_id,
        }
    }

    /// Handle one claimed item; the caller acks on `Ok` and nacks on `Err`
    #[instrument(skip(self, item), fields(item_id = %item.id, run_id = %item.run_id, queue_type = %item.queue_type))]
    pub async fn handle_item(&self, item: &QueueItemRow) -> Result<(), EngineError> {
        let queue_type = QueueType::from_str(&item.queue_type).map_err(EngineError::store)?;

        let result = match queue_type {
            QueueType::StartRun => self.handle_start_run(item).await,
            QueueType::ExecuteStep | QueueType::RetryStep => self.handle_execute_step(item).await,
            QueueType::CompleteRun => self.coordinator.finalize_run(item.run_id).await,
        };

        match result {
            // A budget abort already purged the run's items, this one included
            Err(EngineError::BudgetExceeded(_)) => Ok(()),
            other => other,
        }
    }

    async fn handle_start_run(&self, item: &QueueItemRow) -> Result<(), EngineError> {
        let entry_node_id = item
            .payload
            .get("entry_node_id")
            .and_then(|v| v.as_str())
            .map(String::from);

        self.coordinator
            .start_run(item.run_id, entry_node_id.as_deref(), self.worker_id)
            .await
    }

    async fn handle_execute_step(&self, item: &QueueItemRow) -> Result<(), EngineError> {
        let Some(step_id) = item.step_id else {
            warn!("step item without step_id, dropping");
            return Ok(());
        };
        let Some(step) = self.store.get_step(step_id).await.map_err(store_err)? else {
            return Ok(());
        };
        let Some(run) = self.store.get_run(step.run_id).await.map_err(store_err)? else {
            return Ok(());
        };

        let run_status: RunStatus = run.status.parse().map_err(EngineError::store)?;
        if run_status.is_terminal() {
            return Ok(());
        }

        let (_, graph) = self.coordinator.load_run_graph(&run).await?;

        let marked = self
            .store
            .mark_step_running(step_id, self.worker_id)
            .await
            .map_err(store_err)?;

        let running = match marked {
            Some(running) => running,
            None if step.status == StepStatus::Running.to_string() => {
                // The previous worker died mid-execution and the reaper
                // returned this item. Take the step over with its attempt
                // count preserved; suspended steps resume via their child run
                match self
                    .store
                    .reassign_running_step(step_id, self.worker_id)
                    .await
                    .map_err(store_err)?
                {
                    Some(taken_over) => {
                        info!(%step_id, "took over step from a dead worker");
                        taken_over
                    }
                    None => return Ok(()),
                }
            }
            None => {
                // Already terminal: a redelivered item for work that already
                // happened. Re-advance a completed step so a crash between
                // completion and successor enqueue cannot strand the run.
                if step.status == StepStatus::Completed.to_string() {
                    self.coordinator
                        .advance_after_completion(&run, &graph, &step)
                        .await?;
                    self.coordinator
                        .check_run_completion(run.id, Some(item.id))
                        .await?;
                }
                return Ok(());
            }
        };

        self.store
            .heartbeat_run(run.id, self.worker_id)
            .await
            .map_err(store_err)?;

        debug!(step_id = %running.id, node_id = %running.node_id, attempt = running.attempt_count, "executing step");

        let outcome = self.execute_node(&run, &graph, &running).await;

        match outcome {
            Ok(outcome) => {
                self.persist_success(&run, &graph, &running, outcome)
                    .await?;
            }
            Err(error) => {
                // A cancelled run already skipped its steps; nothing to record
                if matches!(error, NodeError::Cancelled) {
                    let current = self.store.get_run(run.id).await.map_err(store_err)?;
                    if current
                        .map(|r| r.status == RunStatus::Cancelled.to_string())
                        .unwrap_or(true)
                    {
                        return Ok(());
                    }
                }
                info!(step_id = %running.id, %error, "step failed");
                self.coordinator
                    .handle_step_failure(&run, &graph, &running, &error)
                    .await?;
            }
        }

        self.coordinator
            .check_run_completion(run.id, Some(item.id))
            .await
    }

    /// Resolve the node definition and run it under cancellation and deadline
    async fn execute_node(
        &self,
        run: &RunRow,
        graph: &gantry_core::GraphDefinition,
        step: &StepRow,
    ) -> Result<NodeOutcome, NodeError> {
        let registry = self.coordinator.registry();
        let definition = registry.get(&step.node_type).map_err(|_| {
            // Fails loudly and without retry so a fleet missing this node
            // type surfaces immediately
            NodeError::config(format!("{}: {}", reason::UNKNOWN_NODE_TYPE, step.node_type))
        })?;

        let node_spec = graph
            .node(&step.node_id)
            .ok_or_else(|| NodeError::config(format!("node {} not in graph", step.node_id)))?;

        let cancel = CancellationToken::new();
        let launcher: Arc<dyn RunLauncher> = self.coordinator.clone();
        let mut ctx = ExecutionContext::new(
            run.workflow_id,
            run.id,
            step.node_id.clone(),
            step.id,
            step.step_number,
            step.attempt_count.max(1) as u32,
            step.max_attempts.max(1) as u32,
            self.variables.clone(),
        )
        .with_cancellation(cancel.clone())
        .with_launcher(launcher);

        if let (Some(timeout), Some(started_at)) = (run.timeout_seconds, run.started_at) {
            ctx = ctx.with_deadline(started_at + chrono::Duration::seconds(timeout));
        }

        if let Some(connection_id) = node_spec
            .config
            .get("connection_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            match self.store.get_connection(connection_id).await {
                Ok(Some(connection)) => {
                    ctx = ctx.with_connection(connection.config);
                }
                Ok(None) => {
                    return Err(NodeError::config(format!(
                        "connection {} not found",
                        connection_id
                    )));
                }
                Err(e) => return Err(NodeError::failed(e.to_string())),
            }
        }

        let mut input: Envelope = serde_json::from_value(step.input_envelope.clone())
            .unwrap_or_else(|_| {
                Envelope::empty(Trace::root(run.workflow_id, run.id).at_step(
                    &step.node_id,
                    step.step_number,
                    1,
                ))
            });
        input.trace.attempt = step.attempt_count.max(1) as u32;

        // Watch for run-level cancellation while the node executes
        let watcher = {
            let store = self.store.clone();
            let run_id = run.id;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
                    match store.get_run(run_id).await {
                        Ok(Some(run)) if run.status == RunStatus::Cancelled.to_string() => {
                            cancel.cancel();
                            break;
                        }
                        Ok(Some(_)) => {}
                        _ => break,
                    }
                }
            })
        };

        let config = node_spec.config.clone();
        let result = tokio::select! {
            result = definition.execute(&ctx, &config, input) => result,
            _ = cancel.cancelled() => Err(NodeError::Cancelled),
        };
        watcher.abort();

        result
    }

    /// Persist a successful outcome and grow the frontier
    async fn persist_success(
        &self,
        run: &RunRow,
        graph: &gantry_core::GraphDefinition,
        step: &StepRow,
        outcome: NodeOutcome,
    ) -> Result<(), EngineError> {
        let step_trace = Trace::root(run.workflow_id, run.id).at_step(
            &step.node_id,
            step.step_number,
            step.attempt_count.max(1) as u32,
        );

        let (mut output, chosen_handle) = match outcome {
            NodeOutcome::Envelope(env) => (env, None),
            NodeOutcome::Branch { envelope, handle } => (envelope, Some(handle)),
            NodeOutcome::Items(items) => {
                // Fan-out derives from the persisted array envelope so it is
                // replayable after a crash
                let datas: Vec<Value> = items.iter().map(|e| e.data.clone()).collect();
                let base = items
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Envelope::empty(step_trace.clone()));
                (base.with_data(Value::Array(datas)), None)
            }
            NodeOutcome::Suspend { child_run_id } => {
                self.store
                    .set_step_waiting(step.id, child_run_id)
                    .await
                    .map_err(store_err)?;
                debug!(step_id = %step.id, %child_run_id, "step suspended on child run");
                return Ok(());
            }
        };

        output.trace = step_trace;
        let output_value = serde_json::to_value(&output)
            .map_err(|e| EngineError::store(format!("envelope serialization: {}", e)))?;

        if self
            .store
            .complete_step(step.id, output_value, chosen_handle.as_deref())
            .await
            .map_err(store_err)?
        {
            if let Some(updated) = self.store.get_step(step.id).await.map_err(store_err)? {
                self.coordinator
                    .advance_after_completion(run, graph, &updated)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{EngineConfig, NodeRegistry};
    use gantry_engine::coordinator::NewRun;
    use gantry_storage::{CreateWorkflow, InMemoryEngineStore};
    use serde_json::json;

    fn registry() -> Arc<NodeRegistry> {
        let mut registry = NodeRegistry::new();
        gantry_nodes::register_builtins(&mut registry).unwrap();
        Arc::new(registry)
    }

    async fn deployed_workflow(
        store: &Arc<InMemoryEngineStore>,
        definition: Value,
    ) -> Uuid {
        let workflow = store
            .create_workflow(CreateWorkflow {
                owner_id: Uuid::now_v7(),
                name: "wf".into(),
                definition: definition.clone(),
            })
            .await
            .unwrap();
        let version = store.create_version(workflow.id, definition).await.unwrap();
        store
            .deploy_version(workflow.id, version.version_number)
            .await
            .unwrap();
        workflow.id
    }

    /// Drain the queue until idle, like a single-worker fleet would
    async fn drain(executor: &StepExecutor, store: &Arc<InMemoryEngineStore>, worker: Uuid) {
        for _ in 0..200 {
            let items = store.claim_items(worker, &[], 10).await.unwrap();
            if items.is_empty() {
                if store.item_count() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            }
            for item in items {
                executor.handle_item(&item).await.unwrap();
                store.ack_item(item.id).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_single_noop_run_completes() {
        let store: Arc<InMemoryEngineStore> = Arc::new(InMemoryEngineStore::new());
        let coordinator = Arc::new(RunCoordinator::new(
            store.clone(),
            registry(),
            EngineConfig::default(),
        ));
        let worker = Uuid::now_v7();
        let executor = StepExecutor::new(coordinator.clone(), worker);

        let workflow_id = deployed_workflow(
            &store,
            json!({
                "nodes": [{"id": "n1", "type": "noop", "config": {}}],
                "edges": [],
            }),
        )
        .await;

        let run = coordinator
            .create_run(NewRun::new(workflow_id, json!({})))
            .await
            .unwrap();

        drain(&executor, &store, worker).await;

        let finished = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(finished.status, "completed");

        let steps = store.list_steps(run.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, "completed");
        assert_eq!(finished.output_data, Some(json!({})));
    }

    #[tokio::test]
    async fn test_unknown_node_type_fails_run_without_retry() {
        let store: Arc<InMemoryEngineStore> = Arc::new(InMemoryEngineStore::new());
        let coordinator = Arc::new(RunCoordinator::new(
            store.clone(),
            registry(),
            EngineConfig::default(),
        ));
        let worker = Uuid::now_v7();
        let executor = StepExecutor::new(coordinator.clone(), worker);

        let workflow_id = deployed_workflow(
            &store,
            json!({
                "nodes": [{"id": "n1", "type": "quantum_fax", "config": {}}],
                "edges": [],
            }),
        )
        .await;

        let run = coordinator
            .create_run(NewRun::new(workflow_id, json!({})))
            .await
            .unwrap();

        drain(&executor, &store, worker).await;

        let finished = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(finished.status, "failed");

        let steps = store.list_steps(run.id).await.unwrap();
        assert_eq!(steps[0].status, "failed");
        // No retry happened
        assert_eq!(steps[0].attempt_count, 1);
    }
}

//! End-to-end scenarios against the in-memory store
//!
//! A harness stands in for a single-worker fleet: it claims items, runs the
//! executor, and acks, exactly as the pool does, but deterministically and
//! without background tasks (except where a scenario needs one).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use gantry_core::error::reason;
use gantry_core::{
    EngineConfig, Envelope, ExecutionContext, NodeDefinition, NodeError, NodeMeta, NodeOutcome,
    NodeRegistry, Trace,
};
use gantry_engine::coordinator::NewRun;
use gantry_engine::{RunCoordinator, WebhookDispatcher, WebhookOutcome, WebhookRequest};
use gantry_storage::{CreateTrigger, CreateWorkflow, EngineStore, InMemoryEngineStore, RunRow};
use gantry_worker::StepExecutor;

/// Fails its first `failures` executions, then succeeds
struct FlakyNode {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyNode {
    fn failing(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl NodeDefinition for FlakyNode {
    fn meta(&self) -> NodeMeta {
        NodeMeta::new("flaky", "Flaky", "testing")
    }

    async fn execute(
        &self,
        _ctx: &ExecutionContext,
        _config: &Value,
        input: Envelope,
    ) -> Result<NodeOutcome, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(NodeError::failed(format!("induced failure {}", call + 1)))
        } else {
            Ok(NodeOutcome::Envelope(input))
        }
    }
}

struct Harness {
    store: Arc<InMemoryEngineStore>,
    coordinator: Arc<RunCoordinator>,
    executor: Arc<StepExecutor>,
    worker_id: Uuid,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    fn with_config(config: EngineConfig) -> Self {
        Self::build(config, |_| {})
    }

    fn build(config: EngineConfig, customize: impl FnOnce(&mut NodeRegistry)) -> Self {
        let store: Arc<InMemoryEngineStore> = Arc::new(InMemoryEngineStore::new());
        let mut registry = NodeRegistry::new();
        gantry_nodes::register_builtins(&mut registry).unwrap();
        customize(&mut registry);

        let coordinator = Arc::new(RunCoordinator::new(
            store.clone(),
            Arc::new(registry),
            config,
        ));
        let worker_id = Uuid::now_v7();
        let executor = Arc::new(StepExecutor::new(coordinator.clone(), worker_id));

        Self {
            store,
            coordinator,
            executor,
            worker_id,
        }
    }

    async fn deploy(&self, definition: Value) -> Uuid {
        let workflow = self
            .store
            .create_workflow(CreateWorkflow {
                owner_id: Uuid::now_v7(),
                name: "scenario".into(),
                definition: definition.clone(),
            })
            .await
            .unwrap();
        let version = self
            .store
            .create_version(workflow.id, definition)
            .await
            .unwrap();
        self.store
            .deploy_version(workflow.id, version.version_number)
            .await
            .unwrap();
        workflow.id
    }

    async fn execute(&self, workflow_id: Uuid, input: Value) -> RunRow {
        self.coordinator
            .create_run(NewRun::new(workflow_id, input))
            .await
            .unwrap()
    }

    /// Handle one batch of claimable items; true if any work happened
    async fn turn(&self) -> bool {
        let items = self.store.claim_items(self.worker_id, &[], 10).await.unwrap();
        if items.is_empty() {
            return false;
        }
        for item in items {
            self.executor.handle_item(&item).await.unwrap();
            self.store.ack_item(item.id).await.unwrap();
        }
        true
    }

    /// Work the queue until it is empty (retries included), up to `budget`
    async fn drain(&self, budget: Duration) {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if !self.turn().await {
                if self.store.item_count() == 0 {
                    return;
                }
                // Items exist but are backed off; wait for availability
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("queue did not drain within {:?}", budget);
            }
        }
    }

    async fn run_status(&self, run_id: Uuid) -> String {
        self.store.get_run(run_id).await.unwrap().unwrap().status
    }
}

fn branch_workflow() -> Value {
    json!({
        "nodes": [
            {"id": "start", "type": "noop", "config": {}},
            {"id": "branch", "type": "branch", "config": {"field": "x", "op": "gt", "value": 0}},
            {"id": "a", "type": "noop", "config": {}},
            {"id": "b", "type": "noop", "config": {}},
        ],
        "edges": [
            {"id": "e1", "source": "start", "target": "branch"},
            {"id": "e2", "source": "branch", "target": "a", "source_handle": "true"},
            {"id": "e3", "source": "branch", "target": "b", "source_handle": "false"},
        ],
    })
}

// S2: branch routing follows the chosen handle; the untaken side never runs
#[tokio::test]
async fn test_branching_follows_chosen_handle() {
    let harness = Harness::new();
    let workflow_id = harness.deploy(branch_workflow()).await;
    let run = harness.execute(workflow_id, json!({"x": 5})).await;

    harness.drain(Duration::from_secs(10)).await;

    assert_eq!(harness.run_status(run.id).await, "completed");

    let steps = harness.store.list_steps(run.id).await.unwrap();
    let by_node: Vec<(&str, &str)> = steps
        .iter()
        .map(|s| (s.node_id.as_str(), s.status.as_str()))
        .collect();

    assert!(by_node.contains(&("start", "completed")));
    assert!(by_node.contains(&("branch", "completed")));
    assert!(by_node.contains(&("a", "completed")));
    assert!(!by_node.iter().any(|(node, _)| *node == "b"));

    let branch_step = steps.iter().find(|s| s.node_id == "branch").unwrap();
    assert_eq!(branch_step.chosen_handle.as_deref(), Some("true"));

    // Envelope trace integrity: every step's input trace names the step
    for step in &steps {
        let env: Envelope = serde_json::from_value(step.input_envelope.clone()).unwrap();
        assert_eq!(env.trace.node_id, step.node_id);
        assert_eq!(env.trace.step_number, step.step_number);
    }
}

// S3: a node failing on attempts 1-2 succeeds on attempt 3 with the policy's
// delays (1s, 2s) between retries
#[tokio::test]
async fn test_retry_then_success() {
    let harness = Harness::build(EngineConfig::default(), |registry| {
        registry.register(Arc::new(FlakyNode::failing(2))).unwrap();
    });
    let workflow_id = harness
        .deploy(json!({
            "nodes": [{"id": "n1", "type": "flaky", "config": {}}],
            "edges": [],
        }))
        .await;

    let started = tokio::time::Instant::now();
    let run = harness.execute(workflow_id, json!({})).await;
    harness.drain(Duration::from_secs(15)).await;
    let elapsed = started.elapsed();

    assert_eq!(harness.run_status(run.id).await, "completed");

    let steps = harness.store.list_steps(run.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, "completed");
    assert_eq!(steps[0].attempt_count, 3);

    // Delays 1s then 2s; allow generous slack above but none below
    assert!(
        elapsed >= Duration::from_secs(3),
        "retries finished too fast: {:?}",
        elapsed
    );
}

// S4: a sync-mode webhook returns the echo node's output as the response
#[tokio::test]
async fn test_webhook_sync_round_trip() {
    let harness = Harness::new();
    let workflow_id = harness
        .deploy(json!({
            "nodes": [
                {"id": "hook", "type": "webhook_trigger", "config": {"mode": "sync"}},
                {"id": "reply", "type": "echo", "config": {}},
            ],
            "edges": [
                {"id": "e1", "source": "hook", "target": "reply"},
            ],
        }))
        .await;

    harness
        .store
        .create_trigger(CreateTrigger {
            workflow_id,
            provider: "webhook".into(),
            node_id: "hook".into(),
            config: json!({"mode": "sync", "timeout_seconds": 10}),
            token: Some("abc".into()),
            enabled: true,
        })
        .await
        .unwrap();

    let dispatcher = WebhookDispatcher::new(harness.store.clone(), harness.coordinator.clone());

    // A background single-worker fleet services the queue while we wait
    let worker = {
        let store = harness.store.clone();
        let executor = harness.executor.clone();
        let worker_id = harness.worker_id;
        tokio::spawn(async move {
            loop {
                let items = store.claim_items(worker_id, &[], 10).await.unwrap();
                for item in items {
                    executor.handle_item(&item).await.unwrap();
                    store.ack_item(item.id).await.unwrap();
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
    };

    let outcome = dispatcher
        .dispatch(WebhookRequest {
            token: "abc".into(),
            method: "POST".into(),
            headers: json!({"content-type": "application/json"}),
            body: json!({"hi": 1}),
            source_ip: Some("127.0.0.1".into()),
            secret: None,
        })
        .await
        .unwrap();
    worker.abort();

    let WebhookOutcome::Completed { run_id, status, body } = outcome else {
        panic!("expected a completed sync outcome");
    };
    assert_eq!(status, 200);
    assert_eq!(body.get("body"), Some(&json!("{\"hi\":1}")));

    let run = harness.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, "completed");
    assert_eq!(run.input_data.get("body"), Some(&json!("{\"hi\":1}")));
}

// S5: a worker dying mid-step loses its lease; a second worker takes the
// step over, preserving the attempt count, and the run completes
#[tokio::test]
async fn test_worker_crash_recovery() {
    let harness = Harness::new();
    let workflow_id = harness
        .deploy(json!({
            "nodes": [{"id": "n1", "type": "noop", "config": {}}],
            "edges": [],
        }))
        .await;
    let run = harness.execute(workflow_id, json!({})).await;

    // Worker A starts the run, claims the execute item, marks the step
    // running, and dies before finishing
    let dead_worker = Uuid::now_v7();
    let items = harness.store.claim_items(dead_worker, &[], 1).await.unwrap();
    assert_eq!(items[0].queue_type, "start_run");
    harness.executor.handle_item(&items[0]).await.unwrap();
    harness.store.ack_item(items[0].id).await.unwrap();

    let items = harness.store.claim_items(dead_worker, &[], 1).await.unwrap();
    let step_id = items[0].step_id.unwrap();
    harness
        .store
        .mark_step_running(step_id, dead_worker)
        .await
        .unwrap()
        .unwrap();
    // ... crash: no ack, no heartbeat. The reaper returns the lease
    let reaped = harness
        .store
        .reap_expired_leases(chrono::Utc::now() + chrono::Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(reaped.len(), 1);

    // The surviving worker finishes the run
    harness.drain(Duration::from_secs(10)).await;

    assert_eq!(harness.run_status(run.id).await, "completed");
    let steps = harness.store.list_steps(run.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, "completed");
    // Attempt preserved across the takeover
    assert_eq!(steps[0].attempt_count, 1);
}

// S6: cancelling a running multi-step workflow skips the frontier and
// removes its queue items; terminal state never changes afterwards
#[tokio::test]
async fn test_cancellation_skips_pending_steps() {
    let harness = Harness::new();
    let workflow_id = harness
        .deploy(json!({
            "nodes": [
                {"id": "n1", "type": "noop", "config": {}},
                {"id": "n2", "type": "noop", "config": {}},
                {"id": "n3", "type": "noop", "config": {}},
            ],
            "edges": [
                {"id": "e1", "source": "n1", "target": "n2"},
                {"id": "e2", "source": "n2", "target": "n3"},
            ],
        }))
        .await;
    let run = harness.execute(workflow_id, json!({})).await;

    // Handle only start_run so n1 is pending, then cancel
    assert!(harness.turn().await);
    assert!(harness.coordinator.cancel(run.id).await.unwrap());

    assert_eq!(harness.run_status(run.id).await, "cancelled");
    let steps = harness.store.list_steps(run.id).await.unwrap();
    assert!(!steps.is_empty());
    assert!(steps.iter().all(|s| s.status == "skipped"));

    // Only the finalization item remains; draining does not resurrect the run
    harness.drain(Duration::from_secs(5)).await;
    assert_eq!(harness.run_status(run.id).await, "cancelled");
    assert_eq!(harness.store.item_count(), 0);

    // Terminal stability under a second cancel
    assert!(!harness.coordinator.cancel(run.id).await.unwrap());
}

// For-each fan-out with a collecting merge: one subgraph per element, each
// with its own iteration index, converging once all iterations are terminal
#[tokio::test]
async fn test_for_each_fan_out_and_merge() {
    let harness = Harness::new();
    let workflow_id = harness
        .deploy(json!({
            "nodes": [
                {"id": "split", "type": "for_each", "config": {"field": "items"}},
                {"id": "work", "type": "set", "config": {"values": {"seen": true}, "mode": "replace"}},
                {"id": "join", "type": "merge", "config": {"strategy": "collect"}},
            ],
            "edges": [
                {"id": "e1", "source": "split", "target": "work"},
                {"id": "e2", "source": "work", "target": "join"},
            ],
        }))
        .await;

    let run = harness
        .execute(workflow_id, json!({"items": [1, 2, 3]}))
        .await;
    harness.drain(Duration::from_secs(10)).await;

    assert_eq!(harness.run_status(run.id).await, "completed");

    let steps = harness.store.list_steps(run.id).await.unwrap();
    let iterations: Vec<i32> = steps
        .iter()
        .filter(|s| s.node_id == "work")
        .map(|s| s.iteration_index)
        .collect();
    assert_eq!(iterations.len(), 3);
    assert!(iterations.contains(&0) && iterations.contains(&1) && iterations.contains(&2));

    // Step numbers are unique within the run
    let mut numbers: Vec<i32> = steps.iter().map(|s| s.step_number).collect();
    numbers.sort_unstable();
    numbers.dedup();
    assert_eq!(numbers.len(), steps.len());

    let merge_step = steps.iter().find(|s| s.node_id == "join").unwrap();
    assert_eq!(merge_step.status, "completed");
    assert_eq!(merge_step.depends_on.len(), 3);

    let output = harness
        .store
        .get_run(run.id)
        .await
        .unwrap()
        .unwrap()
        .output_data
        .unwrap();
    assert_eq!(output, json!([{"seen": true}, {"seen": true}, {"seen": true}]));
}

// Sub-workflow call: the parent step suspends, the child run executes, and
// the child's output becomes the parent step's output
#[tokio::test]
async fn test_sub_workflow_suspend_and_resume() {
    let harness = Harness::new();

    let child_id = harness
        .deploy(json!({
            "nodes": [
                {"id": "inner", "type": "set", "config": {"values": {"from_child": true}}},
            ],
            "edges": [],
        }))
        .await;

    let parent_id = harness
        .deploy(json!({
            "nodes": [
                {"id": "call", "type": "sub_workflow", "config": {"workflow_id": child_id.to_string()}},
            ],
            "edges": [],
        }))
        .await;

    let run = harness.execute(parent_id, json!({"input": 1})).await;
    harness.drain(Duration::from_secs(10)).await;

    assert_eq!(harness.run_status(run.id).await, "completed");
    let output = harness
        .store
        .get_run(run.id)
        .await
        .unwrap()
        .unwrap()
        .output_data
        .unwrap();
    assert_eq!(output.get("from_child"), Some(&json!(true)));

    // Exactly one child run exists, tied back to the call step
    let steps = harness.store.list_steps(run.id).await.unwrap();
    let call_step = steps.iter().find(|s| s.node_id == "call").unwrap();
    assert_eq!(call_step.status, "completed");
}

// P9 cycle safety: the step budget terminates runaway graphs
#[tokio::test]
async fn test_step_budget_exceeded_fails_run() {
    let config = EngineConfig {
        max_steps_per_run: 3,
        ..EngineConfig::default()
    };
    let harness = Harness::with_config(config);

    let workflow_id = harness
        .deploy(json!({
            "nodes": [
                {"id": "split", "type": "for_each", "config": {}},
                {"id": "work", "type": "noop", "config": {}},
            ],
            "edges": [
                {"id": "e1", "source": "split", "target": "work"},
            ],
        }))
        .await;

    // Fan-out of 5 exceeds the budget of 3
    let run = harness
        .execute(workflow_id, json!([1, 2, 3, 4, 5]))
        .await;
    harness.drain(Duration::from_secs(10)).await;

    let row = harness.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(row.status, "failed");
    assert_eq!(
        row.error_data.unwrap().get("reason"),
        Some(&json!(reason::STEP_BUDGET_EXCEEDED))
    );

    // Nothing left pending or queued
    assert_eq!(
        harness.store.count_non_terminal_steps(run.id).await.unwrap(),
        0
    );
    assert_eq!(harness.store.item_count(), 0);
}

// A terminal failure with an error-handler edge keeps the run alive and
// hands the error envelope downstream
#[tokio::test]
async fn test_error_handler_edge_consumes_failure() {
    let harness = Harness::build(EngineConfig::default(), |registry| {
        registry.register(Arc::new(FlakyNode::failing(99))).unwrap();
    });

    let workflow_id = harness
        .deploy(json!({
            "nodes": [
                {"id": "doomed", "type": "flaky", "config": {}},
                {"id": "rescue", "type": "echo", "config": {}},
            ],
            "edges": [
                {"id": "e1", "source": "doomed", "target": "rescue", "source_handle": "error"},
            ],
        }))
        .await;

    let run = harness.execute(workflow_id, json!({"x": 1})).await;
    harness.drain(Duration::from_secs(20)).await;

    assert_eq!(harness.run_status(run.id).await, "completed");

    let steps = harness.store.list_steps(run.id).await.unwrap();
    let doomed = steps.iter().find(|s| s.node_id == "doomed").unwrap();
    let rescue = steps.iter().find(|s| s.node_id == "rescue").unwrap();
    assert_eq!(doomed.status, "failed");
    assert_eq!(doomed.attempt_count, doomed.max_attempts);
    assert_eq!(rescue.status, "completed");

    // The rescue step consumed the error trail
    let env: Envelope = serde_json::from_value(rescue.input_envelope.clone()).unwrap();
    assert_eq!(env.errors.len(), 1);
    assert_eq!(env.errors[0].node_id, "doomed");
}

// Run-scoped variables are deleted when the run terminates
#[tokio::test]
async fn test_run_variables_cleared_on_completion() {
    let harness = Harness::new();
    let workflow_id = harness
        .deploy(json!({
            "nodes": [
                {"id": "save", "type": "variable_set", "config": {"name": "marker", "scope": "run", "value": 1}},
            ],
            "edges": [],
        }))
        .await;

    let run = harness.execute(workflow_id, json!({})).await;
    harness.drain(Duration::from_secs(10)).await;

    assert_eq!(harness.run_status(run.id).await, "completed");
    let leftovers = harness
        .store
        .list_variables(gantry_core::VariableScope::Run, &run.id.to_string())
        .await
        .unwrap();
    assert!(leftovers.is_empty());
}

// A trace for the root of the graph carries the run identity forward
#[tokio::test]
async fn test_trace_root_identity() {
    let workflow_id = Uuid::now_v7();
    let run_id = Uuid::now_v7();
    let trace = Trace::root(workflow_id, run_id);

    assert_eq!(trace.workflow_id, workflow_id);
    assert_eq!(trace.run_id, run_id);
    assert_eq!(trace.step_number, 0);
}

//! Trigger engine tests against the in-memory store

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use gantry_core::{EngineConfig, EngineError, NodeRegistry};
use gantry_engine::{RunCoordinator, ScheduleEngine, WebhookDispatcher, WebhookOutcome, WebhookRequest};
use gantry_storage::store::LEADER_KEY;
use gantry_storage::{CreateTrigger, CreateWorkflow, EngineStore, InMemoryEngineStore, RunFilter};

struct Fixture {
    store: Arc<InMemoryEngineStore>,
    coordinator: Arc<RunCoordinator>,
    workflow_id: Uuid,
}

async fn fixture() -> Fixture {
    let store: Arc<InMemoryEngineStore> = Arc::new(InMemoryEngineStore::new());
    let mut registry = NodeRegistry::new();
    gantry_nodes::register_builtins(&mut registry).unwrap();
    let coordinator = Arc::new(RunCoordinator::new(
        store.clone(),
        Arc::new(registry),
        EngineConfig::default(),
    ));

    let definition = json!({
        "nodes": [
            {"id": "hook", "type": "webhook_trigger", "config": {}},
            {"id": "reply", "type": "echo", "config": {}},
        ],
        "edges": [{"id": "e1", "source": "hook", "target": "reply"}],
    });
    let workflow = store
        .create_workflow(CreateWorkflow {
            owner_id: Uuid::now_v7(),
            name: "hooked".into(),
            definition: definition.clone(),
        })
        .await
        .unwrap();
    let version = store.create_version(workflow.id, definition).await.unwrap();
    store
        .deploy_version(workflow.id, version.version_number)
        .await
        .unwrap();

    Fixture {
        store,
        coordinator,
        workflow_id: workflow.id,
    }
}

async fn webhook_trigger(
    fixture: &Fixture,
    token: &str,
    config: serde_json::Value,
    enabled: bool,
) -> Uuid {
    fixture
        .store
        .create_trigger(CreateTrigger {
            workflow_id: fixture.workflow_id,
            provider: "webhook".into(),
            node_id: "hook".into(),
            config,
            token: Some(token.into()),
            enabled,
        })
        .await
        .unwrap()
        .id
}

fn request(token: &str) -> WebhookRequest {
    WebhookRequest {
        token: token.into(),
        method: "POST".into(),
        headers: json!({}),
        body: json!({"ping": true}),
        source_ip: Some("10.0.0.1".into()),
        secret: None,
    }
}

// A firing trigger produces exactly one run row and one start_run item, or
// neither
#[tokio::test]
async fn test_webhook_produces_run_and_start_item_atomically() {
    let fixture = fixture().await;
    let trigger_id = webhook_trigger(&fixture, "tok-1", json!({}), true).await;

    let outcome = WebhookDispatcher::new(fixture.store.clone(), fixture.coordinator.clone())
        .dispatch(request("tok-1"))
        .await
        .unwrap();

    let WebhookOutcome::Accepted { run_id } = outcome else {
        panic!("expected an async acceptance");
    };

    let runs = fixture
        .store
        .list_runs(RunFilter::default())
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, run_id);
    assert_eq!(runs[0].trigger_id, Some(trigger_id));
    assert_eq!(fixture.store.item_count(), 1);

    // last_checked moved
    let trigger = fixture.store.get_trigger(trigger_id).await.unwrap().unwrap();
    assert!(trigger.last_checked.is_some());
}

#[tokio::test]
async fn test_webhook_unknown_or_disabled_token_is_not_found() {
    let fixture = fixture().await;
    webhook_trigger(&fixture, "off", json!({}), false).await;

    let dispatcher = WebhookDispatcher::new(fixture.store.clone(), fixture.coordinator.clone());

    let missing = dispatcher.dispatch(request("nope")).await.unwrap_err();
    assert!(matches!(missing, EngineError::NotFound(_)));

    let disabled = dispatcher.dispatch(request("off")).await.unwrap_err();
    assert!(matches!(disabled, EngineError::NotFound(_)));

    // Neither produced a run or an item
    assert_eq!(fixture.store.run_count(), 0);
    assert_eq!(fixture.store.item_count(), 0);
}

#[tokio::test]
async fn test_webhook_method_allowlist_enforced() {
    let fixture = fixture().await;
    webhook_trigger(&fixture, "postonly", json!({"method": "POST"}), true).await;

    let dispatcher = WebhookDispatcher::new(fixture.store.clone(), fixture.coordinator.clone());

    let mut get = request("postonly");
    get.method = "GET".into();
    let err = dispatcher.dispatch(get).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    assert!(dispatcher.dispatch(request("postonly")).await.is_ok());
}

#[tokio::test]
async fn test_webhook_secret_check() {
    let fixture = fixture().await;
    webhook_trigger(&fixture, "locked", json!({"secret": "s3cret"}), true).await;

    let dispatcher = WebhookDispatcher::new(fixture.store.clone(), fixture.coordinator.clone());

    let err = dispatcher.dispatch(request("locked")).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let mut wrong = request("locked");
    wrong.secret = Some("guess".into());
    assert!(dispatcher.dispatch(wrong).await.is_err());

    let mut right = request("locked");
    right.secret = Some("s3cret".into());
    assert!(dispatcher.dispatch(right).await.is_ok());
}

#[tokio::test]
async fn test_create_run_requires_deployed_version() {
    let store: Arc<InMemoryEngineStore> = Arc::new(InMemoryEngineStore::new());
    let coordinator = RunCoordinator::new(
        store.clone(),
        Arc::new(NodeRegistry::new()),
        EngineConfig::default(),
    );

    let workflow = store
        .create_workflow(CreateWorkflow {
            owner_id: Uuid::now_v7(),
            name: "undeployed".into(),
            definition: json!({}),
        })
        .await
        .unwrap();

    let err = coordinator
        .create_run(gantry_engine::coordinator::NewRun::new(workflow.id, json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Precondition(_)));
}

// The cron scheduler fires an every-second expression while leader and
// enabled, and never when another instance holds the lock
#[tokio::test]
async fn test_schedule_engine_fires_when_leader() {
    let fixture = fixture().await;
    fixture
        .store
        .create_trigger(CreateTrigger {
            workflow_id: fixture.workflow_id,
            provider: "schedule".into(),
            node_id: "hook".into(),
            config: json!({"cron": "* * * * * *"}),
            token: None,
            enabled: true,
        })
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = ScheduleEngine::new(
        fixture.store.clone(),
        fixture.coordinator.clone(),
        Uuid::now_v7(),
        Duration::from_secs(1),
        shutdown_rx,
    );
    let handle = tokio::spawn(engine.run());

    tokio::time::sleep(Duration::from_millis(2500)).await;
    shutdown_tx.send(true).unwrap();
    let _ = handle.await;

    let runs = fixture.store.list_runs(RunFilter::default()).await.unwrap();
    assert!(
        !runs.is_empty(),
        "an every-second schedule should have fired at least once"
    );
}

#[tokio::test]
async fn test_schedule_engine_defers_to_existing_leader() {
    let fixture = fixture().await;
    fixture
        .store
        .create_trigger(CreateTrigger {
            workflow_id: fixture.workflow_id,
            provider: "schedule".into(),
            node_id: "hook".into(),
            config: json!({"cron": "* * * * * *"}),
            token: None,
            enabled: true,
        })
        .await
        .unwrap();

    // Another instance already holds the lock
    let other = Uuid::now_v7();
    assert!(fixture
        .store
        .try_acquire_leadership(LEADER_KEY, other)
        .await
        .unwrap());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = ScheduleEngine::new(
        fixture.store.clone(),
        fixture.coordinator.clone(),
        Uuid::now_v7(),
        Duration::from_secs(1),
        shutdown_rx,
    );
    let handle = tokio::spawn(engine.run());

    tokio::time::sleep(Duration::from_millis(1800)).await;
    shutdown_tx.send(true).unwrap();
    let _ = handle.await;

    let runs = fixture.store.list_runs(RunFilter::default()).await.unwrap();
    assert!(runs.is_empty(), "a non-leader must never fire cron triggers");
}

// Invalid cron expressions are skipped without crashing the engine
#[tokio::test]
async fn test_invalid_cron_is_skipped() {
    let fixture = fixture().await;
    fixture
        .store
        .create_trigger(CreateTrigger {
            workflow_id: fixture.workflow_id,
            provider: "schedule".into(),
            node_id: "hook".into(),
            config: json!({"cron": "definitely not cron"}),
            token: None,
            enabled: true,
        })
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = ScheduleEngine::new(
        fixture.store.clone(),
        fixture.coordinator.clone(),
        Uuid::now_v7(),
        Duration::from_secs(1),
        shutdown_rx,
    );
    let handle = tokio::spawn(engine.run());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    shutdown_tx.send(true).unwrap();
    handle.await.expect("engine must not panic on bad cron");

    assert_eq!(fixture.store.run_count(), 0);
}

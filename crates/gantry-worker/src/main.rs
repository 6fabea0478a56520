use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gantry_core::{EngineConfig, NodeRegistry};
use gantry_engine::{RunCoordinator, ScheduleEngine};
use gantry_storage::{EngineStore, PostgresEngineStore};
use gantry_worker::{Reaper, StepExecutor, WorkerPool, WorkerPoolConfig};

/// Exit codes: 0 normal, 1 startup failure, 2 fatal store error after start,
/// 130 interrupt
fn main() {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    let code = runtime.block_on(run());
    std::process::exit(code);
}

async fn run() -> i32 {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry_worker=debug,gantry_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("gantry-worker starting...");

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {}", e);
            return 1;
        }
    };

    let store = match PostgresEngineStore::connect(&config.database_url).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("failed to connect to database: {}", e);
            return 1;
        }
    };
    if let Err(e) = store.migrate().await {
        tracing::error!("migration failed: {}", e);
        return 1;
    }
    let store: Arc<dyn EngineStore> = Arc::new(store);
    tracing::info!("database connection established");

    // The registry must be installed before any loop starts
    let mut registry = NodeRegistry::new();
    if let Err(e) = gantry_nodes::register_builtins(&mut registry) {
        tracing::error!("node registration failed: {}", e);
        return 1;
    }
    let registry = match registry.install() {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!("registry installation failed: {}", e);
            return 1;
        }
    };
    tracing::info!(node_types = registry.len(), "node registry installed");

    let coordinator = Arc::new(RunCoordinator::new(
        store.clone(),
        registry,
        config.clone(),
    ));

    let pool_config = WorkerPoolConfig {
        capabilities: worker_capabilities(),
        max_concurrent_steps: config.max_concurrent_steps,
        heartbeat_interval: config.heartbeat_interval,
        ..Default::default()
    };
    let worker_id = pool_config.worker_id;

    let executor = Arc::new(StepExecutor::new(coordinator.clone(), worker_id));
    let pool = Arc::new(WorkerPool::new(store.clone(), executor, pool_config));

    if let Err(e) = pool.start().await {
        tracing::error!("worker registration failed: {}", e);
        return 1;
    }

    // Reaper and cron scheduler run everywhere but only act while holding
    // the cluster leadership lock
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = Reaper::new(
        store.clone(),
        coordinator.clone(),
        worker_id,
        config.clone(),
        shutdown_rx.clone(),
    );
    let reaper_handle = tokio::spawn(reaper.run());

    let scheduler = ScheduleEngine::new(
        store.clone(),
        coordinator.clone(),
        worker_id,
        config.sync_interval,
        shutdown_rx,
    );
    let scheduler_handle = tokio::spawn(scheduler.run());

    tracing::info!(%worker_id, "worker ready");

    let mut fatal_rx = pool.fatal_signal();
    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
            130
        }
        _ = fatal_rx.changed() => {
            tracing::error!("unrecoverable store error, shutting down");
            2
        }
    };

    let _ = shutdown_tx.send(true);
    pool.shutdown().await;
    let _ = reaper_handle.await;
    let _ = scheduler_handle.await;

    tracing::info!("gantry-worker stopped");
    exit_code
}

/// Capability set from `WORKER_CAPABILITIES` (comma-separated); empty means
/// this worker executes any node type
fn worker_capabilities() -> Vec<String> {
    std::env::var("WORKER_CAPABILITIES")
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

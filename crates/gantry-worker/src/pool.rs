//! Worker pool
//!
//! A worker registers itself (obtaining an id and capability set), then runs
//! two loops: a heartbeat that reports liveness and load, and a claim loop
//! that pulls items and dispatches them concurrently under a semaphore. On a
//! drain signal it stops claiming, finishes in-flight items up to a timeout,
//! and deregisters.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use gantry_core::WorkerStatus;
use gantry_storage::{EngineStore, RegisterWorker, StoreError};

use crate::executor::StepExecutor;
use crate::poller::{ItemPoller, PollerConfig};

/// Backoff applied when an item's handling fails and it is nacked
const NACK_BACKOFF: Duration = Duration::from_secs(10);

/// Consecutive heartbeat failures treated as an unrecoverable store error
const FATAL_HEARTBEAT_FAILURES: u32 = 5;

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_id: Uuid,
    pub hostname: String,

    /// Node types this worker executes; empty means any
    pub capabilities: Vec<String>,

    /// Maximum concurrent step executions
    pub max_concurrent_steps: usize,

    pub heartbeat_interval: Duration,
    pub poller: PollerConfig,

    /// Grace period for in-flight steps during drain
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: Uuid::now_v7(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            capabilities: Vec::new(),
            max_concurrent_steps: 10,
            heartbeat_interval: Duration::from_secs(5),
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_max_concurrent_steps(mut self, max: usize) -> Self {
        self.max_concurrent_steps = max.max(1);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Long-running worker claiming and executing queue items
pub struct WorkerPool {
    store: Arc<dyn EngineStore>,
    executor: Arc<StepExecutor>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    fatal_tx: watch::Sender<bool>,
    fatal_rx: watch::Receiver<bool>,
    active: Arc<Semaphore>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn EngineStore>,
        executor: Arc<StepExecutor>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = watch::channel(false);

        Self {
            store,
            executor,
            active: Arc::new(Semaphore::new(config.max_concurrent_steps)),
            config,
            shutdown_tx,
            shutdown_rx,
            fatal_tx,
            fatal_rx,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.config.worker_id
    }

    /// Fires when the pool hits an unrecoverable store error
    pub fn fatal_signal(&self) -> watch::Receiver<bool> {
        self.fatal_rx.clone()
    }

    /// Register with the store and start the claim and heartbeat loops
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), StoreError> {
        info!(
            worker_id = %self.config.worker_id,
            capabilities = ?self.config.capabilities,
            max_concurrent_steps = self.config.max_concurrent_steps,
            "starting worker pool"
        );

        self.store
            .register_worker(RegisterWorker {
                id: self.config.worker_id,
                hostname: self.config.hostname.clone(),
                capabilities: self.config.capabilities.clone(),
                max_concurrent_steps: self.config.max_concurrent_steps as i32,
            })
            .await?;

        self.start_claim_loop();
        self.start_heartbeat_loop();
        Ok(())
    }

    /// Drain: stop claiming, finish in-flight items, mark self dead
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) {
        info!("draining worker");
        let _ = self.shutdown_tx.send(true);

        // Report draining before the final heartbeat loop tick dies
        if let Err(e) = self
            .store
            .worker_heartbeat(
                self.config.worker_id,
                self.current_load() as i32,
                WorkerStatus::Draining,
            )
            .await
        {
            warn!("draining heartbeat failed: {}", e);
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.active.available_permits() == self.config.max_concurrent_steps {
                debug!("all in-flight steps finished");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    in_flight = self.current_load(),
                    "drain timeout reached, abandoning in-flight steps"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if let Err(e) = self.store.deregister_worker(self.config.worker_id).await {
            warn!("deregistration failed: {}", e);
        }

        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
        info!("worker stopped");
    }

    /// Steps currently in flight
    pub fn current_load(&self) -> usize {
        self.config.max_concurrent_steps - self.active.available_permits()
    }

    fn start_claim_loop(&self) {
        let store = self.store.clone();
        let executor = self.executor.clone();
        let config = self.config.clone();
        let active = self.active.clone();
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut poller = ItemPoller::new(
                store.clone(),
                config.worker_id,
                config.capabilities.clone(),
                config.poller.clone(),
                shutdown_rx,
            );

            loop {
                if poller.is_shutdown() {
                    debug!("claim loop: shutdown requested");
                    break;
                }

                let available = active.available_permits();
                if available == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available).await {
                    Ok(items) => {
                        for item in items {
                            let permit = match active.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    debug!("no execution slots left");
                                    break;
                                }
                            };

                            let store = store.clone();
                            let executor = executor.clone();
                            tokio::spawn(async move {
                                let item_id = item.id;
                                match executor.handle_item(&item).await {
                                    Ok(()) => {
                                        if let Err(e) = store.ack_item(item_id).await {
                                            error!(%item_id, "ack failed: {}", e);
                                        }
                                    }
                                    Err(e) => {
                                        warn!(%item_id, "item handling failed: {}", e);
                                        if let Err(nack_err) = store
                                            .nack_item(item_id, &e.to_string(), NACK_BACKOFF)
                                            .await
                                        {
                                            error!(%item_id, "nack failed: {}", nack_err);
                                        }
                                    }
                                }
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => {
                        error!("claim failed: {}", e);
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("claim loop exited");
        });

        self.handles.lock().unwrap().push(handle);
    }

    fn start_heartbeat_loop(&self) {
        let store = self.store.clone();
        let worker_id = self.config.worker_id;
        let interval = self.config.heartbeat_interval;
        let active = self.active.clone();
        let max = self.config.max_concurrent_steps;
        let mut shutdown_rx = self.shutdown_rx.clone();
        let fatal_tx = self.fatal_tx.clone();
        let draining = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let load = (max - active.available_permits()) as i32;
                        let status = if *draining.borrow() {
                            WorkerStatus::Draining
                        } else if load > 0 {
                            WorkerStatus::Busy
                        } else {
                            WorkerStatus::Idle
                        };

                        match store.worker_heartbeat(worker_id, load, status).await {
                            Ok(_) => failures = 0,
                            Err(e) => {
                                failures += 1;
                                error!(failures, "heartbeat failed: {}", e);
                                if failures >= FATAL_HEARTBEAT_FAILURES {
                                    let _ = fatal_tx.send(true);
                                    break;
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("heartbeat loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("heartbeat loop exited");
        });

        self.handles.lock().unwrap().push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(config.capabilities.is_empty());
        assert_eq!(config.max_concurrent_steps, 10);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::default()
            .with_capabilities(vec!["llm".into()])
            .with_max_concurrent_steps(4)
            .with_heartbeat_interval(Duration::from_secs(1));

        assert_eq!(config.capabilities, vec!["llm"]);
        assert_eq!(config.max_concurrent_steps, 4);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
    }
}

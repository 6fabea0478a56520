//! Leader-elected reaper and run watchdog
//!
//! One elected instance per cluster (advisory lock on a constant key) runs
//! this loop every `reap_interval`:
//!
//! 1. Mark workers with stale heartbeats `dead`
//! 2. Release queue leases those workers held, making the items claimable
//! 3. Fail runs that outlived their `timeout_seconds`
//!
//! Fail-over is automatic: when the holder dies its lock releases and the
//! next instance to tick becomes leader.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gantry_core::error::reason;
use gantry_core::{EngineConfig, RunStatus};
use gantry_engine::RunCoordinator;
use gantry_storage::store::LEADER_KEY;
use gantry_storage::EngineStore;

pub struct Reaper {
    store: Arc<dyn EngineStore>,
    coordinator: Arc<RunCoordinator>,
    holder_id: Uuid,
    config: EngineConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn EngineStore>,
        coordinator: Arc<RunCoordinator>,
        holder_id: Uuid,
        config: EngineConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            coordinator,
            holder_id,
            config,
            shutdown_rx,
        }
    }

    /// Run until shutdown; only ticks while holding leadership
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.reap_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown_rx.changed() => {
                    debug!("reaper: shutdown requested");
                    break;
                }
            }

            match self
                .store
                .try_acquire_leadership(LEADER_KEY, self.holder_id)
                .await
            {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!("leadership check failed: {}", e);
                    continue;
                }
            }

            self.tick().await;
        }

        if let Err(e) = self
            .store
            .release_leadership(LEADER_KEY, self.holder_id)
            .await
        {
            warn!("leadership release failed: {}", e);
        }
    }

    async fn tick(&self) {
        let deadline = Utc::now()
            - chrono::Duration::from_std(self.config.heartbeat_timeout).unwrap_or_else(|_| chrono::Duration::zero());

        match self.store.mark_dead_workers(deadline).await {
            Ok(dead) if !dead.is_empty() => {
                info!(count = dead.len(), "marked workers dead");
            }
            Ok(_) => {}
            Err(e) => warn!("dead-worker sweep failed: {}", e),
        }

        match self.store.reap_expired_leases(deadline).await {
            Ok(reaped) if !reaped.is_empty() => {
                info!(count = reaped.len(), "requeued items from expired leases");
            }
            Ok(_) => {}
            Err(e) => warn!("lease reap failed: {}", e),
        }

        // Run timeout watchdog
        match self.store.list_overdue_runs(Utc::now()).await {
            Ok(overdue) => {
                for run in overdue {
                    info!(run_id = %run.id, "run exceeded its deadline");
                    if let Err(e) = self
                        .coordinator
                        .abort_run(
                            run.id,
                            RunStatus::Failed,
                            serde_json::json!({ "reason": reason::TIMEOUT }),
                        )
                        .await
                    {
                        warn!(run_id = %run.id, "timeout abort failed: {}", e);
                    }
                }
            }
            Err(e) => warn!("overdue-run scan failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::NodeRegistry;
    use gantry_storage::InMemoryEngineStore;

    #[tokio::test]
    async fn test_only_leader_ticks() {
        let store: Arc<InMemoryEngineStore> = Arc::new(InMemoryEngineStore::new());
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();

        // First holder wins; the second cannot acquire until release
        assert!(store.try_acquire_leadership(LEADER_KEY, a).await.unwrap());
        assert!(!store.try_acquire_leadership(LEADER_KEY, b).await.unwrap());

        store.release_leadership(LEADER_KEY, a).await.unwrap();
        assert!(store.try_acquire_leadership(LEADER_KEY, b).await.unwrap());
    }

    #[tokio::test]
    async fn test_reaper_construction() {
        let store: Arc<InMemoryEngineStore> = Arc::new(InMemoryEngineStore::new());
        let coordinator = Arc::new(RunCoordinator::new(
            store.clone(),
            Arc::new(NodeRegistry::new()),
            EngineConfig::default(),
        ));
        let (tx, rx) = watch::channel(false);

        let reaper = Reaper::new(
            store,
            coordinator,
            Uuid::now_v7(),
            EngineConfig::default(),
            rx,
        );

        // Shut down immediately; run() must return
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), reaper.run())
            .await
            .expect("reaper should exit on shutdown");
    }
}

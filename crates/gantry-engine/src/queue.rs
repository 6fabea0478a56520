//! Typed facade over the durable work queue
//!
//! The queue itself is a table in the engine store; this wrapper names the
//! operations workers and the coordinator perform and applies the priority
//! defaults (start_run 5, execute_step 5, retry_step 3, complete_run 9).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::instrument;
use uuid::Uuid;

use gantry_core::QueueType;
use gantry_storage::{EngineStore, EnqueueItem, NackOutcome, QueueItemRow, StepRow, StoreError};

#[derive(Clone)]
pub struct WorkQueue {
    store: Arc<dyn EngineStore>,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    /// Enqueue execution of a pending step
    #[instrument(skip(self, step), fields(step_id = %step.id, node_id = %step.node_id))]
    pub async fn enqueue_execute_step(&self, step: &StepRow) -> Result<QueueItemRow, StoreError> {
        self.store
            .enqueue(
                EnqueueItem::new(step.run_id, QueueType::ExecuteStep)
                    .for_step(step.id, step.node_type.clone()),
            )
            .await
    }

    /// Enqueue a step retry, claimable once `next_retry_at` arrives
    #[instrument(skip(self, step), fields(step_id = %step.id))]
    pub async fn enqueue_retry_step(
        &self,
        step: &StepRow,
        next_retry_at: DateTime<Utc>,
    ) -> Result<QueueItemRow, StoreError> {
        self.store
            .enqueue(
                EnqueueItem::new(step.run_id, QueueType::RetryStep)
                    .for_step(step.id, step.node_type.clone())
                    .available_at(next_retry_at),
            )
            .await
    }

    /// Enqueue run finalization
    #[instrument(skip(self))]
    pub async fn enqueue_complete_run(&self, run_id: Uuid) -> Result<QueueItemRow, StoreError> {
        self.store
            .enqueue(EnqueueItem::new(run_id, QueueType::CompleteRun))
            .await
    }

    /// Claim up to `max_items` items matching the worker's capabilities
    pub async fn claim(
        &self,
        worker_id: Uuid,
        capabilities: &[String],
        max_items: usize,
    ) -> Result<Vec<QueueItemRow>, StoreError> {
        self.store.claim_items(worker_id, capabilities, max_items).await
    }

    /// Acknowledge (delete) a handled item
    pub async fn ack(&self, item_id: Uuid) -> Result<(), StoreError> {
        self.store.ack_item(item_id).await
    }

    /// Return an item after a delivery failure
    pub async fn nack(
        &self,
        item_id: Uuid,
        reason: &str,
        backoff: Duration,
    ) -> Result<NackOutcome, StoreError> {
        self.store.nack_item(item_id, reason, backoff).await
    }

    /// Release leases held by workers that missed the heartbeat deadline
    pub async fn reap(&self, heartbeat_deadline: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        self.store.reap_expired_leases(heartbeat_deadline).await
    }
}

//! Queue polling with exponential idle backoff
//!
//! Polls back off when the queue is empty and snap back to the minimum
//! interval as soon as work appears.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, trace};
use uuid::Uuid;

use gantry_storage::{EngineStore, QueueItemRow, StoreError};

/// Polling configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when items are available)
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    pub max_interval: Duration,

    /// Backoff multiplier when no items are found
    pub backoff_multiplier: f64,

    /// Maximum items to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Claims queue items with adaptive backoff
pub struct ItemPoller {
    store: Arc<dyn EngineStore>,
    worker_id: Uuid,
    capabilities: Vec<String>,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ItemPoller {
    pub fn new(
        store: Arc<dyn EngineStore>,
        worker_id: Uuid,
        capabilities: Vec<String>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            worker_id,
            capabilities,
            config: config.clone(),
            current_interval: config.min_interval,
            shutdown_rx,
        }
    }

    /// Poll for claimable items, updating the backoff state
    pub async fn poll(&mut self, max_items: usize) -> Result<Vec<QueueItemRow>, StoreError> {
        if self.is_shutdown() {
            return Ok(vec![]);
        }

        let batch = max_items.min(self.config.batch_size);
        let items = self
            .store
            .claim_items(self.worker_id, &self.capabilities, batch)
            .await?;

        if items.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis(),
                "queue empty, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = items.len(), "claimed items");
        }

        Ok(items)
    }

    /// Sleep for the current backoff interval; true means shutdown
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => true,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_storage::InMemoryEngineStore;

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.min_interval, Duration::from_millis(100));
        assert_eq!(config.max_interval, Duration::from_secs(5));
        assert_eq!(config.batch_size, 10);
    }

    #[tokio::test]
    async fn test_backoff_grows_and_caps() {
        let store = Arc::new(InMemoryEngineStore::new());
        let (_tx, rx) = watch::channel(false);
        let mut poller = ItemPoller::new(
            store,
            Uuid::now_v7(),
            vec![],
            PollerConfig::default(),
            rx,
        );

        let start = poller.current_interval;
        for _ in 0..20 {
            poller.poll(10).await.unwrap();
        }
        assert!(poller.current_interval > start);
        assert!(poller.current_interval <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_shutdown_short_circuits_poll() {
        let store = Arc::new(InMemoryEngineStore::new());
        let (tx, rx) = watch::channel(false);
        let mut poller = ItemPoller::new(
            store,
            Uuid::now_v7(),
            vec![],
            PollerConfig::default(),
            rx,
        );

        tx.send(true).unwrap();
        assert!(poller.is_shutdown());
        assert!(poller.poll(10).await.unwrap().is_empty());
    }
}

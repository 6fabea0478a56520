//! # Gantry Worker
//!
//! Long-running workers claim items from the durable queue and execute them:
//!
//! - [`WorkerPool`]: registration, heartbeats, the claim loop with adaptive
//!   poll backoff, concurrency limiting, and graceful drain
//! - [`StepExecutor`]: dispatch of the four queue item kinds
//!   (`start_run`, `execute_step`, `retry_step`, `complete_run`)
//! - [`Reaper`]: the leader-elected loop that returns leases held by dead
//!   workers and fails runs that outlived their deadline

pub mod executor;
pub mod poller;
pub mod pool;
pub mod reaper;

pub use executor::StepExecutor;
pub use poller::{ItemPoller, PollerConfig};
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use reaper::Reaper;

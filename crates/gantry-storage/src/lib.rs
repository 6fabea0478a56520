//! # Gantry Storage
//!
//! Transactional durable state for runs, steps, the work queue, workers,
//! triggers, and workflow definitions.
//!
//! The [`EngineStore`] trait is the single persistence contract. Two
//! implementations ship:
//!
//! - [`PostgresEngineStore`]: production, backed by sqlx/PostgreSQL. Queue
//!   claiming uses `FOR UPDATE SKIP LOCKED`; leader election uses advisory
//!   locks; state transitions use optimistic status preconditions.
//! - [`InMemoryEngineStore`]: same semantics in memory, for tests.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::InMemoryEngineStore;
pub use models::*;
pub use postgres::PostgresEngineStore;
pub use store::{EngineStore, NackOutcome, StoreError};

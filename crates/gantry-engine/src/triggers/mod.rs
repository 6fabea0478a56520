//! Trigger engine
//!
//! Two provider families create runs without an API caller:
//!
//! - [`schedule`]: a leader-gated cron scheduler reconciled against the
//!   trigger table
//! - [`webhook`]: the dispatcher behind `POST /webhooks/{token}`

pub mod schedule;
pub mod webhook;

/// Provider name for cron-scheduled triggers
pub const PROVIDER_SCHEDULE: &str = "schedule";

/// Provider name for webhook triggers
pub const PROVIDER_WEBHOOK: &str = "webhook";

//! Cron scheduler for schedule triggers
//!
//! Periodically reconciles an in-memory job table against the trigger rows:
//! new/enabled triggers with a valid cron expression get a job, disabled or
//! deleted triggers lose theirs. Only the cluster leader fires jobs, so cron
//! does not fire N times in an N-worker fleet. Invalid expressions are
//! logged and skipped; they never crash the engine.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gantry_storage::EngineStore;
use gantry_storage::store::LEADER_KEY;

use crate::coordinator::{NewRun, RunCoordinator};
use crate::triggers::PROVIDER_SCHEDULE;

/// One scheduled job derived from a trigger row
struct Job {
    workflow_id: Uuid,
    node_id: String,
    expression: String,
    schedule: Schedule,
    next_fire: DateTime<Utc>,
}

/// Leader-gated cron scheduler
pub struct ScheduleEngine {
    store: Arc<dyn EngineStore>,
    coordinator: Arc<RunCoordinator>,
    holder_id: Uuid,
    sync_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

/// Parse a standard 5- or 6-field cron expression
///
/// The 5-field form gets a seconds column of `0` prepended, so `*/5 * * * *`
/// means "every five minutes at second zero".
pub fn parse_cron(expr: &str) -> Option<Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expr),
        6 | 7 => expr.to_string(),
        _ => return None,
    };
    Schedule::from_str(&normalized).ok()
}

impl ScheduleEngine {
    pub fn new(
        store: Arc<dyn EngineStore>,
        coordinator: Arc<RunCoordinator>,
        holder_id: Uuid,
        sync_interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            coordinator,
            holder_id,
            sync_interval,
            shutdown_rx,
        }
    }

    /// Run the scheduler until shutdown is signaled
    pub async fn run(mut self) {
        let mut jobs: HashMap<Uuid, Job> = HashMap::new();
        let mut last_sync: Option<DateTime<Utc>> = None;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown_rx.changed() => {
                    debug!("schedule engine: shutdown requested");
                    break;
                }
            }

            let is_leader = match self
                .store
                .try_acquire_leadership(LEADER_KEY, self.holder_id)
                .await
            {
                Ok(leader) => leader,
                Err(e) => {
                    warn!("leadership check failed: {}", e);
                    false
                }
            };

            if !is_leader {
                // A different instance owns the schedule; drop local state so
                // a later takeover starts from the store
                if !jobs.is_empty() {
                    jobs.clear();
                }
                last_sync = None;
                continue;
            }

            let now = Utc::now();
            let due_for_sync = last_sync
                .map(|t| now - t >= chrono::Duration::from_std(self.sync_interval).unwrap_or_else(|_| chrono::Duration::zero()))
                .unwrap_or(true);
            if due_for_sync {
                self.reconcile(&mut jobs, now).await;
                last_sync = Some(now);
            }

            self.fire_due(&mut jobs, now).await;
        }
    }

    /// Reconcile the in-memory job table against the trigger rows
    async fn reconcile(&self, jobs: &mut HashMap<Uuid, Job>, now: DateTime<Utc>) {
        let triggers = match self
            .store
            .list_triggers(Some(PROVIDER_SCHEDULE), true)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("trigger reconcile failed: {}", e);
                return;
            }
        };

        let live: Vec<Uuid> = triggers.iter().map(|t| t.id).collect();
        jobs.retain(|id, _| live.contains(id));

        for trigger in triggers {
            let Some(expr) = trigger.config.get("cron").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(schedule) = parse_cron(expr) else {
                warn!(trigger_id = %trigger.id, cron = expr, "invalid cron expression, skipping");
                continue;
            };

            let expression_changed = jobs
                .get(&trigger.id)
                .map(|job| job.expression != expr)
                .unwrap_or(true);
            if expression_changed {
                let Some(next_fire) = schedule.after(&now).next() else {
                    continue;
                };
                debug!(trigger_id = %trigger.id, %next_fire, "registered schedule job");
                jobs.insert(
                    trigger.id,
                    Job {
                        workflow_id: trigger.workflow_id,
                        node_id: trigger.node_id.clone(),
                        expression: expr.to_string(),
                        schedule,
                        next_fire,
                    },
                );
            }
        }
    }

    /// Fire every job whose next instant has arrived
    async fn fire_due(&self, jobs: &mut HashMap<Uuid, Job>, now: DateTime<Utc>) {
        for (trigger_id, job) in jobs.iter_mut() {
            if job.next_fire > now {
                continue;
            }

            if let Err(e) = self.fire(*trigger_id, job).await {
                warn!(trigger_id = %trigger_id, "schedule trigger failed to fire: {}", e);
            }

            job.next_fire = job
                .schedule
                .after(&now)
                .next()
                .unwrap_or(now + chrono::Duration::days(365));
        }
    }

    async fn fire(&self, trigger_id: Uuid, job: &Job) -> anyhow::Result<()> {
        self.store.touch_trigger(trigger_id).await?;

        let run = self
            .coordinator
            .create_run(NewRun {
                workflow_id: job.workflow_id,
                input_data: serde_json::json!({ "fired_at": Utc::now() }),
                variables: serde_json::json!({}),
                trigger_id: Some(trigger_id),
                entry_node_id: Some(job.node_id.clone()),
                parent_step_id: None,
                timeout_seconds: None,
            })
            .await?;

        info!(%trigger_id, run_id = %run.id, "schedule trigger fired");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_five_field_cron() {
        let schedule = parse_cron("*/5 * * * *").expect("5-field cron should parse");
        let next = schedule.after(&Utc::now()).next().unwrap();
        assert_eq!(next.timestamp() % 300, 0);
    }

    #[test]
    fn test_parse_six_field_cron() {
        assert!(parse_cron("0 30 9 * * Mon").is_some());
    }

    #[test]
    fn test_invalid_cron_rejected() {
        assert!(parse_cron("not a cron").is_none());
        assert!(parse_cron("* *").is_none());
        assert!(parse_cron("99 99 99 99 99").is_none());
    }

    #[test]
    fn test_hourly_alignment() {
        let schedule = parse_cron("0 * * * *").unwrap();
        let fires: Vec<_> = schedule.after(&Utc::now()).take(3).collect();
        for fire in fires {
            assert_eq!(fire.timestamp() % 3600, 0);
        }
    }
}

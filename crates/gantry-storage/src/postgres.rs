//! PostgreSQL implementation of EngineStore
//!
//! Production persistence with:
//! - Queue claiming via `FOR UPDATE SKIP LOCKED`
//! - Optimistic status preconditions on every state transition
//! - Advisory-lock leader election for the reaper and cron scheduler

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use gantry_core::{QueueType, RunStatus, VariableScope, WorkerStatus};

use crate::models::*;
use crate::store::{EngineStore, NackOutcome, StoreError};

const RUN_COLUMNS: &str = "id, workflow_id, version_id, trigger_id, parent_step_id, status, \
    input_data, variables, retry_policy, timeout_seconds, assigned_worker_id, \
    worker_heartbeat_at, next_step_number, total_steps, completed_steps, created_at, \
    started_at, completed_at, output_data, error_data";

const STEP_COLUMNS: &str = "id, run_id, node_id, node_type, step_number, iteration_index, \
    status, attempt_count, max_attempts, input_envelope, output_envelope, chosen_handle, \
    error_details, assigned_worker_id, waiting_on_run, depends_on, next_retry_at, created_at, \
    started_at, completed_at";

const ITEM_COLUMNS: &str = "id, run_id, step_id, queue_type, node_type, priority, \
    available_at, created_at, claimed_at, claimed_by, attempt_count, max_attempts, \
    last_error, payload";

const VERSION_COLUMNS: &str = "id, workflow_id, version_number, definition, is_current, created_at";

const TRIGGER_COLUMNS: &str =
    "id, workflow_id, provider, node_id, config, token, enabled, last_checked, created_at";

const WORKER_COLUMNS: &str = "id, hostname, capabilities, status, max_concurrent_steps, \
    current_step_count, last_heartbeat, started_at";

/// Dedicated connection holding the leadership advisory lock
///
/// Advisory locks are session-scoped, so the lock must live on a connection
/// that is not returned to the pool while held.
struct LeaderConn {
    conn: Option<sqlx::pool::PoolConnection<Postgres>>,
    held: bool,
}

/// PostgreSQL implementation of EngineStore
///
/// # Example
///
/// ```ignore
/// let store = PostgresEngineStore::connect("postgres://localhost/gantry").await?;
/// store.migrate().await?;
/// ```
pub struct PostgresEngineStore {
    pool: PgPool,
    leader: tokio::sync::Mutex<LeaderConn>,
}

impl PostgresEngineStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            leader: tokio::sync::Mutex::new(LeaderConn {
                conn: None,
                held: false,
            }),
        }
    }

    /// Connect with sensible pool defaults
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .map_err(StoreError::database)?;
        Ok(Self::new(pool))
    }

    /// Apply embedded migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(StoreError::database)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn chrono_backoff(backoff: Duration) -> chrono::Duration {
    chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::seconds(0))
}

#[async_trait]
impl EngineStore for PostgresEngineStore {
    // =========================================================================
    // Workflows
    // =========================================================================

    #[instrument(skip(self, input))]
    async fn create_workflow(&self, input: CreateWorkflow) -> Result<WorkflowRow, StoreError> {
        let workflow_id = Uuid::now_v7();
        let mut tx = self.pool.begin().await.map_err(StoreError::database)?;

        let row = sqlx::query_as::<_, WorkflowRow>(
            r#"
            INSERT INTO workflows (id, owner_id, name)
            VALUES ($1, $2, $3)
            RETURNING id, owner_id, name, created_at, updated_at
            "#,
        )
        .bind(workflow_id)
        .bind(input.owner_id)
        .bind(&input.name)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::database)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_drafts (workflow_id, definition)
            VALUES ($1, $2)
            "#,
        )
        .bind(workflow_id)
        .bind(&input.definition)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::database)?;

        tx.commit().await.map_err(StoreError::database)?;

        debug!(%workflow_id, name = %row.name, "created workflow");
        Ok(row)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRow>, StoreError> {
        sqlx::query_as::<_, WorkflowRow>(
            "SELECT id, owner_id, name, created_at, updated_at FROM workflows WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn list_workflows(&self, owner_id: Option<Uuid>) -> Result<Vec<WorkflowRow>, StoreError> {
        sqlx::query_as::<_, WorkflowRow>(
            r#"
            SELECT id, owner_id, name, created_at, updated_at
            FROM workflows
            WHERE ($1::uuid IS NULL OR owner_id = $1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn rename_workflow(
        &self,
        id: Uuid,
        name: &str,
    ) -> Result<Option<WorkflowRow>, StoreError> {
        sqlx::query_as::<_, WorkflowRow>(
            r#"
            UPDATE workflows
            SET name = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, owner_id, name, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    #[instrument(skip(self))]
    async fn delete_workflow(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Drafts
    // =========================================================================

    async fn get_draft(&self, workflow_id: Uuid) -> Result<Option<DraftRow>, StoreError> {
        sqlx::query_as::<_, DraftRow>(
            "SELECT workflow_id, definition, updated_at FROM workflow_drafts WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn put_draft(
        &self,
        workflow_id: Uuid,
        definition: serde_json::Value,
    ) -> Result<DraftRow, StoreError> {
        sqlx::query_as::<_, DraftRow>(
            r#"
            INSERT INTO workflow_drafts (workflow_id, definition, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (workflow_id) DO UPDATE SET
                definition = EXCLUDED.definition,
                updated_at = NOW()
            RETURNING workflow_id, definition, updated_at
            "#,
        )
        .bind(workflow_id)
        .bind(&definition)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    // =========================================================================
    // Versions
    // =========================================================================

    #[instrument(skip(self, definition))]
    async fn create_version(
        &self,
        workflow_id: Uuid,
        definition: serde_json::Value,
    ) -> Result<WorkflowVersionRow, StoreError> {
        let version_id = Uuid::now_v7();
        let mut tx = self.pool.begin().await.map_err(StoreError::database)?;

        // Serialize concurrent snapshots of the same workflow
        sqlx::query("SELECT id FROM workflows WHERE id = $1 FOR UPDATE")
            .bind(workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::database)?
            .ok_or_else(|| StoreError::NotFound(format!("workflow {}", workflow_id)))?;

        let row = sqlx::query_as::<_, WorkflowVersionRow>(&format!(
            r#"
            INSERT INTO workflow_versions (id, workflow_id, version_number, definition)
            SELECT $1, $2, COALESCE(MAX(version_number), 0) + 1, $3
            FROM workflow_versions
            WHERE workflow_id = $2
            RETURNING {VERSION_COLUMNS}
            "#
        ))
        .bind(version_id)
        .bind(workflow_id)
        .bind(&definition)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::database)?;

        tx.commit().await.map_err(StoreError::database)?;

        debug!(%workflow_id, version = row.version_number, "created version");
        Ok(row)
    }

    async fn list_versions(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<WorkflowVersionRow>, StoreError> {
        sqlx::query_as::<_, WorkflowVersionRow>(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE workflow_id = $1 ORDER BY version_number"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn get_version(
        &self,
        version_id: Uuid,
    ) -> Result<Option<WorkflowVersionRow>, StoreError> {
        sqlx::query_as::<_, WorkflowVersionRow>(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE id = $1"
        ))
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn get_version_by_number(
        &self,
        workflow_id: Uuid,
        version_number: i32,
    ) -> Result<Option<WorkflowVersionRow>, StoreError> {
        sqlx::query_as::<_, WorkflowVersionRow>(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE workflow_id = $1 AND version_number = $2"
        ))
        .bind(workflow_id)
        .bind(version_number)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn current_version(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowVersionRow>, StoreError> {
        sqlx::query_as::<_, WorkflowVersionRow>(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_versions WHERE workflow_id = $1 AND is_current"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    #[instrument(skip(self))]
    async fn deploy_version(
        &self,
        workflow_id: Uuid,
        version_number: i32,
    ) -> Result<WorkflowVersionRow, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::database)?;

        sqlx::query(
            "UPDATE workflow_versions SET is_current = FALSE WHERE workflow_id = $1 AND is_current",
        )
        .bind(workflow_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::database)?;

        let row = sqlx::query_as::<_, WorkflowVersionRow>(&format!(
            r#"
            UPDATE workflow_versions
            SET is_current = TRUE
            WHERE workflow_id = $1 AND version_number = $2
            RETURNING {VERSION_COLUMNS}
            "#
        ))
        .bind(workflow_id)
        .bind(version_number)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::database)?
        .ok_or_else(|| {
            StoreError::NotFound(format!(
                "version {} of workflow {}",
                version_number, workflow_id
            ))
        })?;

        tx.commit().await.map_err(StoreError::database)?;

        debug!(%workflow_id, version_number, "deployed version");
        Ok(row)
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    #[instrument(skip(self, input))]
    async fn create_trigger(&self, input: CreateTrigger) -> Result<TriggerRow, StoreError> {
        let trigger_id = Uuid::now_v7();

        sqlx::query_as::<_, TriggerRow>(&format!(
            r#"
            INSERT INTO triggers (id, workflow_id, provider, node_id, config, token, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {TRIGGER_COLUMNS}
            "#
        ))
        .bind(trigger_id)
        .bind(input.workflow_id)
        .bind(&input.provider)
        .bind(&input.node_id)
        .bind(&input.config)
        .bind(&input.token)
        .bind(input.enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn get_trigger(&self, id: Uuid) -> Result<Option<TriggerRow>, StoreError> {
        sqlx::query_as::<_, TriggerRow>(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn get_trigger_by_token(&self, token: &str) -> Result<Option<TriggerRow>, StoreError> {
        sqlx::query_as::<_, TriggerRow>(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn list_triggers(
        &self,
        provider: Option<&str>,
        enabled_only: bool,
    ) -> Result<Vec<TriggerRow>, StoreError> {
        sqlx::query_as::<_, TriggerRow>(&format!(
            r#"
            SELECT {TRIGGER_COLUMNS}
            FROM triggers
            WHERE ($1::text IS NULL OR provider = $1)
              AND (NOT $2 OR enabled)
            ORDER BY created_at
            "#
        ))
        .bind(provider)
        .bind(enabled_only)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn list_workflow_triggers(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<TriggerRow>, StoreError> {
        sqlx::query_as::<_, TriggerRow>(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE workflow_id = $1 ORDER BY created_at"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn set_trigger_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE triggers SET enabled = $2 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch_trigger(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE triggers SET last_checked = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;
        Ok(())
    }

    async fn delete_workflow_triggers(&self, workflow_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM triggers WHERE workflow_id = $1")
            .bind(workflow_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Runs
    // =========================================================================

    #[instrument(skip(self, input))]
    async fn create_run(&self, input: CreateRun) -> Result<RunRow, StoreError> {
        let run_id = Uuid::now_v7();
        let item_id = Uuid::now_v7();
        let mut tx = self.pool.begin().await.map_err(StoreError::database)?;

        let row = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            INSERT INTO runs (id, workflow_id, version_id, trigger_id, parent_step_id,
                              input_data, variables, retry_policy, timeout_seconds)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(run_id)
        .bind(input.workflow_id)
        .bind(input.version_id)
        .bind(input.trigger_id)
        .bind(input.parent_step_id)
        .bind(&input.input_data)
        .bind(&input.variables)
        .bind(&input.retry_policy)
        .bind(input.timeout_seconds)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::database)?;

        // The start_run item commits with the run row or not at all
        sqlx::query(
            r#"
            INSERT INTO queue_items (id, run_id, queue_type, priority, payload)
            VALUES ($1, $2, 'start_run', $3, $4)
            "#,
        )
        .bind(item_id)
        .bind(run_id)
        .bind(QueueType::StartRun.default_priority())
        .bind(serde_json::json!({ "entry_node_id": input.entry_node_id }))
        .execute(&mut *tx)
        .await
        .map_err(StoreError::database)?;

        tx.commit().await.map_err(StoreError::database)?;

        debug!(%run_id, workflow_id = %input.workflow_id, "created run");
        Ok(row)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<RunRow>, StoreError> {
        sqlx::query_as::<_, RunRow>(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::database)
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunRow>, StoreError> {
        let limit = if filter.limit <= 0 { 50 } else { filter.limit };

        sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM runs
            WHERE ($1::uuid IS NULL OR workflow_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            OFFSET $3
            LIMIT $4
            "#
        ))
        .bind(filter.workflow_id)
        .bind(&filter.status)
        .bind(filter.offset.max(0))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    #[instrument(skip(self))]
    async fn mark_run_running(&self, id: Uuid, worker_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'running',
                assigned_worker_id = $2,
                worker_heartbeat_at = NOW(),
                started_at = COALESCE(started_at, NOW())
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat_run(&self, id: Uuid, worker_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE runs
            SET worker_heartbeat_at = NOW(), assigned_worker_id = $2
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;
        Ok(())
    }

    #[instrument(skip(self, output_data, error_data))]
    async fn finish_run(
        &self,
        id: Uuid,
        status: RunStatus,
        output_data: Option<serde_json::Value>,
        error_data: Option<serde_json::Value>,
    ) -> Result<bool, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "finish_run requires a terminal status, got {}",
                status
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = $2,
                completed_at = NOW(),
                output_data = COALESCE($3, output_data),
                error_data = COALESCE($4, error_data)
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(&output_data)
        .bind(&error_data)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;

        let finished = result.rows_affected() > 0;
        if finished {
            debug!(run_id = %id, %status, "finished run");
        }
        Ok(finished)
    }

    async fn cancel_run(&self, id: Uuid) -> Result<bool, StoreError> {
        self.finish_run(id, RunStatus::Cancelled, None, None).await
    }

    async fn allocate_step_numbers(&self, run_id: Uuid, count: i32) -> Result<i32, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE runs
            SET next_step_number = next_step_number + $2,
                total_steps = total_steps + $2
            WHERE id = $1
            RETURNING next_step_number - $2 AS first
            "#,
        )
        .bind(run_id)
        .bind(count)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)?
        .ok_or(StoreError::RunNotFound(run_id))?;

        Ok(row.get::<i32, _>("first"))
    }

    async fn list_overdue_runs(&self, now: DateTime<Utc>) -> Result<Vec<RunRow>, StoreError> {
        sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM runs
            WHERE status = 'running'
              AND timeout_seconds IS NOT NULL
              AND started_at IS NOT NULL
              AND started_at + make_interval(secs => timeout_seconds) < $1
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    // =========================================================================
    // Steps
    // =========================================================================

    #[instrument(skip(self, input), fields(run_id = %input.run_id, node_id = %input.node_id))]
    async fn create_step(&self, input: CreateStep) -> Result<Option<StepRow>, StoreError> {
        let step_id = Uuid::now_v7();

        let row = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            INSERT INTO steps (id, run_id, node_id, node_type, step_number, iteration_index,
                               max_attempts, input_envelope, depends_on)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (run_id, node_id, iteration_index) DO NOTHING
            RETURNING {STEP_COLUMNS}
            "#
        ))
        .bind(step_id)
        .bind(input.run_id)
        .bind(&input.node_id)
        .bind(&input.node_type)
        .bind(input.step_number)
        .bind(input.iteration_index)
        .bind(input.max_attempts)
        .bind(&input.input_envelope)
        .bind(&input.depends_on)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)?;

        if row.is_some() {
            debug!(%step_id, node_type = %input.node_type, "created step");
        }
        Ok(row)
    }

    async fn get_step(&self, id: Uuid) -> Result<Option<StepRow>, StoreError> {
        sqlx::query_as::<_, StepRow>(&format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::database)
    }

    async fn get_step_by_node(
        &self,
        run_id: Uuid,
        node_id: &str,
        iteration_index: i32,
    ) -> Result<Option<StepRow>, StoreError> {
        sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = $1 AND node_id = $2 AND iteration_index = $3"
        ))
        .bind(run_id)
        .bind(node_id)
        .bind(iteration_index)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRow>, StoreError> {
        sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = $1 ORDER BY step_number"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    #[instrument(skip(self))]
    async fn mark_step_running(
        &self,
        id: Uuid,
        worker_id: Uuid,
    ) -> Result<Option<StepRow>, StoreError> {
        sqlx::query_as::<_, StepRow>(&format!(
            r#"
            UPDATE steps
            SET status = 'running',
                attempt_count = attempt_count + 1,
                assigned_worker_id = $2,
                started_at = COALESCE(started_at, NOW()),
                next_retry_at = NULL
            WHERE id = $1 AND status = 'pending'
            RETURNING {STEP_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    #[instrument(skip(self, output_envelope))]
    async fn complete_step(
        &self,
        id: Uuid,
        output_envelope: serde_json::Value,
        chosen_handle: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::database)?;

        let row = sqlx::query(
            r#"
            UPDATE steps
            SET status = 'completed',
                output_envelope = $2,
                chosen_handle = $3,
                waiting_on_run = NULL,
                completed_at = NOW()
            WHERE id = $1 AND status = 'running'
            RETURNING run_id
            "#,
        )
        .bind(id)
        .bind(&output_envelope)
        .bind(chosen_handle)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::database)?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(false);
        };

        let run_id: Uuid = row.get("run_id");
        sqlx::query("UPDATE runs SET completed_steps = completed_steps + 1 WHERE id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::database)?;

        tx.commit().await.map_err(StoreError::database)?;

        debug!(step_id = %id, "completed step");
        Ok(true)
    }

    #[instrument(skip(self, error_details, output_envelope))]
    async fn fail_step(
        &self,
        id: Uuid,
        error_details: serde_json::Value,
        output_envelope: Option<serde_json::Value>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE steps
            SET status = 'failed',
                error_details = $2,
                output_envelope = COALESCE($3, output_envelope),
                waiting_on_run = NULL,
                completed_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(&error_details)
        .bind(&output_envelope)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn reassign_running_step(
        &self,
        id: Uuid,
        worker_id: Uuid,
    ) -> Result<Option<StepRow>, StoreError> {
        sqlx::query_as::<_, StepRow>(&format!(
            r#"
            UPDATE steps
            SET assigned_worker_id = $2
            WHERE id = $1 AND status = 'running' AND waiting_on_run IS NULL
            RETURNING {STEP_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    #[instrument(skip(self, error_details))]
    async fn schedule_step_retry(
        &self,
        id: Uuid,
        next_retry_at: DateTime<Utc>,
        error_details: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE steps
            SET status = 'pending',
                next_retry_at = $2,
                error_details = $3,
                assigned_worker_id = NULL
            WHERE id = $1 AND status = 'running' AND attempt_count < max_attempts
            "#,
        )
        .bind(id)
        .bind(next_retry_at)
        .bind(&error_details)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_step_waiting(&self, id: Uuid, child_run_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE steps SET waiting_on_run = $2 WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(child_run_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn skip_non_terminal_steps(&self, run_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE steps
            SET status = 'skipped', completed_at = NOW()
            WHERE run_id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(result.rows_affected())
    }

    async fn count_non_terminal_steps(&self, run_id: Uuid) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM steps WHERE run_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(row.get::<i64, _>("n"))
    }

    async fn append_step_dependency(&self, id: Uuid, dep: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE steps
            SET depends_on = array_append(depends_on, $2)
            WHERE id = $1 AND NOT ($2 = ANY(depends_on))
            "#,
        )
        .bind(id)
        .bind(dep)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;
        Ok(())
    }

    // =========================================================================
    // Queue
    // =========================================================================

    #[instrument(skip(self, item), fields(run_id = %item.run_id, queue_type = %item.queue_type))]
    async fn enqueue(&self, item: EnqueueItem) -> Result<QueueItemRow, StoreError> {
        let item_id = Uuid::now_v7();
        let priority = item
            .priority
            .unwrap_or_else(|| item.queue_type.default_priority());

        let row = sqlx::query_as::<_, QueueItemRow>(&format!(
            r#"
            INSERT INTO queue_items (id, run_id, step_id, queue_type, node_type, priority,
                                     available_at, max_attempts, payload)
            VALUES ($1, $2, $3, $4, $5, $6, COALESCE($7, NOW()), $8, $9)
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(item_id)
        .bind(item.run_id)
        .bind(item.step_id)
        .bind(item.queue_type.to_string())
        .bind(&item.node_type)
        .bind(priority)
        .bind(item.available_at)
        .bind(item.max_attempts)
        .bind(&item.payload)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::database)?;

        debug!(%item_id, "enqueued item");
        Ok(row)
    }

    #[instrument(skip(self, capabilities))]
    async fn claim_items(
        &self,
        worker_id: Uuid,
        capabilities: &[String],
        max_items: usize,
    ) -> Result<Vec<QueueItemRow>, StoreError> {
        if max_items == 0 {
            return Ok(vec![]);
        }

        // SKIP LOCKED keeps concurrent claimers from blocking on each other
        // and precludes double-claims
        let rows = sqlx::query_as::<_, QueueItemRow>(&format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM queue_items
                WHERE claimed_at IS NULL
                  AND available_at <= NOW()
                  AND (node_type IS NULL
                       OR cardinality($2::text[]) = 0
                       OR node_type = ANY($2))
                ORDER BY priority DESC, available_at, created_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_items q
            SET claimed_at = NOW(), claimed_by = $1
            FROM claimable c
            WHERE q.id = c.id
            RETURNING {}
            "#,
            ITEM_COLUMNS
                .split(", ")
                .map(|c| format!("q.{}", c))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(worker_id)
        .bind(capabilities)
        .bind(max_items as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database)?;

        if !rows.is_empty() {
            debug!(%worker_id, count = rows.len(), "claimed items");
        }
        Ok(rows)
    }

    async fn ack_item(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM queue_items WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn nack_item(
        &self,
        id: Uuid,
        reason: &str,
        backoff: Duration,
    ) -> Result<NackOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::database)?;

        let row = sqlx::query(
            r#"
            SELECT run_id, step_id, queue_type, attempt_count, max_attempts
            FROM queue_items
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::database)?
        .ok_or(StoreError::ItemNotFound(id))?;

        let run_id: Uuid = row.get("run_id");
        let step_id: Option<Uuid> = row.get("step_id");
        let queue_type: String = row.get("queue_type");
        let attempt: i32 = row.get("attempt_count");
        let max_attempts: i32 = row.get("max_attempts");
        let next_attempt = attempt + 1;

        if next_attempt < max_attempts {
            let available_at = Utc::now() + chrono_backoff(backoff);

            sqlx::query(
                r#"
                UPDATE queue_items
                SET attempt_count = $2,
                    claimed_at = NULL,
                    claimed_by = NULL,
                    available_at = $3,
                    last_error = $4
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(next_attempt)
            .bind(available_at)
            .bind(reason)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::database)?;

            tx.commit().await.map_err(StoreError::database)?;

            debug!(item_id = %id, next_attempt, "nacked item, will retry");
            return Ok(NackOutcome::Requeued {
                attempt: next_attempt as u32,
                available_at,
            });
        }

        // Delivery exhausted: fail the owning step/run and schedule run
        // finalization, all in this transaction
        let error = serde_json::json!({
            "reason": gantry_core::error::reason::DELIVERY_EXHAUSTED,
            "message": reason,
        });

        if let Some(step_id) = step_id {
            sqlx::query(
                r#"
                UPDATE steps
                SET status = 'failed', error_details = $2, completed_at = NOW()
                WHERE id = $1 AND status IN ('pending', 'running')
                "#,
            )
            .bind(step_id)
            .bind(&error)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::database)?;
        } else {
            sqlx::query(
                r#"
                UPDATE runs
                SET status = 'failed', error_data = $2, completed_at = NOW()
                WHERE id = $1 AND status IN ('pending', 'running')
                "#,
            )
            .bind(run_id)
            .bind(&error)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::database)?;
        }

        sqlx::query("DELETE FROM queue_items WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::database)?;

        if queue_type != QueueType::CompleteRun.to_string() {
            sqlx::query(
                r#"
                INSERT INTO queue_items (id, run_id, queue_type, priority, payload)
                VALUES ($1, $2, 'complete_run', $3, '{}')
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(run_id)
            .bind(QueueType::CompleteRun.default_priority())
            .execute(&mut *tx)
            .await
            .map_err(StoreError::database)?;
        }

        tx.commit().await.map_err(StoreError::database)?;

        debug!(item_id = %id, "nacked item, delivery exhausted");
        Ok(NackOutcome::Exhausted)
    }

    #[instrument(skip(self))]
    async fn reap_expired_leases(
        &self,
        heartbeat_deadline: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE queue_items q
            SET claimed_at = NULL, claimed_by = NULL
            WHERE claimed_at IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM workers w
                  WHERE w.id = q.claimed_by AND w.last_heartbeat >= $1
              )
            RETURNING q.id
            "#,
        )
        .bind(heartbeat_deadline)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database)?;

        let reaped: Vec<Uuid> = rows.iter().map(|r| r.get("id")).collect();
        if !reaped.is_empty() {
            debug!(count = reaped.len(), "reaped expired leases");
        }
        Ok(reaped)
    }

    async fn purge_run_items(&self, run_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM queue_items WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;

        Ok(result.rows_affected())
    }

    async fn count_outstanding_items(
        &self,
        run_id: Uuid,
        exclude: Option<Uuid>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n
            FROM queue_items
            WHERE run_id = $1 AND ($2::uuid IS NULL OR id <> $2)
            "#,
        )
        .bind(run_id)
        .bind(exclude)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(row.get::<i64, _>("n"))
    }

    // =========================================================================
    // Workers
    // =========================================================================

    #[instrument(skip(self, input), fields(worker_id = %input.id))]
    async fn register_worker(&self, input: RegisterWorker) -> Result<WorkerRow, StoreError> {
        sqlx::query_as::<_, WorkerRow>(&format!(
            r#"
            INSERT INTO workers (id, hostname, capabilities, max_concurrent_steps)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                hostname = EXCLUDED.hostname,
                capabilities = EXCLUDED.capabilities,
                max_concurrent_steps = EXCLUDED.max_concurrent_steps,
                status = 'idle',
                last_heartbeat = NOW()
            RETURNING {WORKER_COLUMNS}
            "#
        ))
        .bind(input.id)
        .bind(&input.hostname)
        .bind(&input.capabilities)
        .bind(input.max_concurrent_steps)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn worker_heartbeat(
        &self,
        id: Uuid,
        current_step_count: i32,
        status: WorkerStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET last_heartbeat = NOW(), current_step_count = $2, status = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(current_step_count)
        .bind(status.to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_worker(&self, id: Uuid) -> Result<Option<WorkerRow>, StoreError> {
        sqlx::query_as::<_, WorkerRow>(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRow>, StoreError> {
        sqlx::query_as::<_, WorkerRow>(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers ORDER BY started_at"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    #[instrument(skip(self))]
    async fn deregister_worker(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE workers SET status = 'dead' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_dead_workers(
        &self,
        heartbeat_deadline: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE workers
            SET status = 'dead'
            WHERE last_heartbeat < $1 AND status <> 'dead'
            RETURNING id
            "#,
        )
        .bind(heartbeat_deadline)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    // =========================================================================
    // Variables
    // =========================================================================

    async fn get_variable(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let row = sqlx::query(
            "SELECT value FROM variables WHERE scope = $1 AND scope_key = $2 AND name = $3",
        )
        .bind(scope.to_string())
        .bind(scope_key)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(row.map(|r| r.get("value")))
    }

    async fn set_variable(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO variables (scope, scope_key, name, value, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (scope, scope_key, name) DO UPDATE SET
                value = EXCLUDED.value,
                updated_at = NOW()
            "#,
        )
        .bind(scope.to_string())
        .bind(scope_key)
        .bind(name)
        .bind(&value)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;
        Ok(())
    }

    async fn delete_variable(
        &self,
        scope: VariableScope,
        scope_key: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM variables WHERE scope = $1 AND scope_key = $2 AND name = $3")
            .bind(scope.to_string())
            .bind(scope_key)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;
        Ok(())
    }

    async fn list_variables(
        &self,
        scope: VariableScope,
        scope_key: &str,
    ) -> Result<BTreeMap<String, serde_json::Value>, StoreError> {
        let rows = sqlx::query(
            "SELECT name, value FROM variables WHERE scope = $1 AND scope_key = $2 ORDER BY name",
        )
        .bind(scope.to_string())
        .bind(scope_key)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("name"), r.get("value")))
            .collect())
    }

    async fn clear_scope_variables(
        &self,
        scope: VariableScope,
        scope_key: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM variables WHERE scope = $1 AND scope_key = $2")
            .bind(scope.to_string())
            .bind(scope_key)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Webhook events
    // =========================================================================

    async fn record_webhook_event(
        &self,
        input: CreateWebhookEvent,
    ) -> Result<WebhookEventRow, StoreError> {
        sqlx::query_as::<_, WebhookEventRow>(
            r#"
            INSERT INTO webhook_events (id, trigger_id, payload, headers, source_ip)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, trigger_id, payload, headers, source_ip, response_status, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.trigger_id)
        .bind(&input.payload)
        .bind(&input.headers)
        .bind(&input.source_ip)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn set_webhook_event_status(&self, id: Uuid, status: i32) -> Result<(), StoreError> {
        sqlx::query("UPDATE webhook_events SET response_status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;
        Ok(())
    }

    // =========================================================================
    // Connections
    // =========================================================================

    async fn create_connection(
        &self,
        input: CreateConnection,
    ) -> Result<ConnectionRow, StoreError> {
        sqlx::query_as::<_, ConnectionRow>(
            r#"
            INSERT INTO connections (id, owner_id, name, provider, config)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, owner_id, name, provider, config, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.owner_id)
        .bind(&input.name)
        .bind(&input.provider)
        .bind(&input.config)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn get_connection(&self, id: Uuid) -> Result<Option<ConnectionRow>, StoreError> {
        sqlx::query_as::<_, ConnectionRow>(
            "SELECT id, owner_id, name, provider, config, created_at FROM connections WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn list_connections(
        &self,
        owner_id: Option<Uuid>,
    ) -> Result<Vec<ConnectionRow>, StoreError> {
        sqlx::query_as::<_, ConnectionRow>(
            r#"
            SELECT id, owner_id, name, provider, config, created_at
            FROM connections
            WHERE ($1::uuid IS NULL OR owner_id = $1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database)
    }

    async fn delete_connection(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM connections WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Leader election
    // =========================================================================

    async fn try_acquire_leadership(&self, key: i64, _holder: Uuid) -> Result<bool, StoreError> {
        let mut leader = self.leader.lock().await;

        if leader.held {
            return Ok(true);
        }

        if leader.conn.is_none() {
            leader.conn = Some(self.pool.acquire().await.map_err(StoreError::database)?);
        }

        let conn = leader.conn.as_mut().unwrap();
        let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS acquired")
            .bind(key)
            .fetch_one(conn.as_mut())
            .await
            .map_err(|e| {
                error!("advisory lock query failed: {}", e);
                StoreError::database(e)
            })?;

        leader.held = row.get::<bool, _>("acquired");
        if leader.held {
            debug!(key, "acquired leadership");
        } else {
            // Let the connection go back to the pool while we are not leader
            leader.conn = None;
        }

        Ok(leader.held)
    }

    async fn release_leadership(&self, key: i64, _holder: Uuid) -> Result<(), StoreError> {
        let mut leader = self.leader.lock().await;

        let held = leader.held;
        if let Some(conn) = leader.conn.as_mut() {
            if held {
                sqlx::query("SELECT pg_advisory_unlock($1)")
                    .bind(key)
                    .execute(conn.as_mut())
                    .await
                    .map_err(StoreError::database)?;
                debug!(key, "released leadership");
            }
        }

        leader.held = false;
        leader.conn = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // Integration tests require a PostgreSQL database; see
    // tests/postgres_integration_test.rs
}

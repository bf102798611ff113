//! PostgreSQL implementation of ExecutionStore
//!
//! Production persistence using PostgreSQL with:
//! - Queue leasing via `FOR UPDATE SKIP LOCKED`
//! - Row-locked read-modify-write for status compare-and-set
//! - Versioned circuit breaker rows

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::{ExecutionStore, StoreError};
use crate::clock::to_chrono;
use crate::model::{
    CircuitRecord, ExecutionLog, ExecutionStatus, ExecutionUpdate, NewQueueItem, NodeExecution,
    NodeInput, NodeLog, NodeOutput, NodeStatus, NodeUpdate, QueueFailOutcome, QueueItem,
    WorkflowDefinition, WorkflowExecution, WorkflowPause,
};

const EXECUTION_COLUMNS: &str = "id, workflow_id, user_id, status, input, output, error, metadata, \
     locked_by, logs, created_at, started_at, finished_at, cancelled_at, updated_at";

const NODE_COLUMNS: &str = "execution_id, node_id, status, output, error, retry_count, \
     deferral_count, not_before, input_override, started_at, completed_at, updated_at";

const QUEUE_COLUMNS: &str = "id, seq, workflow_id, execution_id, user_id, priority, status, \
     payload, retry_count, max_retries, locked_by, locked_until, scheduled_for, last_error, \
     created_at";

const PAUSE_COLUMNS: &str =
    "id, workflow_id, execution_id, node_id, reason, resume_data, created_at, resolved_at";

/// PostgreSQL implementation of ExecutionStore
///
/// # Example
///
/// ```ignore
/// use blockflow_engine::persistence::PostgresExecutionStore;
///
/// let store = PostgresExecutionStore::connect("postgres://localhost/blockflow", 10).await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                StoreError::Database(e.to_string())
            })?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool.begin().await.map_err(database)
    }
}

fn database(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn parse<T>(raw: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse().map_err(StoreError::Serialization)
}

fn statuses<T: ToString>(from: &[T]) -> Vec<String> {
    from.iter().map(ToString::to_string).collect()
}

fn execution_from_row(row: &PgRow) -> Result<WorkflowExecution, StoreError> {
    let logs: serde_json::Value = row.get("logs");
    Ok(WorkflowExecution {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        user_id: row.get("user_id"),
        status: parse(row.get::<&str, _>("status"))?,
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        metadata: row.get("metadata"),
        locked_by: row.get("locked_by"),
        logs: serde_json::from_value(logs).map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        cancelled_at: row.get("cancelled_at"),
        updated_at: row.get("updated_at"),
    })
}

fn node_from_row(row: &PgRow) -> Result<NodeExecution, StoreError> {
    Ok(NodeExecution {
        execution_id: row.get("execution_id"),
        node_id: row.get("node_id"),
        status: parse(row.get::<&str, _>("status"))?,
        output: row.get("output"),
        error: row.get("error"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        deferral_count: row.get::<i32, _>("deferral_count") as u32,
        not_before: row.get("not_before"),
        input_override: row.get("input_override"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        updated_at: row.get("updated_at"),
    })
}

fn queue_item_from_row(row: &PgRow) -> Result<QueueItem, StoreError> {
    Ok(QueueItem {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        execution_id: row.get("execution_id"),
        user_id: row.get("user_id"),
        priority: row.get("priority"),
        status: parse(row.get::<&str, _>("status"))?,
        payload: row.get("payload"),
        retry_count: row.get::<i32, _>("retry_count") as u32,
        max_retries: row.get::<i32, _>("max_retries") as u32,
        locked_by: row.get("locked_by"),
        locked_until: row.get("locked_until"),
        scheduled_for: row.get("scheduled_for"),
        last_error: row.get("last_error"),
        seq: row.get("seq"),
        created_at: row.get("created_at"),
    })
}

fn pause_from_row(row: &PgRow) -> WorkflowPause {
    WorkflowPause {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        execution_id: row.get("execution_id"),
        node_id: row.get("node_id"),
        reason: row.get("reason"),
        resume_data: row.get("resume_data"),
        created_at: row.get("created_at"),
        resolved_at: row.get("resolved_at"),
    }
}

fn circuit_from_row(row: &PgRow) -> Result<CircuitRecord, StoreError> {
    Ok(CircuitRecord {
        circuit_id: row.get("circuit_id"),
        state: parse(row.get::<&str, _>("state"))?,
        failure_count: row.get::<i32, _>("failure_count") as u32,
        success_count: row.get::<i32, _>("success_count") as u32,
        last_failure_at: row.get("last_failure_at"),
        last_success_at: row.get("last_success_at"),
        half_open_at: row.get("half_open_at"),
        version: row.get("version"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError> {
        let definition = serde_json::to_value(workflow)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO blockflow_workflows (id, name, definition, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                definition = EXCLUDED.definition,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(&definition)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save workflow: {}", e);
            database(e)
        })?;

        debug!("saved workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        let row = sqlx::query("SELECT definition FROM blockflow_workflows WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let definition: serde_json::Value = row.get("definition");
        serde_json::from_value(definition).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let logs = serde_json::to_value(&execution.logs)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO blockflow_executions (
                id, workflow_id, user_id, status, input, output, error, metadata,
                locked_by, logs, created_at, started_at, finished_at, cancelled_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(execution.id)
        .bind(execution.workflow_id)
        .bind(execution.user_id)
        .bind(execution.status.as_str())
        .bind(&execution.input)
        .bind(&execution.output)
        .bind(&execution.error)
        .bind(&execution.metadata)
        .bind(&execution.locked_by)
        .bind(&logs)
        .bind(execution.created_at)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.cancelled_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create execution: {}", e);
            database(e)
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(format!("execution {}", execution.id)));
        }

        debug!("created execution");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM blockflow_executions WHERE id = $1"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?
        .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        execution_from_row(&row)
    }

    #[instrument(skip(self, update))]
    async fn transition_execution(
        &self,
        execution_id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        update: ExecutionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM blockflow_executions WHERE id = $1 FOR UPDATE"
        ))
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(database)?
        .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        let mut execution = execution_from_row(&row)?;
        if !from.contains(&execution.status) {
            return Ok(None);
        }

        update.apply(&mut execution, to, now);
        let logs = serde_json::to_value(&execution.logs)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE blockflow_executions
            SET status = $2,
                output = $3,
                error = $4,
                logs = $5,
                started_at = $6,
                finished_at = $7,
                cancelled_at = $8,
                updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .bind(execution.status.as_str())
        .bind(&execution.output)
        .bind(&execution.error)
        .bind(&logs)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.cancelled_at)
        .bind(execution.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(database)?;

        tx.commit().await.map_err(database)?;

        debug!(%execution_id, status = %to, "execution transitioned");
        Ok(Some(execution))
    }

    #[instrument(skip(self, log))]
    async fn append_execution_log(
        &self,
        execution_id: Uuid,
        log: ExecutionLog,
    ) -> Result<(), StoreError> {
        let entry = serde_json::to_value(vec![log])
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE blockflow_executions
            SET logs = logs || $2::jsonb
            WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .bind(&entry)
        .execute(&self.pool)
        .await
        .map_err(database)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(execution_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_execution_lock(
        &self,
        execution_id: Uuid,
        worker_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE blockflow_executions SET locked_by = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(execution_id)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(database)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(execution_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_or_create_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<NodeExecution, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO blockflow_node_executions (execution_id, node_id, status, updated_at)
            VALUES ($1, $2, 'pending', $3)
            ON CONFLICT (execution_id, node_id) DO NOTHING
            "#,
        )
        .bind(execution_id)
        .bind(node_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(database)?;

        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM blockflow_node_executions \
             WHERE execution_id = $1 AND node_id = $2"
        ))
        .bind(execution_id)
        .bind(node_id)
        .fetch_one(&self.pool)
        .await
        .map_err(database)?;

        node_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeExecution>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM blockflow_node_executions \
             WHERE execution_id = $1 AND node_id = $2"
        ))
        .bind(execution_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?;

        row.as_ref().map(node_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn list_nodes(&self, execution_id: Uuid) -> Result<Vec<NodeExecution>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM blockflow_node_executions \
             WHERE execution_id = $1 ORDER BY node_id"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;

        rows.iter().map(node_from_row).collect()
    }

    #[instrument(skip(self, update))]
    async fn transition_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
        from: &[NodeStatus],
        update: NodeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<NodeExecution>, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM blockflow_node_executions \
             WHERE execution_id = $1 AND node_id = $2 AND status = ANY($3) FOR UPDATE"
        ))
        .bind(execution_id)
        .bind(node_id)
        .bind(statuses(from))
        .fetch_optional(&mut *tx)
        .await
        .map_err(database)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut node = node_from_row(&row)?;
        update.apply(&mut node, now);

        sqlx::query(
            r#"
            UPDATE blockflow_node_executions
            SET status = $3,
                output = $4,
                error = $5,
                retry_count = $6,
                deferral_count = $7,
                not_before = $8,
                input_override = $9,
                started_at = $10,
                completed_at = $11,
                updated_at = $12
            WHERE execution_id = $1 AND node_id = $2
            "#,
        )
        .bind(execution_id)
        .bind(node_id)
        .bind(node.status.as_str())
        .bind(&node.output)
        .bind(&node.error)
        .bind(node.retry_count as i32)
        .bind(node.deferral_count as i32)
        .bind(node.not_before)
        .bind(&node.input_override)
        .bind(node.started_at)
        .bind(node.completed_at)
        .bind(node.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(database)?;

        tx.commit().await.map_err(database)?;

        debug!(%execution_id, node_id, status = %node.status, "node transitioned");
        Ok(Some(node))
    }

    #[instrument(skip(self, input), fields(execution_id = %input.execution_id, node_id = %input.node_id))]
    async fn record_node_input(&self, input: NodeInput) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO blockflow_node_inputs (execution_id, node_id, data, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(input.execution_id)
        .bind(&input.node_id)
        .bind(&input.data)
        .bind(input.created_at)
        .execute(&self.pool)
        .await
        .map_err(database)?;
        Ok(())
    }

    #[instrument(skip(self, output), fields(execution_id = %output.execution_id, node_id = %output.node_id))]
    async fn record_node_output(&self, output: NodeOutput) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO blockflow_node_outputs (execution_id, node_id, data, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(output.execution_id)
        .bind(&output.node_id)
        .bind(&output.data)
        .bind(output.created_at)
        .execute(&self.pool)
        .await
        .map_err(database)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn latest_node_input(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeInput>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT data, created_at FROM blockflow_node_inputs
            WHERE execution_id = $1 AND node_id = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(execution_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?;

        Ok(row.map(|row| NodeInput {
            execution_id,
            node_id: node_id.to_string(),
            data: row.get("data"),
            created_at: row.get("created_at"),
        }))
    }

    #[instrument(skip(self))]
    async fn latest_node_output(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeOutput>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT data, created_at FROM blockflow_node_outputs
            WHERE execution_id = $1 AND node_id = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(execution_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?;

        Ok(row.map(|row| NodeOutput {
            execution_id,
            node_id: node_id.to_string(),
            data: row.get("data"),
            created_at: row.get("created_at"),
        }))
    }

    #[instrument(skip(self, logs), fields(count = logs.len()))]
    async fn append_node_logs(&self, logs: Vec<NodeLog>) -> Result<(), StoreError> {
        if logs.is_empty() {
            return Ok(());
        }

        let mut tx = self.begin().await?;
        for log in &logs {
            sqlx::query(
                r#"
                INSERT INTO blockflow_node_logs (execution_id, node_id, level, message, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(log.execution_id)
            .bind(&log.node_id)
            .bind(log.level.as_str())
            .bind(&log.message)
            .bind(log.created_at)
            .execute(&mut *tx)
            .await
            .map_err(database)?;
        }
        tx.commit().await.map_err(database)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_node_logs(
        &self,
        execution_id: Uuid,
        node_id: Option<&str>,
    ) -> Result<Vec<NodeLog>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, node_id, level, message, created_at
            FROM blockflow_node_logs
            WHERE execution_id = $1 AND ($2::text IS NULL OR node_id = $2)
            ORDER BY id
            "#,
        )
        .bind(execution_id)
        .bind(node_id)
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;

        rows.iter()
            .map(|row| {
                Ok(NodeLog {
                    execution_id: row.get("execution_id"),
                    node_id: row.get("node_id"),
                    level: parse(row.get::<&str, _>("level"))?,
                    message: row.get("message"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    #[instrument(skip(self, pause), fields(pause_id = %pause.id))]
    async fn create_pause(&self, pause: &WorkflowPause) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO blockflow_pauses (
                id, workflow_id, execution_id, node_id, reason, resume_data, created_at, resolved_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(pause.id)
        .bind(pause.workflow_id)
        .bind(pause.execution_id)
        .bind(&pause.node_id)
        .bind(&pause.reason)
        .bind(&pause.resume_data)
        .bind(pause.created_at)
        .bind(pause.resolved_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create pause: {}", e);
            database(e)
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_pauses(&self, execution_id: Uuid) -> Result<Vec<WorkflowPause>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PAUSE_COLUMNS} FROM blockflow_pauses \
             WHERE execution_id = $1 ORDER BY created_at, id"
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;

        Ok(rows.iter().map(pause_from_row).collect())
    }

    #[instrument(skip(self, resume_data))]
    async fn resolve_pause(
        &self,
        pause_id: Uuid,
        resume_data: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE blockflow_pauses
            SET resolved_at = $2, resume_data = $3
            WHERE id = $1 AND resolved_at IS NULL
            "#,
        )
        .bind(pause_id)
        .bind(now)
        .bind(&resume_data)
        .execute(&self.pool)
        .await
        .map_err(database)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM blockflow_pauses WHERE id = $1")
            .bind(pause_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(database)?;

        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::PauseNotFound(pause_id)),
        }
    }

    #[instrument(skip(self, item), fields(execution_id = %item.execution_id))]
    async fn enqueue(
        &self,
        item: NewQueueItem,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO blockflow_queue (
                id, workflow_id, execution_id, user_id, priority, status, payload,
                max_retries, scheduled_for, created_at
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8, $9)
            RETURNING {QUEUE_COLUMNS}
            "#
        ))
        .bind(Uuid::now_v7())
        .bind(item.workflow_id)
        .bind(item.execution_id)
        .bind(item.user_id)
        .bind(item.priority)
        .bind(&item.payload)
        .bind(item.max_retries as i32)
        .bind(item.scheduled_for)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue: {}", e);
            database(e)
        })?;

        let queued = queue_item_from_row(&row)?;
        debug!(item_id = %queued.id, priority = queued.priority, "enqueued");
        Ok(queued)
    }

    #[instrument(skip(self))]
    async fn lease_next(
        &self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError> {
        let locked_until = now + to_chrono(lease);

        // One statement: pick the best visible row, skipping rows another
        // worker is leasing right now, and stamp the lease on it.
        let row = sqlx::query(&format!(
            r#"
            WITH candidate AS (
                SELECT id
                FROM blockflow_queue
                WHERE (status = 'pending' AND scheduled_for <= $2)
                   OR (status = 'leased' AND locked_until < $2)
                ORDER BY priority DESC, scheduled_for, seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE blockflow_queue q
            SET status = 'leased',
                locked_by = $1,
                locked_until = $3
            FROM candidate c
            WHERE q.id = c.id
            RETURNING {}
            "#,
            QUEUE_COLUMNS
                .split(", ")
                .map(|c| format!("q.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(worker_id)
        .bind(now)
        .bind(locked_until)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to lease queue item: {}", e);
            database(e)
        })?;

        let leased = row.as_ref().map(queue_item_from_row).transpose()?;
        if let Some(item) = &leased {
            debug!(worker_id, item_id = %item.id, "leased queue item");
        }
        Ok(leased)
    }

    #[instrument(skip(self))]
    async fn get_queue_item(&self, item_id: Uuid) -> Result<QueueItem, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM blockflow_queue WHERE id = $1"
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?
        .ok_or(StoreError::QueueItemNotFound(item_id))?;

        queue_item_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn complete_queue_item(
        &self,
        item_id: Uuid,
        worker_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE blockflow_queue
            SET status = 'done', locked_by = NULL, locked_until = NULL
            WHERE id = $1 AND status = 'leased' AND locked_by = $2
            "#,
        )
        .bind(item_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(database)?;

        if result.rows_affected() == 0 {
            // Missing item or lost lease
            self.get_queue_item(item_id).await?;
            debug!(%item_id, worker_id, "queue item no longer leased to worker");
            return Ok(false);
        }

        debug!(%item_id, "queue item done");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn fail_queue_item(
        &self,
        item_id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<QueueFailOutcome>, StoreError> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(
            "SELECT status, locked_by, retry_count, max_retries \
             FROM blockflow_queue WHERE id = $1 FOR UPDATE",
        )
        .bind(item_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(database)?
        .ok_or(StoreError::QueueItemNotFound(item_id))?;

        let status: String = row.get("status");
        let locked_by: Option<String> = row.get("locked_by");
        if status != "leased" || locked_by.as_deref() != Some(worker_id) {
            tx.rollback().await.map_err(database)?;
            debug!(%item_id, worker_id, "queue item no longer leased to worker");
            return Ok(None);
        }

        let retry_count = row.get::<i32, _>("retry_count") as u32 + 1;
        let max_retries = row.get::<i32, _>("max_retries") as u32;

        let outcome = if retry_count >= max_retries {
            sqlx::query(
                r#"
                UPDATE blockflow_queue
                SET status = 'failed',
                    retry_count = $2,
                    last_error = $3,
                    locked_by = NULL,
                    locked_until = NULL
                WHERE id = $1
                "#,
            )
            .bind(item_id)
            .bind(retry_count as i32)
            .bind(error)
            .execute(&mut *tx)
            .await
            .map_err(database)?;

            QueueFailOutcome::DeadLettered { retry_count }
        } else {
            sqlx::query(
                r#"
                UPDATE blockflow_queue
                SET status = 'pending',
                    retry_count = $2,
                    last_error = $3,
                    scheduled_for = $4,
                    locked_by = NULL,
                    locked_until = NULL
                WHERE id = $1
                "#,
            )
            .bind(item_id)
            .bind(retry_count as i32)
            .bind(error)
            .bind(retry_at)
            .execute(&mut *tx)
            .await
            .map_err(database)?;

            QueueFailOutcome::Rescheduled {
                retry_count,
                scheduled_for: retry_at,
            }
        };

        tx.commit().await.map_err(database)?;

        debug!(%item_id, ?outcome, "queue item failed");
        Ok(Some(outcome))
    }

    #[instrument(skip(self))]
    async fn list_dead_letters(&self, limit: u32) -> Result<Vec<QueueItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM blockflow_queue \
             WHERE status = 'failed' ORDER BY seq LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(database)?;

        rows.iter().map(queue_item_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn requeue_dead_letter(
        &self,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE blockflow_queue
            SET status = 'pending', retry_count = 0, scheduled_for = $2
            WHERE id = $1 AND status = 'failed'
            RETURNING {QUEUE_COLUMNS}
            "#
        ))
        .bind(item_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?;

        match row {
            Some(row) => queue_item_from_row(&row).map(Some),
            None => {
                // Distinguish "not dead" from "does not exist"
                self.get_queue_item(item_id).await?;
                Ok(None)
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_circuit(&self, circuit_id: &str) -> Result<Option<CircuitRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT circuit_id, state, failure_count, success_count, last_failure_at,
                   last_success_at, half_open_at, version, updated_at
            FROM blockflow_circuits
            WHERE circuit_id = $1
            "#,
        )
        .bind(circuit_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(database)?;

        row.as_ref().map(circuit_from_row).transpose()
    }

    #[instrument(skip(self, record), fields(circuit_id = %record.circuit_id, state = %record.state))]
    async fn save_circuit(
        &self,
        record: &CircuitRecord,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let query = if expected_version == 0 {
            r#"
            INSERT INTO blockflow_circuits (
                circuit_id, state, failure_count, success_count, last_failure_at,
                last_success_at, half_open_at, version, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (circuit_id) DO NOTHING
            "#
        } else {
            r#"
            UPDATE blockflow_circuits
            SET state = $2,
                failure_count = $3,
                success_count = $4,
                last_failure_at = $5,
                last_success_at = $6,
                half_open_at = $7,
                version = $8,
                updated_at = $9
            WHERE circuit_id = $1 AND version = $10
            "#
        };

        let mut statement = sqlx::query(query)
            .bind(&record.circuit_id)
            .bind(record.state.as_str())
            .bind(record.failure_count as i32)
            .bind(record.success_count as i32)
            .bind(record.last_failure_at)
            .bind(record.last_success_at)
            .bind(record.half_open_at)
            .bind(record.version)
            .bind(record.updated_at);
        if expected_version != 0 {
            statement = statement.bind(expected_version);
        }

        let result = statement.execute(&self.pool).await.map_err(database)?;
        Ok(result.rows_affected() == 1)
    }
}

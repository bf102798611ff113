//! ExecutionStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::{
    CircuitRecord, ExecutionLog, ExecutionStatus, ExecutionUpdate, NewQueueItem, NodeExecution,
    NodeInput, NodeLog, NodeOutput, NodeStatus, NodeUpdate, QueueFailOutcome, QueueItem,
    WorkflowDefinition, WorkflowExecution, WorkflowPause,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow definition not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Queue item not found
    #[error("queue item not found: {0}")]
    QueueItemNotFound(Uuid),

    /// Pause record not found
    #[error("pause not found: {0}")]
    PauseNotFound(Uuid),

    /// A record with the same identity already exists
    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable store for executions, nodes, pauses, the queue and circuit state
///
/// Every state change the engine relies on for correctness across workers is
/// a compare-and-set: status transitions name the statuses they expect to
/// find, and circuit records carry a version. A lost race shows up as
/// `Ok(None)` / `Ok(false)`, never as an error.
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Definitions
    // =========================================================================

    /// Insert or replace a workflow definition
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError>;

    /// Load a workflow definition
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, StoreError>;

    // =========================================================================
    // Executions
    // =========================================================================

    /// Insert a new execution
    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;

    /// Load an execution
    async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, StoreError>;

    /// Move an execution to `to` if its current status is one of `from`
    ///
    /// Sets `started_at` on the first entry into `running` and `finished_at`
    /// on entry into a terminal status. Returns the updated record, or
    /// `None` when the current status did not match.
    async fn transition_execution(
        &self,
        execution_id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        update: ExecutionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Append an entry to the execution's embedded log
    async fn append_execution_log(
        &self,
        execution_id: Uuid,
        log: ExecutionLog,
    ) -> Result<(), StoreError>;

    /// Record which worker drives the execution (`None` releases it)
    async fn set_execution_lock(
        &self,
        execution_id: Uuid,
        worker_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Node Executions
    // =========================================================================

    /// Return the node record, creating a `pending` one if absent
    ///
    /// Concurrent callers for the same `(execution_id, node_id)` observe the
    /// same record.
    async fn get_or_create_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<NodeExecution, StoreError>;

    async fn get_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeExecution>, StoreError>;

    async fn list_nodes(&self, execution_id: Uuid) -> Result<Vec<NodeExecution>, StoreError>;

    /// Apply `update` if the node's current status is one of `from`
    async fn transition_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
        from: &[NodeStatus],
        update: NodeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<NodeExecution>, StoreError>;

    // =========================================================================
    // Node Snapshots
    // =========================================================================

    async fn record_node_input(&self, input: NodeInput) -> Result<(), StoreError>;

    async fn record_node_output(&self, output: NodeOutput) -> Result<(), StoreError>;

    /// Most recent input snapshot of a node
    async fn latest_node_input(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeInput>, StoreError>;

    /// Most recent output snapshot of a node
    async fn latest_node_output(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeOutput>, StoreError>;

    async fn append_node_logs(&self, logs: Vec<NodeLog>) -> Result<(), StoreError>;

    /// Node logs in insertion order, optionally for a single node
    async fn list_node_logs(
        &self,
        execution_id: Uuid,
        node_id: Option<&str>,
    ) -> Result<Vec<NodeLog>, StoreError>;

    // =========================================================================
    // Pauses
    // =========================================================================

    async fn create_pause(&self, pause: &WorkflowPause) -> Result<(), StoreError>;

    /// All pause records of an execution, oldest first
    async fn list_pauses(&self, execution_id: Uuid) -> Result<Vec<WorkflowPause>, StoreError>;

    /// Mark a pause resolved; returns `false` if it was already resolved
    async fn resolve_pause(
        &self,
        pause_id: Uuid,
        resume_data: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Execution Queue
    // =========================================================================

    async fn enqueue(&self, item: NewQueueItem, now: DateTime<Utc>)
        -> Result<QueueItem, StoreError>;

    /// Atomically lease the best visible item
    ///
    /// Visible means `pending` with `scheduled_for <= now`, or `leased` with
    /// `locked_until < now`. Order: priority descending, `scheduled_for`
    /// ascending, then insertion order.
    async fn lease_next(
        &self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError>;

    async fn get_queue_item(&self, item_id: Uuid) -> Result<QueueItem, StoreError>;

    /// Mark an item `done` if `worker_id` still holds its lease
    ///
    /// Returns `false` when the item is no longer leased to `worker_id`.
    async fn complete_queue_item(&self, item_id: Uuid, worker_id: &str)
        -> Result<bool, StoreError>;

    /// Count a delivery failure if `worker_id` still holds the lease
    ///
    /// Increments `retry_count`; at `max_retries` the item is dead-lettered,
    /// otherwise it returns to `pending` at `retry_at`. Returns `None` when
    /// the item is no longer leased to `worker_id`.
    async fn fail_queue_item(
        &self,
        item_id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<QueueFailOutcome>, StoreError>;

    /// Dead-lettered items, oldest first
    async fn list_dead_letters(&self, limit: u32) -> Result<Vec<QueueItem>, StoreError>;

    /// Return a dead-lettered item to `pending` with a fresh retry budget
    ///
    /// Returns `None` if the item is not dead-lettered.
    async fn requeue_dead_letter(
        &self,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError>;

    // =========================================================================
    // Circuit Breakers
    // =========================================================================

    async fn get_circuit(&self, circuit_id: &str) -> Result<Option<CircuitRecord>, StoreError>;

    /// Write `record` if the stored version equals `expected_version`
    ///
    /// `expected_version == 0` inserts a circuit that has never been written.
    /// `record.version` must already hold the new version.
    async fn save_circuit(
        &self,
        record: &CircuitRecord,
        expected_version: i64,
    ) -> Result<bool, StoreError>;
}

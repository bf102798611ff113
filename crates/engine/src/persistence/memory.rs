//! In-memory implementation of ExecutionStore

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::{ExecutionStore, StoreError};
use crate::clock::to_chrono;
use crate::model::{
    CircuitRecord, ExecutionLog, ExecutionStatus, ExecutionUpdate, NewQueueItem, NodeExecution,
    NodeInput, NodeLog, NodeOutput, NodeStatus, NodeUpdate, QueueFailOutcome, QueueItem,
    QueueStatus, WorkflowDefinition, WorkflowExecution, WorkflowPause,
};

type NodeKey = (Uuid, String);

/// In-memory implementation of ExecutionStore
///
/// Used by tests and single-process runs. Each map sits behind its own lock,
/// and every compare-and-set happens under the write lock of the map it
/// touches, which gives the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use blockflow_engine::persistence::InMemoryExecutionStore;
///
/// let store = InMemoryExecutionStore::new();
/// assert_eq!(store.queue_len(), 0);
/// ```
pub struct InMemoryExecutionStore {
    workflows: RwLock<HashMap<Uuid, WorkflowDefinition>>,
    executions: RwLock<HashMap<Uuid, WorkflowExecution>>,
    nodes: RwLock<HashMap<NodeKey, NodeExecution>>,
    inputs: RwLock<HashMap<NodeKey, Vec<NodeInput>>>,
    outputs: RwLock<HashMap<NodeKey, Vec<NodeOutput>>>,
    logs: RwLock<Vec<NodeLog>>,
    pauses: RwLock<Vec<WorkflowPause>>,
    queue: RwLock<HashMap<Uuid, QueueItem>>,
    circuits: RwLock<HashMap<String, CircuitRecord>>,
    queue_seq: AtomicI64,
}

impl InMemoryExecutionStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            inputs: RwLock::new(HashMap::new()),
            outputs: RwLock::new(HashMap::new()),
            logs: RwLock::new(Vec::new()),
            pauses: RwLock::new(Vec::new()),
            queue: RwLock::new(HashMap::new()),
            circuits: RwLock::new(HashMap::new()),
            queue_seq: AtomicI64::new(0),
        }
    }

    /// Number of queue items in any status
    pub fn queue_len(&self) -> usize {
        self.queue.read().len()
    }

    /// Queue items belonging to one execution, in insertion order
    pub fn queue_items_for(&self, execution_id: Uuid) -> Vec<QueueItem> {
        let mut items: Vec<QueueItem> = self
            .queue
            .read()
            .values()
            .filter(|item| item.execution_id == execution_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.seq);
        items
    }

    /// Number of node records across all executions
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn node_key(execution_id: Uuid, node_id: &str) -> NodeKey {
    (execution_id, node_id.to_string())
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError> {
        self.workflows.write().insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        self.workflows
            .read()
            .get(&workflow_id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        if executions.contains_key(&execution.id) {
            return Err(StoreError::Duplicate(format!("execution {}", execution.id)));
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, StoreError> {
        self.executions
            .read()
            .get(&execution_id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(execution_id))
    }

    async fn transition_execution(
        &self,
        execution_id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        update: ExecutionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;

        if !from.contains(&execution.status) {
            return Ok(None);
        }

        update.apply(execution, to, now);
        Ok(Some(execution.clone()))
    }

    async fn append_execution_log(
        &self,
        execution_id: Uuid,
        log: ExecutionLog,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        execution.logs.push(log);
        Ok(())
    }

    async fn set_execution_lock(
        &self,
        execution_id: Uuid,
        worker_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&execution_id)
            .ok_or(StoreError::ExecutionNotFound(execution_id))?;
        execution.locked_by = worker_id.map(str::to_string);
        execution.updated_at = now;
        Ok(())
    }

    async fn get_or_create_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<NodeExecution, StoreError> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .entry(node_key(execution_id, node_id))
            .or_insert_with(|| NodeExecution::new(execution_id, node_id, now));
        Ok(node.clone())
    }

    async fn get_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeExecution>, StoreError> {
        Ok(self
            .nodes
            .read()
            .get(&node_key(execution_id, node_id))
            .cloned())
    }

    async fn list_nodes(&self, execution_id: Uuid) -> Result<Vec<NodeExecution>, StoreError> {
        let mut nodes: Vec<NodeExecution> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.execution_id == execution_id)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    async fn transition_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
        from: &[NodeStatus],
        update: NodeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<NodeExecution>, StoreError> {
        let mut nodes = self.nodes.write();
        let Some(node) = nodes.get_mut(&node_key(execution_id, node_id)) else {
            return Ok(None);
        };

        if !from.contains(&node.status) {
            return Ok(None);
        }

        update.apply(node, now);
        Ok(Some(node.clone()))
    }

    async fn record_node_input(&self, input: NodeInput) -> Result<(), StoreError> {
        self.inputs
            .write()
            .entry(node_key(input.execution_id, &input.node_id))
            .or_default()
            .push(input);
        Ok(())
    }

    async fn record_node_output(&self, output: NodeOutput) -> Result<(), StoreError> {
        self.outputs
            .write()
            .entry(node_key(output.execution_id, &output.node_id))
            .or_default()
            .push(output);
        Ok(())
    }

    async fn latest_node_input(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeInput>, StoreError> {
        Ok(self
            .inputs
            .read()
            .get(&node_key(execution_id, node_id))
            .and_then(|all| all.last().cloned()))
    }

    async fn latest_node_output(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeOutput>, StoreError> {
        Ok(self
            .outputs
            .read()
            .get(&node_key(execution_id, node_id))
            .and_then(|all| all.last().cloned()))
    }

    async fn append_node_logs(&self, logs: Vec<NodeLog>) -> Result<(), StoreError> {
        self.logs.write().extend(logs);
        Ok(())
    }

    async fn list_node_logs(
        &self,
        execution_id: Uuid,
        node_id: Option<&str>,
    ) -> Result<Vec<NodeLog>, StoreError> {
        Ok(self
            .logs
            .read()
            .iter()
            .filter(|log| log.execution_id == execution_id)
            .filter(|log| node_id.map_or(true, |id| log.node_id == id))
            .cloned()
            .collect())
    }

    async fn create_pause(&self, pause: &WorkflowPause) -> Result<(), StoreError> {
        self.pauses.write().push(pause.clone());
        Ok(())
    }

    async fn list_pauses(&self, execution_id: Uuid) -> Result<Vec<WorkflowPause>, StoreError> {
        Ok(self
            .pauses
            .read()
            .iter()
            .filter(|p| p.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn resolve_pause(
        &self,
        pause_id: Uuid,
        resume_data: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut pauses = self.pauses.write();
        let pause = pauses
            .iter_mut()
            .find(|p| p.id == pause_id)
            .ok_or(StoreError::PauseNotFound(pause_id))?;

        if !pause.is_active() {
            return Ok(false);
        }

        pause.resolved_at = Some(now);
        pause.resume_data = resume_data;
        Ok(true)
    }

    async fn enqueue(
        &self,
        item: NewQueueItem,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, StoreError> {
        let seq = self.queue_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let item = QueueItem {
            id: Uuid::now_v7(),
            workflow_id: item.workflow_id,
            execution_id: item.execution_id,
            user_id: item.user_id,
            priority: item.priority,
            status: QueueStatus::Pending,
            payload: item.payload,
            retry_count: 0,
            max_retries: item.max_retries,
            locked_by: None,
            locked_until: None,
            scheduled_for: item.scheduled_for,
            last_error: None,
            seq,
            created_at: now,
        };

        self.queue.write().insert(item.id, item.clone());
        Ok(item)
    }

    async fn lease_next(
        &self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError> {
        let mut queue = self.queue.write();

        let best = queue
            .values()
            .filter(|item| item.is_visible(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.scheduled_for.cmp(&b.scheduled_for))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|item| item.id);

        let Some(item_id) = best else {
            return Ok(None);
        };
        let Some(item) = queue.get_mut(&item_id) else {
            return Ok(None);
        };

        item.status = QueueStatus::Leased;
        item.locked_by = Some(worker_id.to_string());
        item.locked_until = Some(now + to_chrono(lease));
        Ok(Some(item.clone()))
    }

    async fn get_queue_item(&self, item_id: Uuid) -> Result<QueueItem, StoreError> {
        self.queue
            .read()
            .get(&item_id)
            .cloned()
            .ok_or(StoreError::QueueItemNotFound(item_id))
    }

    async fn complete_queue_item(
        &self,
        item_id: Uuid,
        worker_id: &str,
    ) -> Result<bool, StoreError> {
        let mut queue = self.queue.write();
        let item = queue
            .get_mut(&item_id)
            .ok_or(StoreError::QueueItemNotFound(item_id))?;
        if !item.is_leased_to(worker_id) {
            return Ok(false);
        }

        item.status = QueueStatus::Done;
        item.locked_by = None;
        item.locked_until = None;
        Ok(true)
    }

    async fn fail_queue_item(
        &self,
        item_id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<QueueFailOutcome>, StoreError> {
        let mut queue = self.queue.write();
        let item = queue
            .get_mut(&item_id)
            .ok_or(StoreError::QueueItemNotFound(item_id))?;
        if !item.is_leased_to(worker_id) {
            return Ok(None);
        }

        item.retry_count += 1;
        item.last_error = Some(error.to_string());
        item.locked_by = None;
        item.locked_until = None;

        if item.retry_count >= item.max_retries {
            item.status = QueueStatus::Failed;
            Ok(Some(QueueFailOutcome::DeadLettered {
                retry_count: item.retry_count,
            }))
        } else {
            item.status = QueueStatus::Pending;
            item.scheduled_for = retry_at;
            Ok(Some(QueueFailOutcome::Rescheduled {
                retry_count: item.retry_count,
                scheduled_for: retry_at,
            }))
        }
    }

    async fn list_dead_letters(&self, limit: u32) -> Result<Vec<QueueItem>, StoreError> {
        let mut items: Vec<QueueItem> = self
            .queue
            .read()
            .values()
            .filter(|item| item.status == QueueStatus::Failed)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.seq);
        items.truncate(limit as usize);
        Ok(items)
    }

    async fn requeue_dead_letter(
        &self,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError> {
        let mut queue = self.queue.write();
        let item = queue
            .get_mut(&item_id)
            .ok_or(StoreError::QueueItemNotFound(item_id))?;

        if item.status != QueueStatus::Failed {
            return Ok(None);
        }

        item.status = QueueStatus::Pending;
        item.retry_count = 0;
        item.scheduled_for = now;
        Ok(Some(item.clone()))
    }

    async fn get_circuit(&self, circuit_id: &str) -> Result<Option<CircuitRecord>, StoreError> {
        Ok(self.circuits.read().get(circuit_id).cloned())
    }

    async fn save_circuit(
        &self,
        record: &CircuitRecord,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let mut circuits = self.circuits.write();
        let current = circuits
            .get(&record.circuit_id)
            .map_or(0, |existing| existing.version);

        if current != expected_version {
            return Ok(false);
        }

        circuits.insert(record.circuit_id.clone(), record.clone());
        Ok(true)
    }
}

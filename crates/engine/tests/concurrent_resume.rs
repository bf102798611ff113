//! Two operators resuming sibling pauses at the same moment
//!
//! The in-memory store serialises every call, so the overlap is staged by a
//! delegating store: the second operator's resume lands between the first
//! operator reading the pause list and resolving its own pause.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use blockflow_engine::clock::ManualClock;
use blockflow_engine::model::{
    BlockType, CircuitRecord, ExecutionLog, ExecutionStatus, ExecutionUpdate, NewQueueItem,
    NodeDefinition, NodeExecution, NodeInput, NodeLog, NodeOutput, NodeStatus, NodeUpdate,
    QueueFailOutcome, QueueItem, WorkflowDefinition, WorkflowExecution, WorkflowPause,
};
use blockflow_engine::worker::Delivery;
use blockflow_engine::{
    AdvanceOutcome, Engine, ExecutionStore, HandlerRegistry, InMemoryExecutionStore,
    ResumeOutcome, StoreError, TriggerOptions, WorkerPool, WorkerPoolConfig,
};

/// A resume by another operator, applied just before the next pause resolve
struct RacingResume {
    execution_id: Uuid,
    node_id: String,
    data: Value,
}

struct RacingStore {
    inner: InMemoryExecutionStore,
    racing: Mutex<Option<RacingResume>>,
}

impl RacingStore {
    fn new() -> Self {
        Self {
            inner: InMemoryExecutionStore::new(),
            racing: Mutex::new(None),
        }
    }

    fn race_next_resolve(&self, resume: RacingResume) {
        *self.racing.lock() = Some(resume);
    }
}

#[async_trait]
impl ExecutionStore for RacingStore {
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError> {
        self.inner.save_workflow(workflow).await
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowDefinition, StoreError> {
        self.inner.get_workflow(workflow_id).await
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        self.inner.create_execution(execution).await
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, StoreError> {
        self.inner.get_execution(execution_id).await
    }

    async fn transition_execution(
        &self,
        execution_id: Uuid,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        update: ExecutionUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowExecution>, StoreError> {
        self.inner
            .transition_execution(execution_id, from, to, update, now)
            .await
    }

    async fn append_execution_log(
        &self,
        execution_id: Uuid,
        log: ExecutionLog,
    ) -> Result<(), StoreError> {
        self.inner.append_execution_log(execution_id, log).await
    }

    async fn set_execution_lock(
        &self,
        execution_id: Uuid,
        worker_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.set_execution_lock(execution_id, worker_id, now).await
    }

    async fn get_or_create_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<NodeExecution, StoreError> {
        self.inner.get_or_create_node(execution_id, node_id, now).await
    }

    async fn get_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeExecution>, StoreError> {
        self.inner.get_node(execution_id, node_id).await
    }

    async fn list_nodes(&self, execution_id: Uuid) -> Result<Vec<NodeExecution>, StoreError> {
        self.inner.list_nodes(execution_id).await
    }

    async fn transition_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
        from: &[NodeStatus],
        update: NodeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<NodeExecution>, StoreError> {
        self.inner
            .transition_node(execution_id, node_id, from, update, now)
            .await
    }

    async fn record_node_input(&self, input: NodeInput) -> Result<(), StoreError> {
        self.inner.record_node_input(input).await
    }

    async fn record_node_output(&self, output: NodeOutput) -> Result<(), StoreError> {
        self.inner.record_node_output(output).await
    }

    async fn latest_node_input(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeInput>, StoreError> {
        self.inner.latest_node_input(execution_id, node_id).await
    }

    async fn latest_node_output(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<NodeOutput>, StoreError> {
        self.inner.latest_node_output(execution_id, node_id).await
    }

    async fn append_node_logs(&self, logs: Vec<NodeLog>) -> Result<(), StoreError> {
        self.inner.append_node_logs(logs).await
    }

    async fn list_node_logs(
        &self,
        execution_id: Uuid,
        node_id: Option<&str>,
    ) -> Result<Vec<NodeLog>, StoreError> {
        self.inner.list_node_logs(execution_id, node_id).await
    }

    async fn create_pause(&self, pause: &WorkflowPause) -> Result<(), StoreError> {
        self.inner.create_pause(pause).await
    }

    async fn list_pauses(&self, execution_id: Uuid) -> Result<Vec<WorkflowPause>, StoreError> {
        self.inner.list_pauses(execution_id).await
    }

    async fn resolve_pause(
        &self,
        pause_id: Uuid,
        resume_data: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let racing = self.racing.lock().take();
        if let Some(other) = racing {
            // The other operator resolves its pause and requeues its node;
            // it read the pause list earlier, saw ours active, and stops there
            let pause = self
                .inner
                .list_pauses(other.execution_id)
                .await?
                .into_iter()
                .find(|p| p.is_active() && p.node_id.as_deref() == Some(other.node_id.as_str()))
                .ok_or(StoreError::PauseNotFound(other.execution_id))?;
            self.inner
                .resolve_pause(pause.id, Some(other.data.clone()), now)
                .await?;
            self.inner
                .transition_node(
                    other.execution_id,
                    &other.node_id,
                    &[NodeStatus::Paused],
                    NodeUpdate::status(NodeStatus::Pending).with_input_override(Some(other.data)),
                    now,
                )
                .await?;
        }

        self.inner.resolve_pause(pause_id, resume_data, now).await
    }

    async fn enqueue(
        &self,
        item: NewQueueItem,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, StoreError> {
        self.inner.enqueue(item, now).await
    }

    async fn lease_next(
        &self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError> {
        self.inner.lease_next(worker_id, lease, now).await
    }

    async fn get_queue_item(&self, item_id: Uuid) -> Result<QueueItem, StoreError> {
        self.inner.get_queue_item(item_id).await
    }

    async fn complete_queue_item(
        &self,
        item_id: Uuid,
        worker_id: &str,
    ) -> Result<bool, StoreError> {
        self.inner.complete_queue_item(item_id, worker_id).await
    }

    async fn fail_queue_item(
        &self,
        item_id: Uuid,
        worker_id: &str,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<QueueFailOutcome>, StoreError> {
        self.inner
            .fail_queue_item(item_id, worker_id, error, retry_at)
            .await
    }

    async fn list_dead_letters(&self, limit: u32) -> Result<Vec<QueueItem>, StoreError> {
        self.inner.list_dead_letters(limit).await
    }

    async fn requeue_dead_letter(
        &self,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError> {
        self.inner.requeue_dead_letter(item_id, now).await
    }

    async fn get_circuit(&self, circuit_id: &str) -> Result<Option<CircuitRecord>, StoreError> {
        self.inner.get_circuit(circuit_id).await
    }

    async fn save_circuit(
        &self,
        record: &CircuitRecord,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        self.inner.save_circuit(record, expected_version).await
    }
}

#[test_log::test(tokio::test)]
async fn test_last_of_two_concurrent_resumes_continues_execution() {
    let store = Arc::new(RacingStore::new());
    let engine = Engine::builder(store.clone())
        .with_clock(Arc::new(ManualClock::starting_now()))
        .with_handlers(HandlerRegistry::with_builtins())
        .build();
    let pool = WorkerPool::new(
        engine.clone(),
        WorkerPoolConfig::from_engine(engine.config()).with_worker_id("w1"),
    );

    let workflow = WorkflowDefinition::new(Uuid::now_v7(), "two approvals")
        .with_node(NodeDefinition::new("legal", BlockType::ManualApproval))
        .with_node(NodeDefinition::new("finance", BlockType::ManualApproval))
        .with_node(NodeDefinition::new("join", BlockType::Transform))
        .with_edge("legal", "join")
        .with_edge("finance", "join");
    let workflow = engine.machine().save_workflow(workflow).await.unwrap();
    let id = engine
        .machine()
        .trigger(workflow.id, json!({"amount": 7}), TriggerOptions::default())
        .await
        .unwrap()
        .id;

    let (_, delivery) = pool.process_next().await.unwrap().unwrap();
    assert_eq!(delivery, Delivery::Advanced(AdvanceOutcome::Paused));
    let active = store.list_pauses(id).await.unwrap();
    assert_eq!(active.iter().filter(|p| p.is_active()).count(), 2);

    store.race_next_resolve(RacingResume {
        execution_id: id,
        node_id: "finance".into(),
        data: json!({"amount": 7, "finance": "ok"}),
    });
    let resumed = engine
        .pauses()
        .resume(id, Some("legal"), Some(json!({"legal": "ok"})))
        .await
        .unwrap();

    assert!(matches!(resumed, ResumeOutcome::Resumed(_)));
    assert_eq!(resumed.execution().status, ExecutionStatus::Running);
    assert!(store.list_pauses(id).await.unwrap().iter().all(|p| !p.is_active()));

    let (_, delivery) = pool.process_next().await.unwrap().expect("resume requeued the execution");
    assert_eq!(delivery, Delivery::Advanced(AdvanceOutcome::Completed));

    let execution = engine.machine().execution(id).await.unwrap();
    assert_eq!(
        execution.output,
        Some(json!({"join": {
            "legal": {"amount": 7, "legal": "ok"},
            "finance": {"amount": 7, "finance": "ok"}
        }}))
    );
}

//! End-to-end scenarios driven through the worker pool
//!
//! Every test runs against the in-memory store with a manual clock, so
//! retries, lease expiry and breaker cooldowns are stepped explicitly
//! instead of waited for.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use blockflow_engine::clock::{Clock, ManualClock};
use blockflow_engine::model::{
    BlockType, ExecutionStatus, NodeDefinition, NodeStatus, NodeUpdate, QueueStatus,
    WorkflowDefinition,
};
use blockflow_engine::worker::Delivery;
use blockflow_engine::{
    AdvanceOutcome, BlockError, BlockHandler, BlockRegistration, CircuitBreakerConfig, Engine,
    EngineConfig, EngineError, ExecutionStore, HandlerRegistry, InMemoryExecutionStore, NodeContext,
    ResumeOutcome, RetryPolicy, TriggerOptions, WorkerPool, WorkerPoolConfig,
};

/// Fails with a transient error until `failures` calls have been made
struct Flaky {
    calls: Arc<AtomicU32>,
    failures: u32,
}

#[async_trait]
impl BlockHandler for Flaky {
    async fn execute(&self, ctx: &NodeContext) -> Result<Value, BlockError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(BlockError::transient(format!("attempt {call}: upstream 503")));
        }
        Ok(json!({"attempt": ctx.attempt, "inputs": ctx.inputs}))
    }
}

/// Fails terminally while the switch is off
struct Switch {
    on: Arc<AtomicBool>,
}

#[async_trait]
impl BlockHandler for Switch {
    async fn execute(&self, _ctx: &NodeContext) -> Result<Value, BlockError> {
        if self.on.load(Ordering::SeqCst) {
            Ok(json!({"ok": true}))
        } else {
            Err(BlockError::terminal("invalid recipient"))
        }
    }
}

/// Counts calls and yields long enough for concurrent advances to overlap
struct Slow {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl BlockHandler for Slow {
    async fn execute(&self, ctx: &NodeContext) -> Result<Value, BlockError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(json!({"node": ctx.node_id}))
    }
}

#[derive(Default)]
struct Overlap {
    running: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

/// Records how many calls overlap at once
struct Gauge(Arc<Overlap>);

#[async_trait]
impl BlockHandler for Gauge {
    async fn execute(&self, ctx: &NodeContext) -> Result<Value, BlockError> {
        let running = self.0.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.0.running.fetch_sub(1, Ordering::SeqCst);
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"node": ctx.node_id}))
    }
}

struct Harness {
    clock: ManualClock,
    store: Arc<InMemoryExecutionStore>,
    engine: Engine,
    pool: WorkerPool,
}

impl Harness {
    fn new(handlers: HandlerRegistry) -> Self {
        Self::with_config(handlers, EngineConfig::default())
    }

    fn with_config(handlers: HandlerRegistry, config: EngineConfig) -> Self {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryExecutionStore::new());
        let engine = Engine::builder(store.clone())
            .with_clock(Arc::new(clock.clone()))
            .with_handlers(handlers)
            .with_config(config)
            .with_circuit(
                "smtp",
                CircuitBreakerConfig::default()
                    .with_failure_threshold(1)
                    .with_cooldown(Duration::from_secs(30)),
            )
            .build();
        let pool = WorkerPool::new(
            engine.clone(),
            WorkerPoolConfig::from_engine(engine.config()).with_worker_id("worker-b"),
        );

        Self {
            clock,
            store,
            engine,
            pool,
        }
    }

    async fn start(&self, workflow: WorkflowDefinition, input: Value) -> Uuid {
        let workflow = self.engine.machine().save_workflow(workflow).await.unwrap();
        self.engine
            .machine()
            .trigger(workflow.id, input, TriggerOptions::default())
            .await
            .unwrap()
            .id
    }

    async fn step(&self) -> Delivery {
        let (_, delivery) = self
            .pool
            .process_next()
            .await
            .unwrap()
            .expect("a visible queue item");
        delivery
    }

    async fn status(&self, execution_id: Uuid) -> ExecutionStatus {
        self.engine.machine().execution(execution_id).await.unwrap().status
    }

    async fn node_status(&self, execution_id: Uuid, node_id: &str) -> Option<NodeStatus> {
        self.store
            .get_node(execution_id, node_id)
            .await
            .unwrap()
            .map(|n| n.status)
    }
}

fn registry_with(block_type: BlockType, registration: BlockRegistration) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::with_builtins();
    handlers.register(block_type, registration);
    handlers
}

fn custom(name: &str) -> BlockType {
    BlockType::Custom(name.to_string())
}

#[test_log::test(tokio::test)]
async fn test_linear_workflow_completes_with_sink_output() {
    let h = Harness::new(HandlerRegistry::with_builtins());
    let workflow = WorkflowDefinition::new(Uuid::now_v7(), "linear")
        .with_node(NodeDefinition::new("a", BlockType::Transform))
        .with_node(
            NodeDefinition::new("b", BlockType::Transform).with_config(json!({"set": {"seen": true}})),
        )
        .with_edge("a", "b");
    let id = h.start(workflow, json!({"x": 1})).await;

    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Completed));

    let execution = h.engine.machine().execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        execution.output,
        Some(json!({"b": {"a": {"x": 1}, "seen": true}}))
    );
    assert!(execution.finished_at.is_some());
    assert!(h.pool.process_next().await.unwrap().is_none());
}

#[test_log::test(tokio::test)]
async fn test_transient_failures_retry_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let handlers = registry_with(
        custom("fetch"),
        BlockRegistration::new(Flaky {
            calls: calls.clone(),
            failures: 2,
        })
        .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(1), 3)),
    );
    let h = Harness::new(handlers);
    let workflow = WorkflowDefinition::new(Uuid::now_v7(), "retry")
        .with_node(NodeDefinition::new("a", BlockType::Transform))
        .with_node(NodeDefinition::new("b", custom("fetch")))
        .with_edge("a", "b");
    let id = h.start(workflow, json!({"x": 1})).await;

    let first = h.step().await;
    assert!(matches!(first, Delivery::Advanced(AdvanceOutcome::WakeAt(_))));
    assert_eq!(h.node_status(id, "a").await, Some(NodeStatus::Completed));
    assert_eq!(h.node_status(id, "b").await, Some(NodeStatus::Pending));

    // The wake-up item is not visible before the backoff elapses
    assert!(h.pool.process_next().await.unwrap().is_none());

    h.clock.advance(Duration::from_secs(1));
    assert!(matches!(
        h.step().await,
        Delivery::Advanced(AdvanceOutcome::WakeAt(_))
    ));

    h.clock.advance(Duration::from_secs(1));
    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Completed));

    let b = h.store.get_node(id, "b").await.unwrap().unwrap();
    assert_eq!(b.status, NodeStatus::Completed);
    assert_eq!(b.retry_count, 2);
    assert_eq!(b.error, None);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let execution = h.engine.machine().execution(id).await.unwrap();
    assert_eq!(execution.output.unwrap()["b"]["attempt"], json!(3));
}

#[test_log::test(tokio::test)]
async fn test_retry_budget_is_bounded() {
    let calls = Arc::new(AtomicU32::new(0));
    let handlers = registry_with(
        custom("fetch"),
        BlockRegistration::new(Flaky {
            calls: calls.clone(),
            failures: u32::MAX,
        })
        .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(1), 2)),
    );
    let h = Harness::new(handlers);
    let workflow =
        WorkflowDefinition::new(Uuid::now_v7(), "bounded").with_node(NodeDefinition::new("a", custom("fetch")));
    let id = h.start(workflow, json!({})).await;

    assert!(matches!(h.step().await, Delivery::Advanced(AdvanceOutcome::WakeAt(_))));
    h.clock.advance(Duration::from_secs(1));
    assert!(matches!(h.step().await, Delivery::Advanced(AdvanceOutcome::WakeAt(_))));
    h.clock.advance(Duration::from_secs(1));
    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Failed));

    // Initial attempt plus two retries
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let node = h.store.get_node(id, "a").await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Failed);
    assert_eq!(node.retry_count, 2);

    let execution = h.engine.machine().execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(
        execution.error.as_deref(),
        Some("node a failed: attempt 3: upstream 503")
    );

    h.clock.advance(Duration::from_secs(60));
    assert!(h.pool.process_next().await.unwrap().is_none());
}

#[test_log::test(tokio::test)]
async fn test_partial_failure_halts_only_dependents() {
    let on = Arc::new(AtomicBool::new(false));
    let handlers = registry_with(
        BlockType::Email,
        BlockRegistration::new(Switch { on }).with_retry_policy(RetryPolicy::no_retry()),
    );
    let h = Harness::new(handlers);
    let workflow = WorkflowDefinition::new(Uuid::now_v7(), "fan-out")
        .with_node(NodeDefinition::new("a", BlockType::Transform))
        .with_node(NodeDefinition::new("mail", BlockType::Email))
        .with_node(NodeDefinition::new("audit", BlockType::Transform))
        .with_node(NodeDefinition::new("after_mail", BlockType::Transform))
        .with_edge("a", "mail")
        .with_edge("a", "audit")
        .with_edge("mail", "after_mail");
    let id = h.start(workflow, json!({"x": 1})).await;

    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Failed));

    assert_eq!(h.node_status(id, "a").await, Some(NodeStatus::Completed));
    assert_eq!(h.node_status(id, "audit").await, Some(NodeStatus::Completed));
    assert_eq!(h.node_status(id, "mail").await, Some(NodeStatus::Failed));
    assert_eq!(h.node_status(id, "after_mail").await, None);

    let execution = h.engine.machine().execution(id).await.unwrap();
    assert_eq!(
        execution.error.as_deref(),
        Some("node mail failed: invalid recipient")
    );
}

#[test_log::test(tokio::test)]
async fn test_expired_lease_is_reclaimed_by_another_worker() {
    let h = Harness::new(HandlerRegistry::with_builtins());
    let workflow =
        WorkflowDefinition::new(Uuid::now_v7(), "reclaim").with_node(NodeDefinition::new("a", BlockType::Transform));
    let id = h.start(workflow, json!({"x": 1})).await;

    // worker-a leases the item, claims the node, then disappears
    let leased = h
        .engine
        .queue()
        .lease_next("worker-a", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let now = h.clock.now();
    h.store.get_or_create_node(id, "a", now).await.unwrap();
    h.store
        .transition_node(
            id,
            "a",
            &[NodeStatus::Pending],
            NodeUpdate::status(NodeStatus::Running).with_started_at(now),
            now,
        )
        .await
        .unwrap()
        .unwrap();

    assert!(h.pool.process_next().await.unwrap().is_none());

    h.clock.advance(Duration::from_secs(31));
    let (item, delivery) = h.pool.process_next().await.unwrap().unwrap();
    assert_eq!(item.id, leased.id);
    assert_eq!(item.locked_by.as_deref(), Some("worker-b"));
    assert_eq!(delivery, Delivery::Advanced(AdvanceOutcome::Completed));

    assert_eq!(h.status(id).await, ExecutionStatus::Completed);
    let items = h.store.queue_items_for(id);
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, QueueStatus::Done);
}

#[test_log::test(tokio::test)]
async fn test_node_claimed_mid_lease_is_recovered_on_wake() {
    let h = Harness::new(HandlerRegistry::with_builtins());
    let workflow = WorkflowDefinition::new(Uuid::now_v7(), "chain")
        .with_node(NodeDefinition::new("a", BlockType::Transform))
        .with_node(NodeDefinition::new("b", BlockType::Transform))
        .with_edge("a", "b");
    let id = h.start(workflow, json!({"x": 1})).await;
    let leased_at = h.clock.now();

    // worker-a finishes `a`, claims `b` five seconds into its lease, then dies
    h.engine
        .queue()
        .lease_next("worker-a", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    h.store.get_or_create_node(id, "a", leased_at).await.unwrap();
    h.store
        .transition_node(
            id,
            "a",
            &[NodeStatus::Pending],
            NodeUpdate::status(NodeStatus::Completed)
                .with_output(json!({"x": 1}))
                .with_completed_at(leased_at),
            leased_at,
        )
        .await
        .unwrap()
        .unwrap();
    h.clock.advance(Duration::from_secs(5));
    let claimed_at = h.clock.now();
    h.store.get_or_create_node(id, "b", claimed_at).await.unwrap();
    h.store
        .transition_node(
            id,
            "b",
            &[NodeStatus::Pending],
            NodeUpdate::status(NodeStatus::Running).with_started_at(claimed_at),
            claimed_at,
        )
        .await
        .unwrap()
        .unwrap();

    // The delivery comes back before the claim on `b` has lapsed
    h.clock.advance(Duration::from_secs(26));
    let claim_lapses = claimed_at + chrono::Duration::seconds(30);
    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::WakeAt(claim_lapses)));
    assert_eq!(h.status(id).await, ExecutionStatus::Running);
    assert_eq!(h.node_status(id, "b").await, Some(NodeStatus::Running));

    assert!(h.pool.process_next().await.unwrap().is_none());
    h.clock.advance(Duration::from_secs(4));
    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Completed));

    let execution = h.engine.machine().execution(id).await.unwrap();
    assert_eq!(execution.output, Some(json!({"b": {"a": {"x": 1}}})));
}

#[test_log::test(tokio::test)]
async fn test_delay_block_waits_on_the_queue() {
    let h = Harness::new(HandlerRegistry::with_builtins());
    let workflow = WorkflowDefinition::new(Uuid::now_v7(), "cooling-off")
        .with_node(NodeDefinition::new("a", BlockType::Transform))
        .with_node(
            NodeDefinition::new("wait", BlockType::Delay).with_config(json!({"duration_ms": 5000})),
        )
        .with_node(NodeDefinition::new("b", BlockType::Transform))
        .with_edge("a", "wait")
        .with_edge("wait", "b");
    let id = h.start(workflow, json!({"x": 1})).await;
    let due = h.clock.now() + chrono::Duration::seconds(5);

    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::WakeAt(due)));
    assert_eq!(h.status(id).await, ExecutionStatus::Running);
    let wait = h.store.get_node(id, "wait").await.unwrap().unwrap();
    assert_eq!(wait.status, NodeStatus::Pending);
    assert_eq!(wait.not_before, Some(due));
    assert_eq!(wait.retry_count, 0);
    assert_eq!(h.node_status(id, "b").await, None);

    h.clock.advance(Duration::from_secs(4));
    assert!(h.pool.process_next().await.unwrap().is_none());

    h.clock.advance(Duration::from_secs(1));
    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Completed));
    let execution = h.engine.machine().execution(id).await.unwrap();
    assert_eq!(execution.output, Some(json!({"b": {"wait": {"a": {"x": 1}}}})));
}

#[test_log::test(tokio::test)]
async fn test_manual_approval_snapshot_and_resume() {
    let h = Harness::new(HandlerRegistry::with_builtins());
    let workflow = WorkflowDefinition::new(Uuid::now_v7(), "approval")
        .with_node(
            NodeDefinition::new("approve", BlockType::ManualApproval)
                .with_config(json!({"reason": "large transfer"})),
        )
        .with_node(NodeDefinition::new("t", BlockType::Transform))
        .with_edge("approve", "t");
    let id = h.start(workflow, json!({"amount": 5})).await;

    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Paused));
    assert_eq!(h.status(id).await, ExecutionStatus::Paused);
    assert_eq!(h.node_status(id, "approve").await, Some(NodeStatus::Paused));
    assert_eq!(h.node_status(id, "t").await, None);

    let pauses = h.store.list_pauses(id).await.unwrap();
    assert_eq!(pauses.len(), 1);
    assert_eq!(pauses[0].reason, "large transfer");
    assert_eq!(pauses[0].node_id.as_deref(), Some("approve"));

    let snapshot = h.engine.pauses().snapshot(id, "approve").await.unwrap();
    assert_eq!(snapshot.data, json!({"amount": 5}));

    let resumed = h
        .engine
        .pauses()
        .resume(id, Some("approve"), Some(json!({"approved": true})))
        .await
        .unwrap();
    assert!(matches!(resumed, ResumeOutcome::Resumed(_)));
    assert_eq!(resumed.execution().status, ExecutionStatus::Running);

    // A second resume of the same pause changes nothing
    let again = h
        .engine
        .pauses()
        .resume(id, Some("approve"), Some(json!({"approved": false})))
        .await
        .unwrap();
    assert!(matches!(again, ResumeOutcome::AlreadyResumed(_)));

    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Completed));

    let execution = h.engine.machine().execution(id).await.unwrap();
    assert_eq!(
        execution.output,
        Some(json!({"t": {"approve": {"amount": 5, "approved": true}}}))
    );
}

#[test_log::test(tokio::test)]
async fn test_resume_rejects_non_object_data() {
    let h = Harness::new(HandlerRegistry::with_builtins());
    let workflow = WorkflowDefinition::new(Uuid::now_v7(), "approval")
        .with_node(NodeDefinition::new("approve", BlockType::ManualApproval));
    let id = h.start(workflow, json!({})).await;
    h.step().await;

    let err = h
        .engine
        .pauses()
        .resume(id, Some("approve"), Some(json!([1, 2])))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidResumeData(_)));
    assert_eq!(h.status(id).await, ExecutionStatus::Paused);
}

#[test_log::test(tokio::test)]
async fn test_open_circuit_defers_without_calling_handler() {
    let calls = Arc::new(AtomicU32::new(0));
    let handlers = registry_with(
        BlockType::Email,
        BlockRegistration::new(Flaky {
            calls: calls.clone(),
            failures: 0,
        })
        .with_circuit("smtp"),
    );
    let h = Harness::new(handlers);

    h.engine
        .breakers()
        .acquire("smtp")
        .await
        .unwrap()
        .failure()
        .await
        .unwrap();

    let workflow =
        WorkflowDefinition::new(Uuid::now_v7(), "mail").with_node(NodeDefinition::new("send", BlockType::Email));
    let id = h.start(workflow, json!({})).await;

    let opened_at = h.clock.now();
    match h.step().await {
        Delivery::Advanced(AdvanceOutcome::WakeAt(at)) => {
            assert_eq!(at, opened_at + chrono::Duration::seconds(30));
        }
        other => panic!("expected a wake-up, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let node = h.store.get_node(id, "send").await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Pending);
    assert_eq!(node.deferral_count, 1);
    assert_eq!(node.retry_count, 0);

    // After the cooldown the node becomes the half-open probe
    h.clock.advance(Duration::from_secs(30));
    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Completed));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let circuit = h.engine.breakers().state("smtp").await.unwrap();
    assert_eq!(circuit.state, blockflow_engine::model::CircuitState::Closed);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_advances_run_each_node_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let handlers = registry_with(
        custom("slow"),
        BlockRegistration::new(Slow {
            calls: calls.clone(),
        }),
    );
    let h = Harness::new(handlers);
    let workflow = WorkflowDefinition::new(Uuid::now_v7(), "race")
        .with_node(NodeDefinition::new("a", custom("slow")))
        .with_node(NodeDefinition::new("b", custom("slow")))
        .with_node(NodeDefinition::new("c", custom("slow")))
        .with_edge("a", "c")
        .with_edge("b", "c");
    let id = h.start(workflow, json!({})).await;

    let machine = h.engine.machine();
    let (first, second) = tokio::join!(machine.advance(id, "w1"), machine.advance(id, "w2"));
    first.unwrap();
    second.unwrap();

    // Whatever the interleaving, a final advance finishes the graph
    machine.advance(id, "w3").await.unwrap();

    assert_eq!(h.status(id).await, ExecutionStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.store.node_count(), 3);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_parallel_nodes_are_capped() {
    let overlap = Arc::new(Overlap::default());
    let handlers = registry_with(custom("gauge"), BlockRegistration::new(Gauge(overlap.clone())));
    let h = Harness::with_config(handlers, EngineConfig::default().with_max_parallel_nodes(2));

    let workflow = (0..6).fold(WorkflowDefinition::new(Uuid::now_v7(), "fan-out"), |wf, i| {
        wf.with_node(NodeDefinition::new(format!("n{i}"), custom("gauge")))
    });
    let id = h.start(workflow, json!({})).await;

    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Completed));
    assert_eq!(h.status(id).await, ExecutionStatus::Completed);
    assert_eq!(overlap.calls.load(Ordering::SeqCst), 6);
    let peak = overlap.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "{peak} nodes ran at once");
}

#[test_log::test(tokio::test)]
async fn test_cancel_fails_execution_and_rejects_repeat() {
    let h = Harness::new(HandlerRegistry::with_builtins());
    let workflow = WorkflowDefinition::new(Uuid::now_v7(), "approval")
        .with_node(NodeDefinition::new("approve", BlockType::ManualApproval));
    let id = h.start(workflow, json!({})).await;
    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Paused));

    let cancelled = h.engine.machine().cancel(id, "operator").await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Failed);
    assert_eq!(cancelled.error.as_deref(), Some("cancelled: operator"));
    assert!(cancelled.cancelled_at.is_some());
    assert_eq!(h.node_status(id, "approve").await, Some(NodeStatus::Cancelled));
    assert!(h
        .store
        .list_pauses(id)
        .await
        .unwrap()
        .iter()
        .all(|p| !p.is_active()));

    let err = h.engine.machine().cancel(id, "again").await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    let err = h
        .engine
        .pauses()
        .resume(id, Some("approve"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PauseNotFound { .. }));
}

#[test_log::test(tokio::test)]
async fn test_cancelled_pending_execution_never_runs() {
    let h = Harness::new(HandlerRegistry::with_builtins());
    let workflow =
        WorkflowDefinition::new(Uuid::now_v7(), "t").with_node(NodeDefinition::new("a", BlockType::Transform));
    let id = h.start(workflow, json!({})).await;

    h.engine.machine().cancel(id, "not needed").await.unwrap();
    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Failed));
    assert_eq!(h.node_status(id, "a").await, None);
}

#[test_log::test(tokio::test)]
async fn test_operator_pause_holds_dispatch_until_resume() {
    let calls = Arc::new(AtomicU32::new(0));
    let handlers = registry_with(
        custom("fetch"),
        BlockRegistration::new(Flaky {
            calls: calls.clone(),
            failures: 1,
        })
        .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(5), 3)),
    );
    let h = Harness::new(handlers);
    let workflow = WorkflowDefinition::new(Uuid::now_v7(), "hold")
        .with_node(NodeDefinition::new("a", custom("fetch")));
    let id = h.start(workflow, json!({})).await;

    assert!(matches!(h.step().await, Delivery::Advanced(AdvanceOutcome::WakeAt(_))));
    assert_eq!(h.status(id).await, ExecutionStatus::Running);

    let paused = h
        .engine
        .pauses()
        .pause_execution(id, "maintenance")
        .await
        .unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);

    let err = h
        .engine
        .pauses()
        .pause_execution(id, "twice")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    h.clock.advance(Duration::from_secs(5));
    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Paused));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let resumed = h.engine.pauses().resume(id, None, None).await.unwrap();
    assert!(matches!(resumed, ResumeOutcome::Resumed(_)));
    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Completed));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test_log::test(tokio::test)]
async fn test_retry_node_reopens_failed_execution() {
    let on = Arc::new(AtomicBool::new(false));
    let handlers = registry_with(
        BlockType::Email,
        BlockRegistration::new(Switch { on: on.clone() }).with_retry_policy(RetryPolicy::no_retry()),
    );
    let h = Harness::new(handlers);
    let workflow = WorkflowDefinition::new(Uuid::now_v7(), "fixable")
        .with_node(NodeDefinition::new("a", BlockType::Transform))
        .with_node(NodeDefinition::new("mail", BlockType::Email))
        .with_edge("a", "mail");
    let id = h.start(workflow, json!({})).await;
    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Failed));

    let err = h.engine.machine().retry_node(id, "a").await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    let err = h.engine.machine().retry_node(id, "nope").await.unwrap_err();
    assert!(matches!(err, EngineError::NodeNotFound { .. }));

    on.store(true, Ordering::SeqCst);
    let node = h.engine.machine().retry_node(id, "mail").await.unwrap();
    assert_eq!(node.status, NodeStatus::Pending);
    assert_eq!(node.retry_count, 0);

    let execution = h.engine.machine().execution(id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Running);
    assert_eq!(execution.error, None);

    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Completed));
    assert_eq!(
        h.engine.machine().execution(id).await.unwrap().output,
        Some(json!({"mail": {"ok": true}}))
    );
}

#[test_log::test(tokio::test)]
async fn test_retry_node_rejected_after_cancel() {
    let h = Harness::new(registry_with(
        BlockType::Email,
        BlockRegistration::new(Switch {
            on: Arc::new(AtomicBool::new(false)),
        })
        .with_retry_policy(RetryPolicy::no_retry()),
    ));
    let workflow = WorkflowDefinition::new(Uuid::now_v7(), "mail")
        .with_node(NodeDefinition::new("a", BlockType::Transform))
        .with_node(NodeDefinition::new("b", BlockType::ManualApproval))
        .with_node(NodeDefinition::new("mail", BlockType::Email))
        .with_edge("a", "mail")
        .with_edge("a", "b");
    let id = h.start(workflow, json!({})).await;
    assert_eq!(h.step().await, Delivery::Advanced(AdvanceOutcome::Paused));
    assert_eq!(h.node_status(id, "mail").await, Some(NodeStatus::Failed));

    h.engine.machine().cancel(id, "operator").await.unwrap();
    let err = h.engine.machine().retry_node(id, "mail").await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[test_log::test(tokio::test)]
async fn test_unknown_block_type_is_rejected_on_save() {
    let h = Harness::new(HandlerRegistry::with_builtins());
    let workflow = WorkflowDefinition::new(Uuid::now_v7(), "bad")
        .with_node(NodeDefinition::new("a", custom("missing")));

    let err = h.engine.machine().save_workflow(workflow).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownBlockType { .. }));
}

#[test_log::test(tokio::test)]
async fn test_cyclic_workflow_is_rejected_on_save() {
    let h = Harness::new(HandlerRegistry::with_builtins());
    let workflow = WorkflowDefinition::new(Uuid::now_v7(), "loop")
        .with_node(NodeDefinition::new("a", BlockType::Transform))
        .with_node(NodeDefinition::new("b", BlockType::Transform))
        .with_edge("a", "b")
        .with_edge("b", "a");

    let err = h.engine.machine().save_workflow(workflow).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidWorkflow(_)));
}

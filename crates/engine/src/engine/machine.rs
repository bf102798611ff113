//! Workflow execution state machine
//!
//! `advance` walks an execution's graph once: it dispatches every node whose
//! predecessors completed, bounded by `max_parallel_nodes`, keeps dispatching
//! as nodes finish, and settles the execution when nothing is left to run.
//!
//! ```text
//!  trigger ──► queue ──► advance ──┬──► completed
//!                 ▲                ├──► failed
//!                 │   wake at      ├──► paused ──► resume ──┐
//!                 └────────────────┘                         │
//!                 ▲                                          │
//!                 └──────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::executor::{NodeExecutor, NodeRun, NodeRunOutcome};
use super::pause::PauseManager;
use crate::block::{HandlerRegistry, ResolvedBlock};
use crate::clock::{to_chrono, Clock};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::{
    ExecutionLog, ExecutionStatus, ExecutionUpdate, LogLevel, NodeExecution, NodeStatus,
    NodeUpdate, WorkflowDefinition, WorkflowExecution,
};
use crate::persistence::ExecutionStore;
use crate::queue::{EnqueueRequest, ExecutionQueue};

/// Where an execution stands after one `advance`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    Completed,
    Failed,
    Paused,

    /// Retries are scheduled; advance again at this instant
    WakeAt(DateTime<Utc>),

    /// Nothing to run and nothing scheduled
    Idle,
}

impl AdvanceOutcome {
    fn settled(status: ExecutionStatus) -> Option<Self> {
        match status {
            ExecutionStatus::Completed => Some(Self::Completed),
            ExecutionStatus::Failed => Some(Self::Failed),
            ExecutionStatus::Paused => Some(Self::Paused),
            ExecutionStatus::Pending | ExecutionStatus::Running => None,
        }
    }
}

/// Options for starting an execution
#[derive(Debug, Clone, Default)]
pub struct TriggerOptions {
    pub user_id: Option<Uuid>,
    pub priority: i32,
    pub metadata: Value,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl TriggerOptions {
    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }
}

type NodeTask = (String, Result<NodeRunOutcome, EngineError>);

/// Owns the lifecycle of executions and their node executions
pub struct StateMachine {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    handlers: HandlerRegistry,
    executor: Arc<NodeExecutor>,
    pauses: Arc<PauseManager>,
    queue: Arc<ExecutionQueue>,
    config: EngineConfig,
    /// Cancellation tokens of executions this process is advancing
    running: DashMap<Uuid, CancellationToken>,
}

impl StateMachine {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        clock: Arc<dyn Clock>,
        handlers: HandlerRegistry,
        executor: Arc<NodeExecutor>,
        pauses: Arc<PauseManager>,
        queue: Arc<ExecutionQueue>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            handlers,
            executor,
            pauses,
            queue,
            config,
            running: DashMap::new(),
        }
    }

    /// Validate and store a workflow definition
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    pub async fn save_workflow(
        &self,
        mut workflow: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, EngineError> {
        workflow.validate()?;
        self.resolve_blocks(&workflow)?;

        workflow.updated_at = self.clock.now();
        self.store.save_workflow(&workflow).await?;
        info!(nodes = workflow.nodes.len(), "workflow saved");
        Ok(workflow)
    }

    /// Create an execution and put it on the queue
    #[instrument(skip(self, input, options))]
    pub async fn trigger(
        &self,
        workflow_id: Uuid,
        input: Value,
        options: TriggerOptions,
    ) -> Result<WorkflowExecution, EngineError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        workflow.validate()?;
        self.resolve_blocks(&workflow)?;

        let execution = WorkflowExecution::new(
            workflow_id,
            options.user_id,
            input,
            options.metadata,
            self.clock.now(),
        );
        self.store.create_execution(&execution).await?;

        let mut request = EnqueueRequest::new(workflow_id, execution.id)
            .with_user(options.user_id)
            .with_priority(options.priority)
            .with_payload(serde_json::json!({"reason": "trigger"}));
        if let Some(at) = options.scheduled_for {
            request = request.scheduled_for(at);
        }
        self.queue.enqueue(request).await?;

        info!(execution_id = %execution.id, "execution triggered");
        Ok(execution)
    }

    pub async fn execution(&self, execution_id: Uuid) -> Result<WorkflowExecution, EngineError> {
        Ok(self.store.get_execution(execution_id).await?)
    }

    pub async fn nodes(&self, execution_id: Uuid) -> Result<Vec<NodeExecution>, EngineError> {
        self.store.get_execution(execution_id).await?;
        Ok(self.store.list_nodes(execution_id).await?)
    }

    /// Drive an execution as far as it can go right now
    ///
    /// Node failures are recorded on the nodes and the execution; an `Err`
    /// means the store could not be reached and the caller should retry the
    /// queue delivery later.
    #[instrument(skip(self))]
    pub async fn advance(
        &self,
        execution_id: Uuid,
        worker_id: &str,
    ) -> Result<AdvanceOutcome, EngineError> {
        let mut execution = self.store.get_execution(execution_id).await?;

        if execution.status == ExecutionStatus::Pending {
            let now = self.clock.now();
            let started = self
                .store
                .transition_execution(
                    execution_id,
                    &[ExecutionStatus::Pending],
                    ExecutionStatus::Running,
                    ExecutionUpdate::default()
                        .with_log(ExecutionLog::new(LogLevel::Info, "started", now)),
                    now,
                )
                .await?;
            execution = match started {
                Some(execution) => execution,
                None => self.store.get_execution(execution_id).await?,
            };
        }
        if let Some(outcome) = AdvanceOutcome::settled(execution.status) {
            debug!(status = %execution.status, "nothing to advance");
            return Ok(outcome);
        }

        let workflow = self.store.get_workflow(execution.workflow_id).await?;
        let blocks = match self.resolve_blocks(&workflow) {
            Ok(blocks) => blocks,
            Err(e) => {
                error!(error = %e, "workflow cannot run");
                self.fail_execution(execution_id, e.to_string()).await?;
                return Ok(AdvanceOutcome::Failed);
            }
        };

        self.store
            .set_execution_lock(execution_id, Some(worker_id), self.clock.now())
            .await?;
        let token = self.running.entry(execution_id).or_default().clone();

        let result = self.drive(&workflow, &blocks, execution_id, token).await;

        self.running.remove(&execution_id);
        self.store
            .set_execution_lock(execution_id, None, self.clock.now())
            .await?;

        let outcome = result?;
        debug!(?outcome, "advance finished");
        Ok(outcome)
    }

    /// Cancel an execution
    ///
    /// Open nodes become `cancelled`, active pauses are resolved, handlers
    /// running in this process observe their cancellation token, and the
    /// execution fails with a cancellation error.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        execution_id: Uuid,
        reason: &str,
    ) -> Result<WorkflowExecution, EngineError> {
        let execution = self.store.get_execution(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(EngineError::conflict(format!(
                "execution {execution_id} is already {}",
                execution.status
            )));
        }

        let now = self.clock.now();
        let error = format!("cancelled: {reason}");
        let update = ExecutionUpdate {
            cancelled_at: Some(now),
            ..Default::default()
        }
        .with_error(error.clone())
        .with_log(ExecutionLog::new(LogLevel::Warn, error, now));

        let cancelled = self
            .store
            .transition_execution(
                execution_id,
                &[
                    ExecutionStatus::Pending,
                    ExecutionStatus::Running,
                    ExecutionStatus::Paused,
                ],
                ExecutionStatus::Failed,
                update,
                now,
            )
            .await?
            .ok_or_else(|| {
                EngineError::conflict(format!("execution {execution_id} finished concurrently"))
            })?;

        let open = [NodeStatus::Pending, NodeStatus::Running, NodeStatus::Paused];
        for node in self.store.list_nodes(execution_id).await? {
            if open.contains(&node.status) {
                self.store
                    .transition_node(
                        execution_id,
                        &node.node_id,
                        &open,
                        NodeUpdate::status(NodeStatus::Cancelled).with_error("cancelled"),
                        now,
                    )
                    .await?;
            }
        }

        for pause in self.store.list_pauses(execution_id).await? {
            if pause.is_active() {
                self.store.resolve_pause(pause.id, None, now).await?;
            }
        }

        if let Some(token) = self.running.get(&execution_id) {
            token.cancel();
        }

        info!(reason, "execution cancelled");
        Ok(cancelled)
    }

    /// Give a failed node a fresh retry budget and run it again
    ///
    /// Reopens the execution if it had failed. Cancelled executions cannot
    /// be reopened.
    #[instrument(skip(self))]
    pub async fn retry_node(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<NodeExecution, EngineError> {
        let execution = self.store.get_execution(execution_id).await?;
        if execution.is_cancelled() {
            return Err(EngineError::conflict(format!(
                "execution {execution_id} was cancelled"
            )));
        }

        let not_found = || EngineError::NodeNotFound {
            execution_id,
            node_id: node_id.to_string(),
        };
        let workflow = self.store.get_workflow(execution.workflow_id).await?;
        workflow.node(node_id).ok_or_else(not_found)?;
        let node = self
            .store
            .get_node(execution_id, node_id)
            .await?
            .ok_or_else(not_found)?;

        if node.status != NodeStatus::Failed {
            return Err(EngineError::conflict(format!(
                "node {node_id} is {}, not failed",
                node.status
            )));
        }

        let now = self.clock.now();
        let node = self
            .store
            .transition_node(
                execution_id,
                node_id,
                &[NodeStatus::Failed],
                NodeUpdate::status(NodeStatus::Pending)
                    .clear_error()
                    .with_retry_count(0)
                    .with_deferral_count(0)
                    .with_not_before(None),
                now,
            )
            .await?
            .ok_or_else(|| EngineError::conflict(format!("node {node_id} changed concurrently")))?;

        let log = ExecutionLog::new(LogLevel::Info, "node retried by operator", now).for_node(node_id);
        if execution.status == ExecutionStatus::Failed {
            // Operator retry is the one way out of `failed`
            self.store
                .transition_execution(
                    execution_id,
                    &[ExecutionStatus::Failed],
                    ExecutionStatus::Running,
                    ExecutionUpdate::default().clearing_error().with_log(log),
                    now,
                )
                .await?;
        } else {
            self.store.append_execution_log(execution_id, log).await?;
        }

        self.queue
            .enqueue(
                EnqueueRequest::new(execution.workflow_id, execution_id)
                    .with_user(execution.user_id)
                    .with_payload(serde_json::json!({"reason": "retry", "node_id": node_id})),
            )
            .await?;

        info!(node_id, "node retry scheduled");
        Ok(node)
    }

    /// Resolve the handler of every node, failing on the first unknown type
    fn resolve_blocks(
        &self,
        workflow: &WorkflowDefinition,
    ) -> Result<HashMap<String, ResolvedBlock>, EngineError> {
        workflow
            .nodes
            .iter()
            .map(|node| {
                self.handlers
                    .resolve(node)
                    .map(|block| (node.id.clone(), block))
                    .ok_or_else(|| EngineError::UnknownBlockType {
                        node_id: node.id.clone(),
                        block_type: node.block_type.clone(),
                    })
            })
            .collect()
    }

    async fn drive(
        &self,
        workflow: &WorkflowDefinition,
        blocks: &HashMap<String, ResolvedBlock>,
        execution_id: Uuid,
        token: CancellationToken,
    ) -> Result<AdvanceOutcome, EngineError> {
        self.recover_orphaned_nodes(execution_id).await?;

        let order: Vec<String> = workflow
            .topological_order()?
            .into_iter()
            .map(String::from)
            .collect();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_nodes));
        let mut tasks: JoinSet<NodeTask> = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut failure: Option<EngineError> = None;

        loop {
            if failure.is_none() {
                match self.dispatchable(workflow, &order, &in_flight, execution_id).await {
                    Ok(Some((execution, runs))) => {
                        for (node_id, inputs, resume_data) in runs {
                            let (Some(node), Some(block)) =
                                (workflow.node(&node_id), blocks.get(&node_id))
                            else {
                                continue;
                            };

                            let run = NodeRun {
                                execution: execution.clone(),
                                node: node.clone(),
                                block: block.clone(),
                                inputs,
                                resume_data,
                                cancellation: token.child_token(),
                            };
                            let executor = self.executor.clone();
                            let semaphore = semaphore.clone();

                            debug!(%node_id, "dispatching node");
                            in_flight.insert(node_id.clone());
                            tasks.spawn(async move {
                                let _permit = semaphore.acquire_owned().await;
                                let outcome = executor.run(run).await;
                                (node_id, outcome)
                            });
                        }
                    }
                    Ok(None) => {}
                    Err(e) => failure = Some(e),
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            match joined {
                Ok((node_id, Ok(outcome))) => {
                    in_flight.remove(&node_id);
                    if let Err(e) = self.on_outcome(workflow, execution_id, &node_id, outcome).await {
                        failure.get_or_insert(e);
                    }
                }
                Ok((node_id, Err(e))) => {
                    in_flight.remove(&node_id);
                    error!(%node_id, error = %e, "node run failed");
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "node task aborted");
                    failure.get_or_insert(EngineError::Internal(format!("node task aborted: {e}")));
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        self.settle(workflow, execution_id).await
    }

    /// Nodes ready to run, or `None` when the execution no longer dispatches
    async fn dispatchable(
        &self,
        workflow: &WorkflowDefinition,
        order: &[String],
        in_flight: &HashSet<String>,
        execution_id: Uuid,
    ) -> Result<Option<(WorkflowExecution, Vec<(String, Value, Option<Value>)>)>, EngineError> {
        let execution = self.store.get_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Running {
            return Ok(None);
        }

        let nodes: HashMap<String, NodeExecution> = self
            .store
            .list_nodes(execution_id)
            .await?
            .into_iter()
            .map(|node| (node.node_id.clone(), node))
            .collect();
        let now = self.clock.now();
        let mut runs = Vec::new();

        for node_id in order {
            if in_flight.contains(node_id) {
                continue;
            }

            let predecessors = workflow.predecessors(node_id);
            let ready = predecessors.iter().all(|p| {
                nodes
                    .get(*p)
                    .is_some_and(|n| n.status == NodeStatus::Completed)
            });
            if !ready {
                continue;
            }

            let record = match nodes.get(node_id) {
                Some(record) => record.clone(),
                None => {
                    self.store
                        .get_or_create_node(execution_id, node_id, now)
                        .await?
                }
            };
            if !record.is_due(now) {
                continue;
            }

            let (inputs, resume_data) = match record.input_override {
                Some(inputs) => (inputs, Some(self.resume_data(execution_id, node_id).await?)),
                None if predecessors.is_empty() => (execution.input.clone(), None),
                None => {
                    let upstream = predecessors
                        .iter()
                        .map(|p| {
                            let output = nodes
                                .get(*p)
                                .and_then(|n| n.output.clone())
                                .unwrap_or(Value::Null);
                            (p.to_string(), output)
                        })
                        .collect::<serde_json::Map<_, _>>();
                    (Value::Object(upstream), None)
                }
            };
            runs.push((node_id.clone(), inputs, resume_data));
        }

        Ok(Some((execution, runs)))
    }

    /// Operator data from the most recent resolved pause of a node
    async fn resume_data(&self, execution_id: Uuid, node_id: &str) -> Result<Value, EngineError> {
        Ok(self
            .store
            .list_pauses(execution_id)
            .await?
            .into_iter()
            .rev()
            .find(|p| !p.is_active() && p.targets(Some(node_id)))
            .and_then(|p| p.resume_data)
            .unwrap_or(Value::Null))
    }

    async fn on_outcome(
        &self,
        workflow: &WorkflowDefinition,
        execution_id: Uuid,
        node_id: &str,
        outcome: NodeRunOutcome,
    ) -> Result<(), EngineError> {
        match outcome {
            NodeRunOutcome::Failed { error } => {
                let halted = workflow.dependents_of(node_id);
                warn!(node_id, %error, halted = halted.len(), "node failed permanently");

                let now = self.clock.now();
                let log = ExecutionLog::new(LogLevel::Error, format!("node failed: {error}"), now)
                    .for_node(node_id);
                self.store.append_execution_log(execution_id, log).await?;
            }
            NodeRunOutcome::Paused { reason } => {
                let execution = self.store.get_execution(execution_id).await?;
                self.pauses.pause(&execution, node_id, &reason).await?;
            }
            NodeRunOutcome::Retrying { retry_count, at } => {
                debug!(node_id, retry_count, %at, "node retry pending");
            }
            NodeRunOutcome::ShortCircuited { retry_at } => {
                debug!(node_id, %retry_at, "node deferred by circuit");
            }
            NodeRunOutcome::Sleeping { until } => {
                debug!(node_id, %until, "node sleeping");
            }
            NodeRunOutcome::Completed { .. }
            | NodeRunOutcome::Cancelled
            | NodeRunOutcome::NotClaimed => {}
        }
        Ok(())
    }

    /// Decide the execution's status once no node is in flight
    async fn settle(
        &self,
        workflow: &WorkflowDefinition,
        execution_id: Uuid,
    ) -> Result<AdvanceOutcome, EngineError> {
        let execution = self.store.get_execution(execution_id).await?;
        if let Some(outcome) = AdvanceOutcome::settled(execution.status) {
            return Ok(outcome);
        }

        let nodes: HashMap<String, NodeExecution> = self
            .store
            .list_nodes(execution_id)
            .await?
            .into_iter()
            .map(|node| (node.node_id.clone(), node))
            .collect();
        let now = self.clock.now();

        let all_completed = workflow.nodes.iter().all(|n| {
            nodes
                .get(&n.id)
                .is_some_and(|record| record.status == NodeStatus::Completed)
        });
        if all_completed {
            let output: serde_json::Map<String, Value> = workflow
                .sinks()
                .into_iter()
                .map(|id| {
                    let output = nodes
                        .get(id)
                        .and_then(|n| n.output.clone())
                        .unwrap_or(Value::Null);
                    (id.to_string(), output)
                })
                .collect();

            let completed = self
                .store
                .transition_execution(
                    execution_id,
                    &[ExecutionStatus::Running],
                    ExecutionStatus::Completed,
                    ExecutionUpdate::default()
                        .with_output(Value::Object(output))
                        .with_log(ExecutionLog::new(LogLevel::Info, "completed", now)),
                    now,
                )
                .await?;
            if completed.is_some() {
                info!("execution completed");
                return Ok(AdvanceOutcome::Completed);
            }
            return self.reload_outcome(execution_id).await;
        }

        let next_wake = nodes
            .values()
            .filter(|n| n.status == NodeStatus::Pending)
            .filter_map(|n| n.not_before)
            .filter(|at| *at > now)
            .min();
        if let Some(at) = next_wake {
            return Ok(AdvanceOutcome::WakeAt(at));
        }

        let failed = workflow
            .nodes
            .iter()
            .filter_map(|n| nodes.get(&n.id))
            .find(|n| n.status == NodeStatus::Failed);
        if let Some(node) = failed {
            let error = format!(
                "node {} failed: {}",
                node.node_id,
                node.error.as_deref().unwrap_or("unknown error")
            );
            self.fail_execution(execution_id, error).await?;
            return self.reload_outcome(execution_id).await;
        }

        // A node claimed by another worker is either finishing or stranded.
        // Come back when its claim lapses so a crashed holder is recovered.
        let lease = to_chrono(self.config.lease_duration);
        let claim_lapses = nodes
            .values()
            .filter(|n| n.status == NodeStatus::Running)
            .map(|n| n.started_at.unwrap_or(now) + lease)
            .min();
        if let Some(at) = claim_lapses {
            debug!(%at, "waiting on a node claimed elsewhere");
            return Ok(AdvanceOutcome::WakeAt(at));
        }

        debug!("execution idle");
        Ok(AdvanceOutcome::Idle)
    }

    async fn fail_execution(&self, execution_id: Uuid, error: String) -> Result<(), EngineError> {
        let now = self.clock.now();
        let failed = self
            .store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::Pending, ExecutionStatus::Running],
                ExecutionStatus::Failed,
                ExecutionUpdate::default()
                    .with_error(error.clone())
                    .with_log(ExecutionLog::new(LogLevel::Error, error.clone(), now)),
                now,
            )
            .await?;

        if failed.is_some() {
            warn!(%error, "execution failed");
        }
        Ok(())
    }

    async fn reload_outcome(&self, execution_id: Uuid) -> Result<AdvanceOutcome, EngineError> {
        let execution = self.store.get_execution(execution_id).await?;
        Ok(AdvanceOutcome::settled(execution.status).unwrap_or(AdvanceOutcome::Idle))
    }

    /// Return nodes stranded in `running` by a crashed worker to `pending`
    ///
    /// A node counts as stranded once it has been running for a full queue
    /// lease, which is when its delivery became visible again.
    async fn recover_orphaned_nodes(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let now = self.clock.now();
        let lease = to_chrono(self.config.lease_duration);

        for node in self.store.list_nodes(execution_id).await? {
            let stranded = node.status == NodeStatus::Running
                && node.started_at.is_some_and(|at| at + lease <= now);
            if !stranded {
                continue;
            }

            let recovered = self
                .store
                .transition_node(
                    execution_id,
                    &node.node_id,
                    &[NodeStatus::Running],
                    NodeUpdate::status(NodeStatus::Pending).with_not_before(None),
                    now,
                )
                .await?;
            if recovered.is_some() {
                warn!(node_id = %node.node_id, "recovered node stranded in running state");
            }
        }
        Ok(())
    }
}

//! Node executor
//!
//! Runs one node's block handler and persists everything it produced:
//! - Claims the node (`pending -> running` compare-and-set)
//! - Records the `NodeInput` snapshot
//! - Consults the node's circuit breaker, if any
//! - Invokes the handler with a cancellable `NodeContext`
//! - Applies the retry policy to failures before releasing the node

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::block::{BlockError, Extensions, NodeContext, NodeLogger, ResolvedBlock};
use crate::clock::{to_chrono, Clock};
use crate::error::EngineError;
use crate::model::{
    NodeDefinition, NodeExecution, NodeInput, NodeOutput, NodeStatus, NodeUpdate,
    WorkflowExecution,
};
use crate::persistence::ExecutionStore;
use crate::reliability::{CircuitBreakerError, CircuitBreakerRegistry, CircuitPermit, RetryDecision};

/// What happened to a node after one run
#[derive(Debug, Clone, PartialEq)]
pub enum NodeRunOutcome {
    /// Handler succeeded; the node is `completed`
    Completed { output: Value },

    /// Handler failed with budget left; the node is `pending` until `at`
    Retrying { retry_count: u32, at: DateTime<Utc> },

    /// Circuit was open; the node is `pending` until the breaker may probe
    ShortCircuited { retry_at: DateTime<Utc> },

    /// Handler asked to sleep; the node is `pending` until `until`
    Sleeping { until: DateTime<Utc> },

    /// The node is `failed` for good
    Failed { error: String },

    /// Handler needs operator input; the node is still `running`
    Paused { reason: String },

    /// The execution was cancelled while the node ran
    Cancelled,

    /// Another worker claimed the node first
    NotClaimed,
}

/// Everything needed to run one node once
pub struct NodeRun {
    pub execution: WorkflowExecution,
    pub node: NodeDefinition,
    pub block: ResolvedBlock,
    pub inputs: Value,
    pub resume_data: Option<Value>,
    pub cancellation: CancellationToken,
}

/// Runs block handlers for claimed nodes
pub struct NodeExecutor {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    breakers: Arc<CircuitBreakerRegistry>,
    extensions: Extensions,
}

impl NodeExecutor {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        clock: Arc<dyn Clock>,
        breakers: Arc<CircuitBreakerRegistry>,
        extensions: Extensions,
    ) -> Self {
        Self {
            store,
            clock,
            breakers,
            extensions,
        }
    }

    /// Run a node through its handler
    ///
    /// Node failures are reported through [`NodeRunOutcome`]; an `Err` means
    /// the store or the breaker could not be reached.
    #[instrument(skip(self, run), fields(execution_id = %run.execution.id, node_id = %run.node.id))]
    pub async fn run(&self, run: NodeRun) -> Result<NodeRunOutcome, EngineError> {
        let execution_id = run.execution.id;
        let node_id = run.node.id.as_str();

        let now = self.clock.now();
        let claimed = self
            .store
            .transition_node(
                execution_id,
                node_id,
                &[NodeStatus::Pending],
                NodeUpdate::status(NodeStatus::Running).with_started_at(now),
                now,
            )
            .await?;
        let Some(node) = claimed else {
            debug!("node already claimed");
            return Ok(NodeRunOutcome::NotClaimed);
        };

        self.store
            .record_node_input(NodeInput {
                execution_id,
                node_id: node_id.to_string(),
                data: run.inputs.clone(),
                created_at: now,
            })
            .await?;

        let logger = NodeLogger::new(execution_id, node_id, self.clock.clone());

        let permit = match &run.block.circuit_id {
            Some(circuit_id) => match self.breakers.acquire(circuit_id).await {
                Ok(permit) => Some(permit),
                Err(CircuitBreakerError::Open { retry_at, .. }) => {
                    logger.warn(format!("circuit {circuit_id} open until {retry_at}"));
                    self.flush_logs(&logger).await?;
                    return self.short_circuited(&run, &node, circuit_id, retry_at).await;
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        let ctx = NodeContext::new(
            execution_id,
            run.execution.workflow_id,
            node_id,
            run.node.block_type.clone(),
            run.inputs.clone(),
            run.node.config.clone(),
            logger.clone(),
            now,
        )
        .with_resume_data(run.resume_data.clone())
        .with_attempt(node.retry_count + 1)
        .with_scheduled_for(node.not_before)
        .with_cancellation(run.cancellation.clone())
        .with_extensions(self.extensions.clone());

        let result = tokio::select! {
            result = run.block.handler.execute(&ctx) => result,
            _ = run.cancellation.cancelled() => Err(BlockError::Cancelled),
        };

        if let Some(permit) = permit {
            report(permit, &result).await;
        }
        self.flush_logs(&logger).await?;

        match result {
            Ok(output) => self.completed(&run, output).await,
            Err(BlockError::AwaitingInput { reason }) => {
                info!(%reason, "node awaiting input");
                Ok(NodeRunOutcome::Paused { reason })
            }
            Err(BlockError::Sleep { until }) => self.sleeping(&run, until).await,
            Err(BlockError::Cancelled) => {
                self.release(&run, NodeUpdate::status(NodeStatus::Cancelled).with_error("cancelled"))
                    .await?;
                Ok(NodeRunOutcome::Cancelled)
            }
            Err(err) => {
                let retryable = err.is_retryable();
                self.failed(&run, &node, err.to_string(), retryable).await
            }
        }
    }

    async fn completed(&self, run: &NodeRun, output: Value) -> Result<NodeRunOutcome, EngineError> {
        let now = self.clock.now();
        let update = NodeUpdate::status(NodeStatus::Completed)
            .with_output(output.clone())
            .clear_error()
            .with_not_before(None)
            .with_input_override(None)
            .with_completed_at(now);

        if !self.release(run, update).await? {
            return Ok(NodeRunOutcome::Cancelled);
        }

        self.store
            .record_node_output(NodeOutput {
                execution_id: run.execution.id,
                node_id: run.node.id.clone(),
                data: output.clone(),
                created_at: now,
            })
            .await?;

        debug!("node completed");
        Ok(NodeRunOutcome::Completed { output })
    }

    async fn failed(
        &self,
        run: &NodeRun,
        node: &NodeExecution,
        error: String,
        retryable: bool,
    ) -> Result<NodeRunOutcome, EngineError> {
        let now = self.clock.now();

        match run.block.retry_policy.decide(node.retry_count, retryable) {
            RetryDecision::Retry { retry_count, delay } => {
                let at = now + to_chrono(delay);
                let update = NodeUpdate::status(NodeStatus::Pending)
                    .with_error(error.clone())
                    .with_retry_count(retry_count)
                    .with_not_before(Some(at));
                if !self.release(run, update).await? {
                    return Ok(NodeRunOutcome::Cancelled);
                }

                warn!(%error, retry_count, %at, "node failed, retry scheduled");
                Ok(NodeRunOutcome::Retrying { retry_count, at })
            }
            RetryDecision::GiveUp => {
                let update = NodeUpdate::status(NodeStatus::Failed)
                    .with_error(error.clone())
                    .with_not_before(None);
                if !self.release(run, update).await? {
                    return Ok(NodeRunOutcome::Cancelled);
                }

                warn!(%error, retry_count = node.retry_count, retryable, "node failed");
                Ok(NodeRunOutcome::Failed { error })
            }
        }
    }

    /// Defer the node to the breaker's re-open time without consuming a retry
    ///
    /// Once the node has used up its deferrals the short-circuit counts as a
    /// transient failure.
    async fn short_circuited(
        &self,
        run: &NodeRun,
        node: &NodeExecution,
        circuit_id: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<NodeRunOutcome, EngineError> {
        let error = format!("circuit {circuit_id} is open");

        if !run.block.retry_policy.can_defer(node.deferral_count) {
            return self.failed(run, node, error, true).await;
        }

        let update = NodeUpdate::status(NodeStatus::Pending)
            .with_error(error)
            .with_deferral_count(node.deferral_count + 1)
            .with_not_before(Some(retry_at));
        if !self.release(run, update).await? {
            return Ok(NodeRunOutcome::Cancelled);
        }

        debug!(circuit_id, %retry_at, "node deferred by open circuit");
        Ok(NodeRunOutcome::ShortCircuited { retry_at })
    }

    /// Hold the node back until `until` without consuming a retry
    async fn sleeping(&self, run: &NodeRun, until: DateTime<Utc>) -> Result<NodeRunOutcome, EngineError> {
        let update = NodeUpdate::status(NodeStatus::Pending).with_not_before(Some(until));
        if !self.release(run, update).await? {
            return Ok(NodeRunOutcome::Cancelled);
        }

        debug!(%until, "node sleeping");
        Ok(NodeRunOutcome::Sleeping { until })
    }

    /// Apply `update` to the running node; `false` if it is no longer running
    async fn release(&self, run: &NodeRun, update: NodeUpdate) -> Result<bool, EngineError> {
        let released = self
            .store
            .transition_node(
                run.execution.id,
                &run.node.id,
                &[NodeStatus::Running],
                update,
                self.clock.now(),
            )
            .await?;

        if released.is_none() {
            debug!("node left running state while its handler ran");
        }
        Ok(released.is_some())
    }

    async fn flush_logs(&self, logger: &NodeLogger) -> Result<(), EngineError> {
        let lines = logger.drain();
        if !lines.is_empty() {
            self.store.append_node_logs(lines).await?;
        }
        Ok(())
    }
}

/// Report a handler result to its circuit
///
/// Only retryable errors count against the circuit; a terminal error or a
/// pause means the service answered. Breaker write failures are logged,
/// never fatal to the node.
async fn report(permit: CircuitPermit<'_>, result: &Result<Value, BlockError>) {
    let circuit_id = permit.circuit_id().to_string();
    let reported = match result {
        Err(BlockError::Cancelled) => return,
        Err(err) if err.is_retryable() => permit.failure().await,
        _ => permit.success().await,
    };

    if let Err(e) = reported {
        warn!(%circuit_id, error = %e, "failed to record circuit outcome");
    }
}

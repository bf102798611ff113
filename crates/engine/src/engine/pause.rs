//! Pause/resume manager
//!
//! A node pause is created when a handler returns
//! [`BlockError::AwaitingInput`](crate::block::BlockError::AwaitingInput);
//! an execution pause is an operator action. Either way the execution stops
//! dispatching nodes until every active pause is resolved.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::model::{
    ExecutionLog, ExecutionStatus, ExecutionUpdate, LogLevel, NodeInput, NodeStatus, NodeUpdate,
    WorkflowExecution, WorkflowPause,
};
use crate::persistence::ExecutionStore;
use crate::queue::{EnqueueRequest, ExecutionQueue};

/// Result of a resume request
#[derive(Debug, Clone)]
pub enum ResumeOutcome {
    /// The pause was resolved and the execution re-enqueued
    Resumed(WorkflowExecution),

    /// The pause had already been resolved; nothing changed
    AlreadyResumed(WorkflowExecution),
}

impl ResumeOutcome {
    pub fn execution(&self) -> &WorkflowExecution {
        match self {
            Self::Resumed(execution) | Self::AlreadyResumed(execution) => execution,
        }
    }
}

/// Suspends executions and re-injects operator-edited data
pub struct PauseManager {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    queue: Arc<ExecutionQueue>,
}

impl PauseManager {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        clock: Arc<dyn Clock>,
        queue: Arc<ExecutionQueue>,
    ) -> Self {
        Self {
            store,
            clock,
            queue,
        }
    }

    /// Pause a node that is waiting for input, and its execution with it
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    pub async fn pause(
        &self,
        execution: &WorkflowExecution,
        node_id: &str,
        reason: &str,
    ) -> Result<WorkflowPause, EngineError> {
        let now = self.clock.now();
        let pause = WorkflowPause::new(
            execution.workflow_id,
            execution.id,
            Some(node_id.to_string()),
            reason,
            now,
        );
        self.store.create_pause(&pause).await?;

        self.store
            .transition_node(
                execution.id,
                node_id,
                &[NodeStatus::Running],
                NodeUpdate::status(NodeStatus::Paused),
                now,
            )
            .await?;

        let log = ExecutionLog::new(LogLevel::Info, format!("paused: {reason}"), now)
            .for_node(node_id);
        let paused = self
            .store
            .transition_execution(
                execution.id,
                &[ExecutionStatus::Running],
                ExecutionStatus::Paused,
                ExecutionUpdate::default().with_log(log.clone()),
                now,
            )
            .await?;
        if paused.is_none() {
            // Already paused by another node or an operator
            self.store.append_execution_log(execution.id, log).await?;
        }

        info!(node_id, reason, "node paused");
        Ok(pause)
    }

    /// Operator pause of a running execution
    ///
    /// Nodes already dispatched finish; no new nodes start until resumed.
    #[instrument(skip(self))]
    pub async fn pause_execution(
        &self,
        execution_id: Uuid,
        reason: &str,
    ) -> Result<WorkflowExecution, EngineError> {
        let execution = self.store.get_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Running {
            return Err(EngineError::conflict(format!(
                "execution {execution_id} is {}, not running",
                execution.status
            )));
        }

        let now = self.clock.now();
        let pause = WorkflowPause::new(execution.workflow_id, execution_id, None, reason, now);
        self.store.create_pause(&pause).await?;

        let log = ExecutionLog::new(LogLevel::Info, format!("paused by operator: {reason}"), now);
        let paused = self
            .store
            .transition_execution(
                execution_id,
                &[ExecutionStatus::Running],
                ExecutionStatus::Paused,
                ExecutionUpdate::default().with_log(log),
                now,
            )
            .await?;

        match paused {
            Some(execution) => {
                info!("execution paused by operator");
                Ok(execution)
            }
            None => {
                self.store.resolve_pause(pause.id, None, now).await?;
                Err(EngineError::conflict(format!(
                    "execution {execution_id} left running state"
                )))
            }
        }
    }

    /// Last input the node was invoked with, used to seed the resume form
    pub async fn snapshot(&self, execution_id: Uuid, node_id: &str) -> Result<NodeInput, EngineError> {
        self.store.get_execution(execution_id).await?;
        self.store
            .latest_node_input(execution_id, node_id)
            .await?
            .ok_or_else(|| EngineError::NodeNotFound {
                execution_id,
                node_id: node_id.to_string(),
            })
    }

    /// Resolve a pause and continue the execution
    ///
    /// `resume_data` must be a JSON object or null. For a node pause it is
    /// shallow-merged over the node's last input, and the node runs again
    /// with the merged value. Without `node_id` the execution-level pause is
    /// targeted, or the only active pause if there is exactly one.
    #[instrument(skip(self, resume_data))]
    pub async fn resume(
        &self,
        execution_id: Uuid,
        node_id: Option<&str>,
        resume_data: Option<Value>,
    ) -> Result<ResumeOutcome, EngineError> {
        let resume_data = match resume_data {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(Value::Object(map)),
            Some(other) => {
                return Err(EngineError::InvalidResumeData(format!(
                    "expected an object or null, got {}",
                    json_kind(&other)
                )))
            }
        };

        let execution = self.store.get_execution(execution_id).await?;
        let pauses = self.store.list_pauses(execution_id).await?;

        let Some(pause) = select_pause(&pauses, node_id) else {
            let resolved_before = pauses
                .iter()
                .any(|p| !p.is_active() && (node_id.is_none() || p.targets(node_id)));
            if resolved_before && !execution.status.is_terminal() {
                debug!("pause already resolved");
                return Ok(ResumeOutcome::AlreadyResumed(execution));
            }
            return Err(EngineError::PauseNotFound { execution_id });
        };

        let now = self.clock.now();
        if !self
            .store
            .resolve_pause(pause.id, resume_data.clone(), now)
            .await?
        {
            debug!(pause_id = %pause.id, "pause resolved concurrently");
            let execution = self.store.get_execution(execution_id).await?;
            return Ok(ResumeOutcome::AlreadyResumed(execution));
        }

        if let Some(node_id) = pause.node_id.as_deref() {
            let last_input = self
                .store
                .latest_node_input(execution_id, node_id)
                .await?
                .map(|input| input.data)
                .unwrap_or(Value::Null);
            let merged = merge_resume_data(last_input, resume_data);

            self.store
                .transition_node(
                    execution_id,
                    node_id,
                    &[NodeStatus::Paused],
                    NodeUpdate::status(NodeStatus::Pending)
                        .with_input_override(Some(merged))
                        .with_not_before(None),
                    now,
                )
                .await?;
        }

        // Re-read after resolving: of two concurrent resumes, the later one
        // sees both pauses resolved and moves the execution on
        let still_paused = self
            .store
            .list_pauses(execution_id)
            .await?
            .iter()
            .any(WorkflowPause::is_active);
        let execution = if still_paused {
            debug!("other pauses still active");
            self.store.get_execution(execution_id).await?
        } else {
            let log = ExecutionLog::new(LogLevel::Info, "resumed", now);
            let log = match &pause.node_id {
                Some(node_id) => log.for_node(node_id.clone()),
                None => log,
            };
            let resumed = self
                .store
                .transition_execution(
                    execution_id,
                    &[ExecutionStatus::Paused],
                    ExecutionStatus::Running,
                    ExecutionUpdate::default().with_log(log),
                    now,
                )
                .await?;

            match resumed {
                Some(execution) => {
                    self.queue
                        .enqueue(
                            EnqueueRequest::new(execution.workflow_id, execution_id)
                                .with_user(execution.user_id)
                                .with_payload(serde_json::json!({"reason": "resume"})),
                        )
                        .await?;
                    execution
                }
                None => self.store.get_execution(execution_id).await?,
            }
        };

        info!(pause_id = %pause.id, node_id = ?pause.node_id, "resumed");
        Ok(ResumeOutcome::Resumed(execution))
    }
}

/// Pick the active pause a resume request refers to
fn select_pause<'a>(pauses: &'a [WorkflowPause], node_id: Option<&str>) -> Option<&'a WorkflowPause> {
    let mut active = pauses.iter().filter(|p| p.is_active());
    match node_id {
        Some(_) => active.find(|p| p.targets(node_id)),
        None => {
            let active: Vec<_> = active.collect();
            active
                .iter()
                .copied()
                .find(|p| p.targets(None))
                .or_else(|| (active.len() == 1).then(|| active[0]))
        }
    }
}

/// Shallow-merge operator data over the node's last input
fn merge_resume_data(last_input: Value, resume_data: Option<Value>) -> Value {
    match (last_input, resume_data) {
        (input, None) => input,
        (Value::Object(mut input), Some(Value::Object(data))) => {
            input.extend(data);
            Value::Object(input)
        }
        (_, Some(data)) => data,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_resume_data() {
        assert_eq!(
            merge_resume_data(json!({"amount": 10, "to": "a"}), Some(json!({"amount": 12}))),
            json!({"amount": 12, "to": "a"})
        );
        assert_eq!(merge_resume_data(json!({"a": 1}), None), json!({"a": 1}));
        assert_eq!(merge_resume_data(json!(5), Some(json!({"a": 1}))), json!({"a": 1}));
    }

    #[test]
    fn test_select_pause_prefers_execution_level() {
        let now = chrono::Utc::now();
        let (wf, exec) = (Uuid::now_v7(), Uuid::now_v7());
        let node = WorkflowPause::new(wf, exec, Some("approve".into()), "manual", now);
        let operator = WorkflowPause::new(wf, exec, None, "maintenance", now);

        let pauses = vec![node.clone()];
        assert_eq!(select_pause(&pauses, None).map(|p| p.id), Some(node.id));
        assert_eq!(select_pause(&pauses, Some("approve")).map(|p| p.id), Some(node.id));
        assert!(select_pause(&pauses, Some("other")).is_none());

        let pauses = vec![node.clone(), operator.clone()];
        assert_eq!(select_pause(&pauses, None).map(|p| p.id), Some(operator.id));
    }

    #[test]
    fn test_json_kind() {
        assert_eq!(json_kind(&json!([1])), "an array");
        assert_eq!(json_kind(&json!("x")), "a string");
    }
}

//! Workflow execution records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Lifecycle of one workflow run
///
/// ```text
/// pending ──► running ──► completed
///                │  ▲
///                │  └──── paused (resume)
///                ├──────► paused
///                └──────► failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, waiting for a worker
    Pending,

    /// A worker is walking the graph
    Running,

    /// Every node completed
    Completed,

    /// A node failed permanently or the run was cancelled
    Failed,

    /// Suspended until resumed by an operator
    Paused,
}

impl ExecutionStatus {
    /// Whether no further transition is allowed by the state machine
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Monotonic transition check; `paused -> running` is the only backward edge
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Paused, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Severity of a log line attached to an execution or node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Entry of the log array embedded in an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct ExecutionLog {
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl ExecutionLog {
    pub fn new(level: LogLevel, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            level,
            message: message.into(),
            node_id: None,
            at,
        }
    }

    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

/// One run of a workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub user_id: Option<Uuid>,
    pub status: ExecutionStatus,
    /// Trigger input, never modified after creation
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Worker currently driving this execution
    pub locked_by: Option<String>,
    #[serde(default)]
    pub logs: Vec<ExecutionLog>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// Build a fresh `pending` execution
    pub fn new(
        workflow_id: Uuid,
        user_id: Option<Uuid>,
        input: serde_json::Value,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            user_id,
            status: ExecutionStatus::Pending,
            input,
            output: None,
            error: None,
            metadata,
            locked_by: None,
            logs: vec![],
            created_at: now,
            started_at: None,
            finished_at: None,
            cancelled_at: None,
            updated_at: now,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }
}

/// Field changes applied together with a status transition
#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Clear a previously recorded error (operator retry)
    pub clear_error: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub log: Option<ExecutionLog>,
}

impl ExecutionUpdate {
    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_log(mut self, log: ExecutionLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn clearing_error(mut self) -> Self {
        self.clear_error = true;
        self
    }

    /// Apply a transition to `to` plus these changes to an execution record
    ///
    /// `started_at` is set on the first entry into `running`; `finished_at`
    /// tracks whether the status is terminal.
    pub fn apply(self, execution: &mut WorkflowExecution, to: ExecutionStatus, now: DateTime<Utc>) {
        execution.status = to;
        if to == ExecutionStatus::Running && execution.started_at.is_none() {
            execution.started_at = Some(now);
        }
        execution.finished_at = to.is_terminal().then_some(now);

        if let Some(output) = self.output {
            execution.output = Some(output);
        }
        if self.clear_error {
            execution.error = None;
        }
        if let Some(error) = self.error {
            execution.error = Some(error);
        }
        if let Some(at) = self.cancelled_at {
            execution.cancelled_at = Some(at);
        }
        if let Some(log) = self.log {
            execution.logs.push(log);
        }
        execution.updated_at = now;
    }
}

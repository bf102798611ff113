//! Per-node execution records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use super::execution::LogLevel;

/// Status of one node within one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
    Cancelled,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

/// One node's execution within a workflow execution
///
/// `(execution_id, node_id)` is unique: a retry updates this record in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct NodeExecution {
    pub execution_id: Uuid,
    pub node_id: String,
    pub status: NodeStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Business retries consumed so far
    pub retry_count: u32,
    /// Circuit short-circuits absorbed without consuming retry budget
    pub deferral_count: u32,
    /// Earliest instant the next attempt may be dispatched
    pub not_before: Option<DateTime<Utc>>,
    /// Input merged with operator resume data, used on the next run
    pub input_override: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl NodeExecution {
    pub fn new(execution_id: Uuid, node_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            status: NodeStatus::Pending,
            output: None,
            error: None,
            retry_count: 0,
            deferral_count: 0,
            not_before: None,
            input_override: None,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Whether a pending node may be dispatched at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == NodeStatus::Pending && self.not_before.map_or(true, |at| at <= now)
    }
}

/// Changes applied to a node together with a status compare-and-set
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub status: Option<NodeStatus>,
    pub output: Option<serde_json::Value>,
    pub error: Option<Option<String>>,
    pub retry_count: Option<u32>,
    pub deferral_count: Option<u32>,
    pub not_before: Option<Option<DateTime<Utc>>>,
    pub input_override: Option<Option<serde_json::Value>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeUpdate {
    pub fn status(status: NodeStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn with_deferral_count(mut self, count: u32) -> Self {
        self.deferral_count = Some(count);
        self
    }

    pub fn with_not_before(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn with_input_override(mut self, input: Option<serde_json::Value>) -> Self {
        self.input_override = Some(input);
        self
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    /// Apply this update to an in-memory record
    pub fn apply(&self, node: &mut NodeExecution, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            node.status = status;
        }
        if let Some(output) = &self.output {
            node.output = Some(output.clone());
        }
        if let Some(error) = &self.error {
            node.error = error.clone();
        }
        if let Some(count) = self.retry_count {
            node.retry_count = count;
        }
        if let Some(count) = self.deferral_count {
            node.deferral_count = count;
        }
        if let Some(at) = self.not_before {
            node.not_before = at;
        }
        if let Some(input) = &self.input_override {
            node.input_override = input.clone();
        }
        if let Some(at) = self.started_at {
            node.started_at = Some(at);
        }
        if let Some(at) = self.completed_at {
            node.completed_at = Some(at);
        }
        node.updated_at = now;
    }
}

/// Immutable snapshot of the data a node consumed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct NodeInput {
    pub execution_id: Uuid,
    pub node_id: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Immutable snapshot of the data a node produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct NodeOutput {
    pub execution_id: Uuid,
    pub node_id: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only log line written by a block handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct NodeLog {
    pub execution_id: Uuid,
    pub node_id: String,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

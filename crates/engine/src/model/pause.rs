//! Pause records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// A suspension of an execution, optionally scoped to one node
///
/// A record without `node_id` is an operator pause of the whole execution.
/// Records are resolved, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct WorkflowPause {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub node_id: Option<String>,
    pub reason: String,
    pub resume_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl WorkflowPause {
    pub fn new(
        workflow_id: Uuid,
        execution_id: Uuid,
        node_id: Option<String>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            execution_id,
            node_id,
            reason: reason.into(),
            resume_data: None,
            created_at: now,
            resolved_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Whether this record pauses `node_id` (`None` matches execution-level pauses)
    pub fn targets(&self, node_id: Option<&str>) -> bool {
        self.node_id.as_deref() == node_id
    }
}

//! Engine error type

use uuid::Uuid;

use crate::model::{BlockType, GraphError};
use crate::persistence::StoreError;
use crate::queue::QueueError;
use crate::reliability::CircuitBreakerError;

/// Errors from engine operations
///
/// Node failures are not errors at this level: they are persisted on the
/// node record. `EngineError` covers missing records, rejected operator
/// actions and infrastructure failures.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("node {node_id} not found in execution {execution_id}")]
    NodeNotFound { execution_id: Uuid, node_id: String },

    /// No active pause matches the resume request
    #[error("no pause record for execution {execution_id}")]
    PauseNotFound { execution_id: Uuid },

    #[error("queue item not found: {0}")]
    QueueItemNotFound(Uuid),

    /// The operation is not allowed in the record's current state
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid resume data: {0}")]
    InvalidResumeData(String),

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(#[from] GraphError),

    #[error("no handler registered for block type {block_type} (node {node_id})")]
    UnknownBlockType { node_id: String, block_type: BlockType },

    #[error("store error: {0}")]
    Store(StoreError),

    /// A node task ended without reporting an outcome
    #[error("internal error: {0}")]
    Internal(String),

    #[error("circuit breaker error: {0}")]
    Circuit(#[from] CircuitBreakerError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WorkflowNotFound(id) => Self::WorkflowNotFound(id),
            StoreError::ExecutionNotFound(id) => Self::ExecutionNotFound(id),
            StoreError::QueueItemNotFound(id) => Self::QueueItemNotFound(id),
            other => Self::Store(other),
        }
    }
}

impl From<QueueError> for EngineError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(id) => Self::QueueItemNotFound(id),
            QueueError::Store(e) => e.into(),
            other => Self::Conflict(other.to_string()),
        }
    }
}

impl EngineError {
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Whether the error names a record that does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::WorkflowNotFound(_)
                | Self::ExecutionNotFound(_)
                | Self::NodeNotFound { .. }
                | Self::PauseNotFound { .. }
                | Self::QueueItemNotFound(_)
        )
    }
}

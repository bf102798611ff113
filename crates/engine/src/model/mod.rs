//! Records persisted and exchanged by the engine

mod circuit;
mod execution;
mod graph;
mod node;
mod pause;
mod queue;

pub use circuit::{CircuitRecord, CircuitState};
pub use execution::{ExecutionLog, ExecutionStatus, ExecutionUpdate, LogLevel, WorkflowExecution};
pub use graph::{BlockType, Edge, GraphError, NodeDefinition, WorkflowDefinition};
pub use node::{NodeExecution, NodeInput, NodeLog, NodeOutput, NodeStatus, NodeUpdate};
pub use pause::WorkflowPause;
pub use queue::{NewQueueItem, QueueFailOutcome, QueueItem, QueueStatus};

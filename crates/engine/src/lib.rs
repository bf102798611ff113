//! # Blockflow Engine
//!
//! A store-backed orchestration engine for workflows expressed as directed
//! acyclic graphs of blocks.
//!
//! ## Features
//!
//! - **Execution queue**: Lease-based delivery with priorities, delayed items and dead letters
//! - **Graph walking**: Nodes run as soon as their predecessors complete, with bounded parallelism
//! - **Pause and resume**: Blocks may wait for operator input; snapshots expose what they saw
//! - **Automatic retries**: Per-node retry policies with exponential backoff and jitter
//! - **Circuit breakers**: Shared per-circuit state protects flaky external services
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                           │
//! │  (leases queue items, advances executions, settles leases)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       StateMachine                          │
//! │  (execution lifecycle, dispatch of ready nodes, settling)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          NodeExecutor / PauseManager / breakers             │
//! │  (claim, run handler, release with retry decision)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutionStore                         │
//! │  (PostgreSQL in production, in-memory for tests)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use blockflow_engine::prelude::*;
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl BlockHandler for SendEmail {
//!     async fn execute(&self, ctx: &NodeContext) -> Result<Value, BlockError> {
//!         let to = ctx.config_str("to")?;
//!         // ... talk to the mail provider
//!         Ok(json!({ "sent": to }))
//!     }
//! }
//!
//! let mut handlers = HandlerRegistry::with_builtins();
//! handlers.register(
//!     BlockType::Email,
//!     BlockRegistration::new(SendEmail).with_circuit("smtp"),
//! );
//!
//! let engine = Engine::builder(store).with_handlers(handlers).build();
//! WorkerPool::new(engine, WorkerPoolConfig::from_engine(&config)).start()?;
//! ```

pub mod block;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod persistence;
pub mod queue;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::block::{BlockError, BlockHandler, BlockRegistration, HandlerRegistry, NodeContext};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::EngineConfig;
    pub use crate::engine::{AdvanceOutcome, Engine, ResumeOutcome, StateMachine, TriggerOptions};
    pub use crate::error::EngineError;
    pub use crate::model::{
        BlockType, Edge, ExecutionStatus, NodeDefinition, NodeStatus, WorkflowDefinition,
        WorkflowExecution,
    };
    pub use crate::persistence::{
        ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore, StoreError,
    };
    pub use crate::queue::{EnqueueRequest, ExecutionQueue};
    pub use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
}

// Re-export key types at crate root
pub use block::{BlockError, BlockHandler, BlockRegistration, HandlerRegistry, NodeContext};
pub use config::EngineConfig;
pub use engine::{AdvanceOutcome, Engine, ResumeOutcome, StateMachine, TriggerOptions};
pub use error::EngineError;
pub use persistence::{ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore, StoreError};
pub use queue::{EnqueueRequest, ExecutionQueue, QueueError};
pub use reliability::{CircuitBreakerConfig, RetryPolicy};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};

//! Worker pool for queue processing
//!
//! This module provides:
//! - [`WorkerPool`] - Concurrent queue consumers with graceful shutdown
//! - [`QueuePoller`] - Leasing with exponential backoff while idle
//! - [`process_item`] - Advance one leased execution and settle its lease
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                            │
//! │  ┌─────────────┐                                            │
//! │  │ QueuePoller │──lease──► ExecutionQueue                   │
//! │  └──────┬──────┘                                            │
//! │         ▼                                                   │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │      process_item (Semaphore-limited)               │    │
//! │  │  advance ─► complete | re-enqueue at wake | fail    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod poller;
mod pool;

pub use poller::{PollerConfig, QueuePoller};
pub use pool::{
    process_item, Delivery, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus,
};

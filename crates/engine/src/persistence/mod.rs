//! Persistence layer
//!
//! This module provides:
//! - [`ExecutionStore`] trait for all engine state
//! - [`InMemoryExecutionStore`] for tests and local runs
//! - [`PostgresExecutionStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryExecutionStore;
pub use postgres::PostgresExecutionStore;
pub use store::{ExecutionStore, StoreError};

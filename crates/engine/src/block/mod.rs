//! Block handlers: the pluggable work behind workflow nodes
//!
//! This module provides:
//! - [`BlockHandler`] trait for implementing node work
//! - [`NodeContext`] passed to every invocation
//! - [`HandlerRegistry`] mapping block types to handlers

mod builtin;
mod context;
mod handler;
mod registry;

pub use builtin::{DelayHandler, ManualApprovalHandler, TransformHandler};
pub use context::{Extensions, NodeContext, NodeLogger};
pub use handler::{BlockError, BlockHandler};
pub use registry::{BlockRegistration, HandlerRegistry, ResolvedBlock};

//! Block handler registry
//!
//! Maps a [`BlockType`] to the handler that runs it, together with the retry
//! policy and circuit that apply to every node of that type. Node
//! definitions may override both.

use std::collections::HashMap;
use std::sync::Arc;

use super::builtin::{DelayHandler, ManualApprovalHandler, TransformHandler};
use super::{BlockHandler, Extensions};
use crate::model::{BlockType, NodeDefinition};
use crate::reliability::RetryPolicy;

/// How one block type is executed
#[derive(Clone)]
pub struct BlockRegistration {
    pub handler: Arc<dyn BlockHandler>,
    pub retry_policy: RetryPolicy,
    pub circuit_id: Option<String>,
}

impl BlockRegistration {
    pub fn new(handler: impl BlockHandler) -> Self {
        Self {
            handler: Arc::new(handler),
            retry_policy: RetryPolicy::default(),
            circuit_id: None,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Protect every call of this block type with a circuit breaker
    pub fn with_circuit(mut self, circuit_id: impl Into<String>) -> Self {
        self.circuit_id = Some(circuit_id.into());
        self
    }
}

/// The handler, policy and circuit resolved for one node
#[derive(Clone)]
pub struct ResolvedBlock {
    pub handler: Arc<dyn BlockHandler>,
    pub retry_policy: RetryPolicy,
    pub circuit_id: Option<String>,
}

/// Registry of block handlers keyed by block type
///
/// # Example
///
/// ```ignore
/// let mut registry = HandlerRegistry::with_builtins();
/// registry.register(
///     BlockType::Email,
///     BlockRegistration::new(SendEmail::new(smtp))
///         .with_retry_policy(RetryPolicy::exponential().with_max_retries(5))
///         .with_circuit("smtp"),
/// );
/// ```
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    blocks: HashMap<BlockType, BlockRegistration>,
    extensions: Extensions,
}

impl HandlerRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the handlers the engine ships
    ///
    /// `transform` reshapes its input, `delay` holds it back for a fixed
    /// time, and `manual_approval` pauses until an operator resumes it.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            BlockType::Transform,
            BlockRegistration::new(TransformHandler).with_retry_policy(RetryPolicy::no_retry()),
        );
        registry.register(
            BlockType::Delay,
            BlockRegistration::new(DelayHandler).with_retry_policy(RetryPolicy::no_retry()),
        );
        registry.register(
            BlockType::ManualApproval,
            BlockRegistration::new(ManualApprovalHandler)
                .with_retry_policy(RetryPolicy::no_retry()),
        );
        registry
    }

    /// Register or replace the handler for a block type
    pub fn register(&mut self, block_type: BlockType, registration: BlockRegistration) {
        self.blocks.insert(block_type, registration);
    }

    /// Make a service available to every handler through its context
    pub fn insert_extension<T: Send + Sync + 'static>(&mut self, value: T) {
        self.extensions.insert(value);
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Check if a block type is registered
    pub fn contains(&self, block_type: &BlockType) -> bool {
        self.blocks.contains_key(block_type)
    }

    /// Get all registered block types
    pub fn block_types(&self) -> Vec<&BlockType> {
        self.blocks.keys().collect()
    }

    /// Resolve the handler for a node, applying its overrides
    pub fn resolve(&self, node: &NodeDefinition) -> Option<ResolvedBlock> {
        let registration = self.blocks.get(&node.block_type)?;
        Some(ResolvedBlock {
            handler: registration.handler.clone(),
            retry_policy: node
                .retry_policy
                .clone()
                .unwrap_or_else(|| registration.retry_policy.clone()),
            circuit_id: node
                .circuit_id
                .clone()
                .or_else(|| registration.circuit_id.clone()),
        })
    }
}

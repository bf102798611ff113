//! Node execution context

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::BlockError;
use crate::clock::Clock;
use crate::model::{BlockType, LogLevel, NodeLog};

/// Typed map of services shared with block handlers
///
/// Handlers look up their clients (HTTP, SMTP, RPC) by type instead of
/// digging through an untyped JSON bag.
#[derive(Clone, Default)]
pub struct Extensions {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a service, replacing any previous value of the same type
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.map
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

/// Collects a handler's log lines for persistence as `NodeLog` records
///
/// Lines are also emitted as `tracing` events so they show up in process
/// logs while the node runs.
#[derive(Clone)]
pub struct NodeLogger {
    execution_id: Uuid,
    node_id: String,
    clock: Arc<dyn Clock>,
    lines: Arc<Mutex<Vec<NodeLog>>>,
}

impl NodeLogger {
    pub fn new(execution_id: Uuid, node_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            clock,
            lines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(LogLevel::Error, message.into());
    }

    /// Take every line collected so far
    pub fn drain(&self) -> Vec<NodeLog> {
        std::mem::take(&mut *self.lines.lock())
    }

    fn push(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => {
                tracing::info!(execution_id = %self.execution_id, node_id = %self.node_id, "{message}")
            }
            LogLevel::Warn => {
                tracing::warn!(execution_id = %self.execution_id, node_id = %self.node_id, "{message}")
            }
            LogLevel::Error => {
                tracing::error!(execution_id = %self.execution_id, node_id = %self.node_id, "{message}")
            }
        }

        self.lines.lock().push(NodeLog {
            execution_id: self.execution_id,
            node_id: self.node_id.clone(),
            level,
            message,
            created_at: self.clock.now(),
        });
    }
}

/// Everything a block handler gets to see for one node invocation
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &NodeContext) -> Result<Value, BlockError> {
///     ctx.logger().info(format!("attempt {}", ctx.attempt));
///     if ctx.is_cancelled() {
///         return Err(BlockError::Cancelled);
///     }
///     let client = ctx.extension::<HttpClient>()
///         .ok_or_else(|| BlockError::terminal("http client not configured"))?;
///     // ...
/// }
/// ```
#[derive(Debug)]
pub struct NodeContext {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: String,
    pub block_type: BlockType,

    /// Trigger input for root nodes, predecessor outputs keyed by node id
    /// otherwise, or the operator-edited input after a resume
    pub inputs: serde_json::Value,

    /// Node configuration from the workflow definition
    pub config: serde_json::Value,

    /// Operator data supplied when this node was resumed
    pub resume_data: Option<serde_json::Value>,

    /// Current attempt number (1-based)
    pub attempt: u32,

    pub started_at: DateTime<Utc>,

    /// Instant this run was held back to, if it was deferred
    pub scheduled_for: Option<DateTime<Utc>>,

    logger: NodeLogger,
    cancellation: CancellationToken,
    extensions: Extensions,
}

impl NodeContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_id: Uuid,
        workflow_id: Uuid,
        node_id: impl Into<String>,
        block_type: BlockType,
        inputs: serde_json::Value,
        config: serde_json::Value,
        logger: NodeLogger,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            node_id: node_id.into(),
            block_type,
            inputs,
            config,
            resume_data: None,
            attempt: 1,
            started_at,
            scheduled_for: None,
            logger,
            cancellation: CancellationToken::new(),
            extensions: Extensions::new(),
        }
    }

    pub fn with_resume_data(mut self, data: Option<serde_json::Value>) -> Self {
        self.resume_data = data;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_scheduled_for(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.scheduled_for = at;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn logger(&self) -> &NodeLogger {
        &self.logger
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested, for use in `select!`
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Look up a shared service by type
    pub fn extension<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.extensions.get::<T>()
    }

    /// Read a required string from the node config
    pub fn config_str(&self, key: &str) -> Result<&str, BlockError> {
        self.config
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| BlockError::terminal(format!("missing config field `{key}`")))
    }
}

impl std::fmt::Debug for NodeLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLogger")
            .field("node_id", &self.node_id)
            .finish()
    }
}

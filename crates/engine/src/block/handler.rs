//! Block handler trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::NodeContext;

/// Error type for block handler failures
///
/// The variant decides what the engine does next: transient and timeout
/// errors go through the retry policy, terminal errors fail the node
/// immediately, `AwaitingInput` pauses the execution, and `Sleep` puts the
/// node back to sleep without spending a retry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BlockError {
    /// Network hiccup, rate limit, 5xx: worth retrying
    #[error("{0}")]
    Transient(String),

    /// Validation or configuration error: retrying cannot help
    #[error("{0}")]
    Terminal(String),

    /// The handler gave up waiting on its own deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// The handler needs operator input before it can continue
    #[error("awaiting input: {reason}")]
    AwaitingInput { reason: String },

    /// Run the node again once `until` has passed
    #[error("sleeping until {until}")]
    Sleep { until: DateTime<Utc> },

    /// The handler observed the cancellation token
    #[error("cancelled")]
    Cancelled,
}

impl BlockError {
    /// Create a retryable error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a non-retryable error
    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal(message.into())
    }

    /// Ask the engine to pause this node
    pub fn awaiting_input(reason: impl Into<String>) -> Self {
        Self::AwaitingInput {
            reason: reason.into(),
        }
    }

    /// Ask the engine to run this node again at `until`
    pub fn sleep_until(until: DateTime<Utc>) -> Self {
        Self::Sleep { until }
    }

    /// Whether the retry policy may schedule another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

impl From<anyhow::Error> for BlockError {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(err.to_string())
    }
}

impl From<serde_json::Error> for BlockError {
    fn from(err: serde_json::Error) -> Self {
        Self::terminal(format!("invalid data: {err}"))
    }
}

/// A pluggable unit of work executed for one workflow node
///
/// Handlers receive everything they need through the [`NodeContext`] and
/// return the node's output. They must be idempotent: lease expiry can
/// deliver the same node twice.
///
/// # Example
///
/// ```ignore
/// use blockflow_engine::prelude::*;
///
/// struct SendEmail { smtp: SmtpClient }
///
/// #[async_trait]
/// impl BlockHandler for SendEmail {
///     async fn execute(&self, ctx: &NodeContext) -> Result<serde_json::Value, BlockError> {
///         let to = ctx.config_str("to")?;
///         tokio::select! {
///             sent = self.smtp.send(to, &ctx.inputs) => {
///                 let id = sent.map_err(|e| BlockError::transient(e.to_string()))?;
///                 Ok(json!({ "message_id": id }))
///             }
///             _ = ctx.cancelled() => Err(BlockError::Cancelled),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait BlockHandler: Send + Sync + 'static {
    /// Run the node and produce its output
    async fn execute(&self, ctx: &NodeContext) -> Result<serde_json::Value, BlockError>;
}

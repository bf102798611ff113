//! Handlers shipped with the engine

use async_trait::async_trait;
use serde_json::Value;

use super::{BlockError, BlockHandler, NodeContext};

/// Passes its input through, overlaying the keys of `config.set`
pub struct TransformHandler;

#[async_trait]
impl BlockHandler for TransformHandler {
    async fn execute(&self, ctx: &NodeContext) -> Result<Value, BlockError> {
        let Some(set) = ctx.config.get("set") else {
            return Ok(ctx.inputs.clone());
        };

        let Value::Object(set) = set else {
            return Err(BlockError::terminal("`set` must be an object"));
        };

        let mut output = match &ctx.inputs {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        for (key, value) in set {
            output.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(output))
    }
}

/// Pauses until an operator resumes the node, then emits the resumed input
///
/// The pause reason is `config.reason`, defaulting to `manual-approval`.
pub struct ManualApprovalHandler;

#[async_trait]
impl BlockHandler for ManualApprovalHandler {
    async fn execute(&self, ctx: &NodeContext) -> Result<Value, BlockError> {
        if ctx.resume_data.is_none() {
            let reason = ctx
                .config
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("manual-approval");
            ctx.logger().info(format!("waiting for approval: {reason}"));
            return Err(BlockError::awaiting_input(reason));
        }

        ctx.logger().info("approved");
        Ok(ctx.inputs.clone())
    }
}

/// Holds its input back for `config.duration_ms`, then passes it through
///
/// The wait is not spent in the handler: the first run puts the node to
/// sleep and the queue delivers the execution again once it is due.
pub struct DelayHandler;

#[async_trait]
impl BlockHandler for DelayHandler {
    async fn execute(&self, ctx: &NodeContext) -> Result<Value, BlockError> {
        let millis = ctx
            .config
            .get("duration_ms")
            .and_then(Value::as_u64)
            .and_then(|ms| i64::try_from(ms).ok())
            .ok_or_else(|| BlockError::terminal("`duration_ms` must be a non-negative integer"))?;

        if ctx.scheduled_for.is_some() || millis == 0 {
            return Ok(ctx.inputs.clone());
        }

        let until = ctx.started_at + chrono::Duration::milliseconds(millis);
        ctx.logger().info(format!("sleeping until {until}"));
        Err(BlockError::sleep_until(until))
    }
}

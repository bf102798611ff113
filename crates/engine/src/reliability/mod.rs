//! Reliability patterns for node execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Bounded retry with exponential backoff and jitter
//! - [`CircuitBreakerRegistry`] - Store-backed circuit breakers

mod circuit_breaker;
mod retry;

pub use crate::model::CircuitState;
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry, CircuitPermit,
};
pub use retry::{RetryDecision, RetryPolicy};

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

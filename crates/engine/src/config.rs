//! Engine configuration, loaded from environment variables

use std::env;
use std::time::Duration;

use uuid::Uuid;

use crate::reliability::{CircuitBreakerConfig, RetryPolicy};

/// Configuration shared by the state machine, the queue and the worker pool
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identity recorded in `locked_by` for executions this process drives
    pub worker_id: String,

    /// Concurrent queue items processed by the worker pool
    pub workers: usize,

    /// Concurrent block handlers within one execution
    pub max_parallel_nodes: usize,

    /// Visibility timeout of a leased queue item
    pub lease_duration: Duration,

    /// Delivery retries before a queue item is dead-lettered
    pub queue_max_retries: u32,

    /// Backoff between delivery retries of a failed queue item
    pub queue_backoff: RetryPolicy,

    /// Default breaker settings for circuits without an override
    pub breaker: CircuitBreakerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            workers: 4,
            max_parallel_nodes: 4,
            lease_duration: Duration::from_secs(30),
            queue_max_retries: 5,
            queue_backoff: RetryPolicy::exponential()
                .with_initial_interval(Duration::from_secs(1))
                .with_max_interval(Duration::from_secs(300)),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `WORKER_ID`: worker identity (default: generated)
    /// - `BLOCKFLOW_WORKERS`: concurrent queue items (default: 4)
    /// - `BLOCKFLOW_MAX_PARALLEL_NODES`: handlers per execution (default: 4)
    /// - `BLOCKFLOW_LEASE_SECS`: queue lease in seconds (default: 30)
    /// - `BLOCKFLOW_QUEUE_MAX_RETRIES`: delivery retries (default: 5)
    /// - `BLOCKFLOW_BREAKER_FAILURE_THRESHOLD`: failures to open (default: 5)
    /// - `BLOCKFLOW_BREAKER_COOLDOWN_SECS`: open cooldown (default: 30)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let worker_id = env::var("WORKER_ID").unwrap_or(defaults.worker_id);

        let breaker = CircuitBreakerConfig::default()
            .with_failure_threshold(parse_env(
                "BLOCKFLOW_BREAKER_FAILURE_THRESHOLD",
                defaults.breaker.failure_threshold,
            ))
            .with_cooldown(Duration::from_secs(parse_env(
                "BLOCKFLOW_BREAKER_COOLDOWN_SECS",
                defaults.breaker.cooldown.as_secs(),
            )));

        Self {
            worker_id,
            workers: parse_env("BLOCKFLOW_WORKERS", defaults.workers).max(1),
            max_parallel_nodes: parse_env(
                "BLOCKFLOW_MAX_PARALLEL_NODES",
                defaults.max_parallel_nodes,
            )
            .max(1),
            lease_duration: Duration::from_secs(parse_env(
                "BLOCKFLOW_LEASE_SECS",
                defaults.lease_duration.as_secs(),
            )),
            queue_max_retries: parse_env("BLOCKFLOW_QUEUE_MAX_RETRIES", defaults.queue_max_retries),
            queue_backoff: defaults.queue_backoff,
            breaker,
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_parallel_nodes(mut self, max: usize) -> Self {
        self.max_parallel_nodes = max.max(1);
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_queue_max_retries(mut self, max_retries: u32) -> Self {
        self.queue_max_retries = max_retries;
        self
    }

    pub fn with_queue_backoff(mut self, policy: RetryPolicy) -> Self {
        self.queue_backoff = policy;
        self
    }

    pub fn with_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = config;
        self
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

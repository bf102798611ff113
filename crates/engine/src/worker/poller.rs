//! Queue polling with exponential backoff

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::model::QueueItem;
use crate::queue::{ExecutionQueue, QueueError};
use crate::reliability::duration_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Poll interval while work is being found
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Poll interval ceiling while idle
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier applied after an empty poll
    pub backoff_multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }
}

/// Leases queue items, backing off while the queue is empty
pub struct QueuePoller {
    queue: Arc<ExecutionQueue>,
    worker_id: String,
    lease: Duration,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl QueuePoller {
    pub fn new(
        queue: Arc<ExecutionQueue>,
        worker_id: String,
        lease: Duration,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            worker_id,
            lease,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Lease one item, adjusting the backoff
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&mut self) -> Result<Option<QueueItem>, QueueError> {
        if self.is_shutdown() {
            debug!("poller shutdown requested");
            return Ok(None);
        }

        let item = self.queue.lease_next(&self.worker_id, self.lease).await?;
        match &item {
            Some(item) => {
                self.reset_backoff();
                debug!(item_id = %item.id, execution_id = %item.execution_id, "leased");
            }
            None => {
                self.increase_backoff();
                trace!(
                    interval_ms = self.current_interval.as_millis(),
                    "queue empty, backing off"
                );
            }
        }
        Ok(item)
    }

    /// Wait for the current backoff interval
    ///
    /// Returns `true` if shutdown was signaled while waiting.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("shutdown signal received during wait");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

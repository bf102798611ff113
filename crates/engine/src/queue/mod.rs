//! Execution queue
//!
//! A lease-based work queue over the store. Each item asks a worker to
//! advance one execution. Crash recovery relies on lease expiry alone: an
//! item whose lease runs out becomes visible again and is re-leased by
//! whichever worker asks next.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::{to_chrono, Clock};
use crate::config::EngineConfig;
use crate::model::{NewQueueItem, QueueFailOutcome, QueueItem};
use crate::persistence::{ExecutionStore, StoreError};
use crate::reliability::RetryPolicy;

/// Errors from queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue item not found: {0}")]
    NotFound(Uuid),

    /// Only dead-lettered items can be requeued
    #[error("queue item {0} is not dead-lettered")]
    NotDeadLettered(Uuid),

    /// The lease expired and the item was re-leased or settled elsewhere
    #[error("queue item {item_id} is no longer leased to {worker_id}")]
    LeaseLost { item_id: Uuid, worker_id: String },

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::QueueItemNotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Work to put on the queue
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub user_id: Option<Uuid>,
    pub priority: i32,
    pub payload: serde_json::Value,
    /// Deliver no earlier than this; `None` means now
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    pub fn new(workflow_id: Uuid, execution_id: Uuid) -> Self {
        Self {
            workflow_id,
            execution_id,
            user_id: None,
            priority: 0,
            payload: serde_json::Value::Null,
            scheduled_for: None,
        }
    }

    pub fn with_user(mut self, user_id: Option<Uuid>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }
}

/// Lease-based execution queue with delivery retries and dead letters
pub struct ExecutionQueue {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    backoff: RetryPolicy,
}

impl ExecutionQueue {
    pub fn new(store: Arc<dyn ExecutionStore>, clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        Self {
            store,
            clock,
            max_retries: config.queue_max_retries,
            backoff: config.queue_backoff.clone(),
        }
    }

    /// Insert a `pending` item
    #[instrument(skip(self, request), fields(execution_id = %request.execution_id))]
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<QueueItem, QueueError> {
        let now = self.clock.now();
        let item = NewQueueItem {
            workflow_id: request.workflow_id,
            execution_id: request.execution_id,
            user_id: request.user_id,
            priority: request.priority,
            payload: request.payload,
            max_retries: self.max_retries,
            scheduled_for: request.scheduled_for.unwrap_or(now),
        };

        let item = self.store.enqueue(item, now).await?;
        debug!(
            item_id = %item.id,
            priority = item.priority,
            scheduled_for = %item.scheduled_for,
            "enqueued"
        );
        Ok(item)
    }

    /// Lease the best visible item for `lease`, or `None` when there is no work
    pub async fn lease_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<QueueItem>, QueueError> {
        let item = self
            .store
            .lease_next(worker_id, lease, self.clock.now())
            .await?;

        if let Some(item) = &item {
            if item.retry_count > 0 {
                debug!(item_id = %item.id, retry_count = item.retry_count, "leased redelivery");
            }
        }
        Ok(item)
    }

    /// Mark an item `done`; only the current lease holder may
    pub async fn complete(&self, item_id: Uuid, worker_id: &str) -> Result<(), QueueError> {
        if !self.store.complete_queue_item(item_id, worker_id).await? {
            return Err(lease_lost(item_id, worker_id));
        }
        Ok(())
    }

    /// Count a delivery failure, backing off or dead-lettering the item
    ///
    /// Only the current lease holder may fail an item.
    #[instrument(skip(self, error))]
    pub async fn fail(
        &self,
        item_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<QueueFailOutcome, QueueError> {
        let item = self.store.get_queue_item(item_id).await?;
        let delay = self.backoff.delay_for_retry(item.retry_count + 1);
        let retry_at = self.clock.now() + to_chrono(delay);

        let outcome = self
            .store
            .fail_queue_item(item_id, worker_id, error, retry_at)
            .await?
            .ok_or_else(|| lease_lost(item_id, worker_id))?;
        match &outcome {
            QueueFailOutcome::Rescheduled {
                retry_count,
                scheduled_for,
            } => {
                warn!(%item_id, retry_count, %scheduled_for, error, "delivery failed, rescheduled")
            }
            QueueFailOutcome::DeadLettered { retry_count } => {
                warn!(%item_id, retry_count, error, "delivery retries exhausted, dead-lettered")
            }
        }
        Ok(outcome)
    }

    /// Dead-lettered items, oldest first
    pub async fn dead_letters(&self, limit: u32) -> Result<Vec<QueueItem>, QueueError> {
        Ok(self.store.list_dead_letters(limit).await?)
    }

    /// Give a dead-lettered item a fresh retry budget (operator action)
    pub async fn requeue_dead_letter(&self, item_id: Uuid) -> Result<QueueItem, QueueError> {
        match self
            .store
            .requeue_dead_letter(item_id, self.clock.now())
            .await?
        {
            Some(item) => {
                info!(%item_id, "dead letter requeued");
                Ok(item)
            }
            None => {
                // Distinguish a missing item from one in another state
                self.store.get_queue_item(item_id).await?;
                Err(QueueError::NotDeadLettered(item_id))
            }
        }
    }
}

fn lease_lost(item_id: Uuid, worker_id: &str) -> QueueError {
    warn!(%item_id, worker_id, "lease lost before the item was settled");
    QueueError::LeaseLost {
        item_id,
        worker_id: worker_id.to_string(),
    }
}

//! Execution queue records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Queue item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for `scheduled_for`
    Pending,
    /// Held by a worker until `locked_until`
    Leased,
    Done,
    /// Dead letter: delivery retries exhausted
    Failed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown queue status: {other}")),
        }
    }
}

/// Item to insert into the queue
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub user_id: Option<Uuid>,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub max_retries: u32,
    pub scheduled_for: DateTime<Utc>,
}

/// A unit of work in the execution queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct QueueItem {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub execution_id: Uuid,
    pub user_id: Option<Uuid>,
    /// Higher is sooner
    pub priority: i32,
    pub status: QueueStatus,
    pub payload: serde_json::Value,
    /// Delivery retries consumed so far
    pub retry_count: u32,
    pub max_retries: u32,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub scheduled_for: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Insertion order, the final tie-breaker when leasing
    pub seq: i64,
    pub created_at: DateTime<Utc>,
}

impl QueueItem {
    /// Whether a scheduler may lease this item at `now`
    ///
    /// Pending items become visible at `scheduled_for`; leased items become
    /// visible again once their lease has expired.
    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            QueueStatus::Pending => self.scheduled_for <= now,
            QueueStatus::Leased => self.locked_until.is_some_and(|until| until < now),
            QueueStatus::Done | QueueStatus::Failed => false,
        }
    }

    /// Whether `worker_id` holds a live lease at `now`
    pub fn is_leased_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Leased
            && self.locked_by.as_deref() == Some(worker_id)
            && self.locked_until.is_some_and(|until| until >= now)
    }

    /// Whether `worker_id` is the recorded lease holder, expired or not
    ///
    /// Settling an item (`complete` / `fail`) only requires that nobody
    /// re-leased it in the meantime.
    pub fn is_leased_to(&self, worker_id: &str) -> bool {
        self.status == QueueStatus::Leased && self.locked_by.as_deref() == Some(worker_id)
    }
}

/// Outcome of failing a queue item
#[derive(Debug, Clone, PartialEq)]
pub enum QueueFailOutcome {
    /// Back to pending, visible again at `scheduled_for`
    Rescheduled {
        retry_count: u32,
        scheduled_for: DateTime<Utc>,
    },

    /// Moved to the dead-letter state
    DeadLettered { retry_count: u32 },
}

//! Worker pool driving executions off the queue
//!
//! Manages concurrent queue processing with graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::poller::{PollerConfig, QueuePoller};
use crate::config::EngineConfig;
use crate::engine::{AdvanceOutcome, Engine};
use crate::model::{QueueFailOutcome, QueueItem};
use crate::queue::{EnqueueRequest, QueueError};

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Identity recorded on leases and executions
    pub worker_id: String,

    /// Maximum queue items processed concurrently
    pub max_concurrency: usize,

    /// Visibility timeout of leased items
    pub lease_duration: Duration,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
}

impl WorkerPoolConfig {
    /// Derive the pool settings from the engine configuration
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            max_concurrency: config.workers,
            lease_duration: config.lease_duration,
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Leasing and processing items
    Running,
    /// Finishing in-flight items, not leasing new ones
    Draining,
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// How a leased item was settled
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The execution was advanced and the item completed
    Advanced(AdvanceOutcome),

    /// Advancing failed; the item was rescheduled or dead-lettered
    Failed {
        error: String,
        outcome: QueueFailOutcome,
    },

    /// The lease expired and another worker took the item over; the item
    /// was left to its new holder
    LeaseLost,
}

/// Advance the execution behind a leased item and settle the lease
///
/// A wake-up instant is turned into a new delayed item before the current
/// one is completed.
#[instrument(skip(engine, item), fields(item_id = %item.id, execution_id = %item.execution_id))]
pub async fn process_item(
    engine: &Engine,
    item: &QueueItem,
    worker_id: &str,
) -> Result<Delivery, WorkerPoolError> {
    let queue = engine.queue();

    match engine.machine().advance(item.execution_id, worker_id).await {
        Ok(outcome) => {
            if let AdvanceOutcome::WakeAt(at) = outcome {
                queue
                    .enqueue(
                        EnqueueRequest::new(item.workflow_id, item.execution_id)
                            .with_user(item.user_id)
                            .with_priority(item.priority)
                            .with_payload(json!({"reason": "wake"}))
                            .scheduled_for(at),
                    )
                    .await?;
            }
            match queue.complete(item.id, worker_id).await {
                Ok(()) => Ok(Delivery::Advanced(outcome)),
                Err(QueueError::LeaseLost { .. }) => Ok(Delivery::LeaseLost),
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => {
            let error = e.to_string();
            warn!(%error, "advance failed");
            match queue.fail(item.id, worker_id, &error).await {
                Ok(outcome) => Ok(Delivery::Failed { error, outcome }),
                Err(QueueError::LeaseLost { .. }) => Ok(Delivery::LeaseLost),
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// Pool of queue consumers
///
/// # Example
///
/// ```ignore
/// use blockflow_engine::worker::{WorkerPool, WorkerPoolConfig};
///
/// let config = WorkerPoolConfig::from_engine(engine.config()).with_max_concurrency(8);
/// let pool = WorkerPool::new(engine.clone(), config);
///
/// pool.start()?;
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    engine: Engine,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerPoolStatus>,
    active: Arc<Semaphore>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(engine: Engine, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            engine,
            active: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            poll_handle: Mutex::new(None),
        }
    }

    /// Start the polling loop in the background
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }
        self.shutdown_tx.send_replace(false);

        info!(
            worker_id = %self.config.worker_id,
            max_concurrency = self.config.max_concurrency,
            "starting worker pool"
        );
        self.start_poll_loop();
        Ok(())
    }

    /// Stop leasing and wait for in-flight items
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        if self.status() == WorkerPoolStatus::Stopped {
            return Ok(());
        }

        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");
        *self.status.write() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active.available_permits();
            if available == self.config.max_concurrency {
                debug!("all items settled");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.config.max_concurrency - available,
                    "shutdown timeout reached"
                );
                return Err(WorkerPoolError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let handle = self.poll_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Lease and process a single item inline
    ///
    /// Returns `None` when no item is visible.
    pub async fn process_next(&self) -> Result<Option<(QueueItem, Delivery)>, WorkerPoolError> {
        let item = self
            .engine
            .queue()
            .lease_next(&self.config.worker_id, self.config.lease_duration)
            .await?;

        let Some(item) = item else {
            return Ok(None);
        };
        let delivery = process_item(&self.engine, &item, &self.config.worker_id).await?;
        Ok(Some((item, delivery)))
    }

    fn start_poll_loop(&self) {
        let engine = self.engine.clone();
        let config = self.config.clone();
        let active = Arc::clone(&self.active);
        let mut shutdown_rx = self.shutdown_rx.clone();
        // Only a shutdown signaled after this point stops the loop
        shutdown_rx.borrow_and_update();

        let handle = tokio::spawn(async move {
            let mut poller = QueuePoller::new(
                engine.queue().clone(),
                config.worker_id.clone(),
                config.lease_duration,
                config.poller.clone(),
                shutdown_rx,
            );

            loop {
                if poller.is_shutdown() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                // Wait for a free slot before leasing
                let permit = tokio::select! {
                    permit = Arc::clone(&active).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    stop = poller.wait() => {
                        if stop {
                            break;
                        }
                        continue;
                    }
                };

                match poller.poll().await {
                    Ok(Some(item)) => {
                        let engine = engine.clone();
                        let worker_id = config.worker_id.clone();

                        tokio::spawn(async move {
                            if let Err(e) = process_item(&engine, &item, &worker_id).await {
                                error!(item_id = %item.id, "failed to settle queue item: {}", e);
                            }
                            drop(permit);
                        });
                        continue;
                    }
                    Ok(None) => drop(permit),
                    Err(e) => {
                        drop(permit);
                        error!("poll error: {}", e);
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }
}

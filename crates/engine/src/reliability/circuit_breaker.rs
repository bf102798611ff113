//! Store-backed circuit breakers
//!
//! Circuit state lives in the [`ExecutionStore`] so every worker process sees
//! the same breaker. All mutations are versioned compare-and-set writes that
//! are retried on conflict; no in-process lock guards the state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::duration_millis;
use crate::clock::{to_chrono, Clock};
use crate::model::{CircuitRecord, CircuitState};
use crate::persistence::{ExecutionStore, StoreError};

/// Compare-and-set attempts before giving up on a contended circuit row
const MAX_CAS_ATTEMPTS: usize = 16;

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐    cooldown     ┌──────────┐
/// │ Closed  │ ──────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                 └──────────┘
///      ▲                               ▲       probe failure       │
///      │                               └───────────────────────────┤
///      │                  probe success                            │
///      └───────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use blockflow_engine::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_cooldown(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Time to wait before a half-open probe; also the probe's own deadline
    #[serde(with = "duration_millis")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the cooldown before probing an open circuit
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Error types for circuit breaker operations
#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    /// Circuit is open (or a probe is in flight); calls are not allowed
    #[error("circuit {circuit_id} is open until {retry_at}")]
    Open {
        circuit_id: String,
        retry_at: DateTime<Utc>,
    },

    /// Too many concurrent writers on the same circuit row
    #[error("circuit {0} is contended")]
    Contention(String),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Permit that must be held during a protected call
///
/// Report the outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). Dropping a probe permit without reporting
/// leaves the circuit half-open until the probe deadline passes.
#[must_use = "report the call outcome through the permit"]
pub struct CircuitPermit<'a> {
    registry: &'a CircuitBreakerRegistry,
    circuit_id: String,
    probe: bool,
}

impl CircuitPermit<'_> {
    /// Whether this permit is the single half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn circuit_id(&self) -> &str {
        &self.circuit_id
    }

    /// Report the call succeeded
    pub async fn success(self) -> Result<CircuitRecord, CircuitBreakerError> {
        self.registry.record_success(&self.circuit_id, self.probe).await
    }

    /// Report the call failed
    pub async fn failure(self) -> Result<CircuitRecord, CircuitBreakerError> {
        self.registry.record_failure(&self.circuit_id, self.probe).await
    }
}

/// Registry of circuit breakers keyed by circuit id
///
/// # Example
///
/// ```ignore
/// use blockflow_engine::reliability::{CircuitBreakerRegistry, CircuitBreakerError};
///
/// match registry.acquire("smtp").await {
///     Ok(permit) => match send_email().await {
///         Ok(_) => { permit.success().await?; }
///         Err(_) => { permit.failure().await?; }
///     },
///     Err(CircuitBreakerError::Open { retry_at, .. }) => {
///         // Fail fast, try again at `retry_at`
///     }
///     Err(e) => return Err(e.into()),
/// }
/// ```
pub struct CircuitBreakerRegistry {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    default_config: CircuitBreakerConfig,
    configs: HashMap<String, CircuitBreakerConfig>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        clock: Arc<dyn Clock>,
        default_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            default_config,
            configs: HashMap::new(),
        }
    }

    /// Override the configuration of one circuit
    pub fn with_circuit(
        mut self,
        circuit_id: impl Into<String>,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.configs.insert(circuit_id.into(), config);
        self
    }

    pub fn config(&self, circuit_id: &str) -> &CircuitBreakerConfig {
        self.configs.get(circuit_id).unwrap_or(&self.default_config)
    }

    /// Current persisted state; unknown circuits read as closed
    pub async fn state(&self, circuit_id: &str) -> Result<CircuitRecord, CircuitBreakerError> {
        Ok(self.load(circuit_id).await?)
    }

    /// Ask to make a call through the circuit
    ///
    /// Closed circuits always grant a permit. After the cooldown, exactly one
    /// caller wins the `open -> half_open` compare-and-set and receives the
    /// probe permit; everyone else is short-circuited. A probe that has not
    /// reported back within the cooldown is considered lost and re-issued.
    pub async fn acquire(
        &self,
        circuit_id: &str,
    ) -> Result<CircuitPermit<'_>, CircuitBreakerError> {
        let cooldown = to_chrono(self.config(circuit_id).cooldown);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.load(circuit_id).await?;
            let now = self.clock.now();

            let probe_from = match current.state {
                CircuitState::Closed => return Ok(self.permit(circuit_id, false)),
                CircuitState::Open => current.last_failure_at.unwrap_or(current.updated_at),
                CircuitState::HalfOpen => current.half_open_at.unwrap_or(current.updated_at),
            };

            let retry_at = probe_from + cooldown;
            if now < retry_at {
                return Err(CircuitBreakerError::Open {
                    circuit_id: circuit_id.to_string(),
                    retry_at,
                });
            }

            let mut next = current.clone();
            next.state = CircuitState::HalfOpen;
            next.half_open_at = Some(now);
            next.success_count = 0;

            if self.save(next, current.version, now).await? {
                if current.state == CircuitState::HalfOpen {
                    warn!(circuit_id, "half-open probe lost, re-issuing");
                } else {
                    info!(circuit_id, "circuit half-open, probing");
                }
                return Ok(self.permit(circuit_id, true));
            }
        }

        Err(CircuitBreakerError::Contention(circuit_id.to_string()))
    }

    /// Force the circuit closed with zeroed counters (operator action)
    pub async fn reset(&self, circuit_id: &str) -> Result<CircuitRecord, CircuitBreakerError> {
        self.update(circuit_id, |record, now| {
            record.state = CircuitState::Closed;
            record.failure_count = 0;
            record.success_count = 0;
            record.half_open_at = None;
            record.updated_at = now;
            true
        })
        .await
    }

    fn permit(&self, circuit_id: &str, probe: bool) -> CircuitPermit<'_> {
        CircuitPermit {
            registry: self,
            circuit_id: circuit_id.to_string(),
            probe,
        }
    }

    async fn record_success(
        &self,
        circuit_id: &str,
        probe: bool,
    ) -> Result<CircuitRecord, CircuitBreakerError> {
        let record = self
            .update(circuit_id, |record, now| match record.state {
                CircuitState::Closed => {
                    record.failure_count = 0;
                    record.success_count = record.success_count.saturating_add(1);
                    record.last_success_at = Some(now);
                    true
                }
                CircuitState::HalfOpen if probe => {
                    record.state = CircuitState::Closed;
                    record.failure_count = 0;
                    record.success_count = 0;
                    record.half_open_at = None;
                    record.last_success_at = Some(now);
                    true
                }
                // A stale permit cannot close a circuit it did not probe
                _ => false,
            })
            .await?;

        if probe && record.state == CircuitState::Closed {
            info!(circuit_id, "probe succeeded, circuit closed");
        }
        Ok(record)
    }

    async fn record_failure(
        &self,
        circuit_id: &str,
        probe: bool,
    ) -> Result<CircuitRecord, CircuitBreakerError> {
        let threshold = self.config(circuit_id).failure_threshold;

        let record = self
            .update(circuit_id, |record, now| match record.state {
                CircuitState::Closed => {
                    record.failure_count = record.failure_count.saturating_add(1);
                    record.success_count = 0;
                    record.last_failure_at = Some(now);
                    if record.failure_count >= threshold {
                        record.state = CircuitState::Open;
                    }
                    true
                }
                CircuitState::HalfOpen if probe => {
                    record.state = CircuitState::Open;
                    record.last_failure_at = Some(now);
                    record.half_open_at = None;
                    true
                }
                _ => false,
            })
            .await?;

        if record.state == CircuitState::Open {
            warn!(
                circuit_id,
                failure_count = record.failure_count,
                "circuit open"
            );
        } else {
            debug!(circuit_id, failure_count = record.failure_count, "failure recorded");
        }
        Ok(record)
    }

    /// Read-modify-write loop; `mutate` returns false to leave the row alone
    async fn update<F>(
        &self,
        circuit_id: &str,
        mutate: F,
    ) -> Result<CircuitRecord, CircuitBreakerError>
    where
        F: Fn(&mut CircuitRecord, DateTime<Utc>) -> bool,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.load(circuit_id).await?;
            let now = self.clock.now();

            let mut next = current.clone();
            if !mutate(&mut next, now) {
                return Ok(current);
            }

            let version = current.version;
            if self.save(next.clone(), version, now).await? {
                next.version = version + 1;
                next.updated_at = now;
                return Ok(next);
            }
        }

        Err(CircuitBreakerError::Contention(circuit_id.to_string()))
    }

    async fn load(&self, circuit_id: &str) -> Result<CircuitRecord, StoreError> {
        Ok(self
            .store
            .get_circuit(circuit_id)
            .await?
            .unwrap_or_else(|| CircuitRecord::closed(circuit_id, self.clock.now())))
    }

    async fn save(
        &self,
        mut next: CircuitRecord,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        next.version = expected_version + 1;
        next.updated_at = now;
        self.store.save_circuit(&next, expected_version).await
    }
}

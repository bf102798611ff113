//! Workflow execution engine
//!
//! This module provides:
//! - [`StateMachine`] - Execution lifecycle and graph walking
//! - [`NodeExecutor`] - Runs one node through its block handler
//! - [`PauseManager`] - Pause, snapshot and resume
//! - [`Engine`] - The components above wired to one store and clock

mod executor;
mod machine;
mod pause;

pub use executor::{NodeExecutor, NodeRun, NodeRunOutcome};
pub use machine::{AdvanceOutcome, StateMachine, TriggerOptions};
pub use pause::{PauseManager, ResumeOutcome};

use std::sync::Arc;

use crate::block::HandlerRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::persistence::ExecutionStore;
use crate::queue::ExecutionQueue;
use crate::reliability::{CircuitBreakerConfig, CircuitBreakerRegistry};

/// A fully wired engine sharing one store and one clock
///
/// # Example
///
/// ```ignore
/// use blockflow_engine::prelude::*;
///
/// let engine = Engine::builder(Arc::new(InMemoryExecutionStore::new()))
///     .with_handlers(registry)
///     .with_circuit("smtp", CircuitBreakerConfig::default().with_failure_threshold(3))
///     .build();
///
/// engine.machine().save_workflow(workflow).await?;
/// let execution = engine.machine().trigger(workflow_id, input, TriggerOptions::default()).await?;
/// ```
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    queue: Arc<ExecutionQueue>,
    breakers: Arc<CircuitBreakerRegistry>,
    pauses: Arc<PauseManager>,
    machine: Arc<StateMachine>,
}

impl Engine {
    pub fn builder(store: Arc<dyn ExecutionStore>) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<ExecutionQueue> {
        &self.queue
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn pauses(&self) -> &Arc<PauseManager> {
        &self.pauses
    }

    pub fn machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    handlers: HandlerRegistry,
    config: EngineConfig,
    circuits: Vec<(String, CircuitBreakerConfig)>,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            handlers: HandlerRegistry::with_builtins(),
            config: EngineConfig::default(),
            circuits: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the breaker configuration of one circuit
    pub fn with_circuit(mut self, circuit_id: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.circuits.push((circuit_id.into(), config));
        self
    }

    pub fn build(self) -> Engine {
        let Self {
            store,
            clock,
            handlers,
            config,
            circuits,
        } = self;

        let breakers = circuits.into_iter().fold(
            CircuitBreakerRegistry::new(store.clone(), clock.clone(), config.breaker.clone()),
            |registry, (id, circuit)| registry.with_circuit(id, circuit),
        );
        let breakers = Arc::new(breakers);

        let queue = Arc::new(ExecutionQueue::new(store.clone(), clock.clone(), &config));
        let pauses = Arc::new(PauseManager::new(store.clone(), clock.clone(), queue.clone()));
        let executor = Arc::new(NodeExecutor::new(
            store.clone(),
            clock.clone(),
            breakers.clone(),
            handlers.extensions().clone(),
        ));
        let machine = Arc::new(StateMachine::new(
            store.clone(),
            clock.clone(),
            handlers,
            executor,
            pauses.clone(),
            queue.clone(),
            config.clone(),
        ));

        Engine {
            store,
            clock,
            config,
            queue,
            breakers,
            pauses,
            machine,
        }
    }
}

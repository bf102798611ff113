// HTTP API routes
//
// Each submodule handles one resource type. All of them share the engine
// through `AppState`.

pub mod circuits;
pub mod common;
pub mod executions;
pub mod queue;
pub mod workflows;

use blockflow_engine::Engine;

// Re-export common types
pub use common::{ApiError, ErrorResponse, ListResponse};

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

// OpenAPI specification generation
//
// Served by the API server under /api-doc/openapi.json and written to stdout
// by the export-openapi binary.

use crate::api;
use crate::api::{ErrorResponse, ListResponse};
use blockflow_engine::model::{
    CircuitRecord, CircuitState, Edge, ExecutionLog, ExecutionStatus, LogLevel,
    NodeDefinition, NodeExecution, NodeInput, NodeStatus, QueueItem, QueueStatus,
    WorkflowDefinition, WorkflowExecution,
};
use utoipa::OpenApi;

/// OpenAPI documentation for the Blockflow control API
#[derive(OpenApi)]
#[openapi(
    paths(
        api::workflows::save_workflow,
        api::workflows::trigger_execution,
        api::executions::get_execution,
        api::executions::list_nodes,
        api::executions::pause_execution,
        api::executions::resume_execution,
        api::executions::cancel_execution,
        api::executions::retry_node,
        api::executions::node_snapshot,
        api::queue::list_dead_letters,
        api::queue::requeue_dead_letter,
        api::circuits::get_circuit,
        api::circuits::reset_circuit,
    ),
    components(
        schemas(
            ErrorResponse,
            WorkflowDefinition, NodeDefinition, Edge,
            WorkflowExecution, ExecutionStatus, ExecutionLog, LogLevel,
            NodeExecution, NodeStatus, NodeInput,
            QueueItem, QueueStatus,
            CircuitRecord, CircuitState,
            api::workflows::SaveWorkflowRequest, api::workflows::TriggerRequest,
            api::executions::ReasonRequest, api::executions::ResumeRequest,
            api::executions::ResumeResponse, api::executions::RetryRequest,
            ListResponse<NodeExecution>,
            ListResponse<QueueItem>,
        )
    ),
    tags(
        (name = "workflows", description = "Workflow definitions and triggers"),
        (name = "executions", description = "Execution inspection and operator control"),
        (name = "queue", description = "Execution queue dead letters"),
        (name = "circuits", description = "Circuit breaker state")
    ),
    info(
        title = "Blockflow API",
        description = "Control plane for the Blockflow workflow engine",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
pub struct ApiDoc;

impl ApiDoc {
    /// Generate the OpenAPI spec as a pretty-printed JSON string
    pub fn to_json() -> Result<String, serde_json::Error> {
        Self::openapi().to_pretty_json()
    }
}

// Execution control HTTP routes
//
// Operator actions on running workflows: inspect, pause, resume, cancel and
// retry. Request bodies use camelCase field names.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    routing::{get, post},
    Json, Router,
};
use blockflow_engine::model::{NodeExecution, NodeInput, WorkflowExecution};
use blockflow_engine::ResumeOutcome;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::common::{optional_json, ApiError, ErrorResponse, ListResponse};
use super::AppState;

/// Optional reason attached to pause and cancel requests
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReasonRequest {
    /// Free-form reason recorded in the execution log.
    #[schema(example = "maintenance window")]
    pub reason: Option<String>,
}

/// Request to resume a paused execution
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResumeRequest {
    /// Object merged over the paused node's last input. Must be an object or null.
    #[schema(example = json!({"approved": true}))]
    pub resume_data: Option<serde_json::Value>,
    /// Node whose pause to resolve. Optional when only one pause is active.
    pub node_id: Option<String>,
}

/// Result of a resume request
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    /// False when the pause had already been resolved by an earlier request.
    pub resumed: bool,
    pub execution: WorkflowExecution,
}

impl From<ResumeOutcome> for ResumeResponse {
    fn from(outcome: ResumeOutcome) -> Self {
        match outcome {
            ResumeOutcome::Resumed(execution) => Self {
                resumed: true,
                execution,
            },
            ResumeOutcome::AlreadyResumed(execution) => Self {
                resumed: false,
                execution,
            },
        }
    }
}

/// Request to retry a failed node
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    /// The failed node to run again.
    #[schema(example = "send_email")]
    pub node_id: String,
}

/// Create execution routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/executions/:execution_id", get(get_execution))
        .route("/api/executions/:execution_id/nodes", get(list_nodes))
        .route("/api/executions/:execution_id/pause", post(pause_execution))
        .route("/api/executions/:execution_id/resume", post(resume_execution))
        .route("/api/executions/:execution_id/cancel", post(cancel_execution))
        .route("/api/executions/:execution_id/retry", post(retry_node))
        .route(
            "/api/executions/:execution_id/node-snapshot/:node_id",
            get(node_snapshot),
        )
        .with_state(state)
}

/// GET /api/executions/{execution_id} - Get execution by ID
#[utoipa::path(
    get,
    path = "/api/executions/{execution_id}",
    params(
        ("execution_id" = Uuid, Path, description = "Execution ID")
    ),
    responses(
        (status = 200, description = "Execution found", body = WorkflowExecution),
        (status = 404, description = "Execution not found", body = ErrorResponse)
    ),
    tag = "executions"
)]
pub async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<WorkflowExecution>, ApiError> {
    let execution = state.engine.machine().execution(execution_id).await?;
    Ok(Json(execution))
}

/// GET /api/executions/{execution_id}/nodes - List node executions
#[utoipa::path(
    get,
    path = "/api/executions/{execution_id}/nodes",
    params(
        ("execution_id" = Uuid, Path, description = "Execution ID")
    ),
    responses(
        (status = 200, description = "Node executions", body = ListResponse<NodeExecution>),
        (status = 404, description = "Execution not found", body = ErrorResponse)
    ),
    tag = "executions"
)]
pub async fn list_nodes(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ListResponse<NodeExecution>>, ApiError> {
    let nodes = state.engine.machine().nodes(execution_id).await?;
    Ok(Json(ListResponse::new(nodes)))
}

/// POST /api/executions/{execution_id}/pause - Pause a running execution
#[utoipa::path(
    post,
    path = "/api/executions/{execution_id}/pause",
    params(
        ("execution_id" = Uuid, Path, description = "Execution ID")
    ),
    request_body = ReasonRequest,
    responses(
        (status = 200, description = "Execution paused", body = WorkflowExecution),
        (status = 404, description = "Execution not found", body = ErrorResponse),
        (status = 409, description = "Execution is not running", body = ErrorResponse)
    ),
    tag = "executions"
)]
pub async fn pause_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
    body: Result<Json<ReasonRequest>, JsonRejection>,
) -> Result<Json<WorkflowExecution>, ApiError> {
    let reason = reason_or(optional_json(body)?, "paused by operator");
    let execution = state
        .engine
        .pauses()
        .pause_execution(execution_id, &reason)
        .await?;
    Ok(Json(execution))
}

/// POST /api/executions/{execution_id}/resume - Resume a paused execution
#[utoipa::path(
    post,
    path = "/api/executions/{execution_id}/resume",
    params(
        ("execution_id" = Uuid, Path, description = "Execution ID")
    ),
    request_body = ResumeRequest,
    responses(
        (status = 200, description = "Execution resumed", body = ResumeResponse),
        (status = 400, description = "Malformed body or resumeData is not an object", body = ErrorResponse),
        (status = 404, description = "No pause record", body = ErrorResponse)
    ),
    tag = "executions"
)]
pub async fn resume_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
    body: Result<Json<ResumeRequest>, JsonRejection>,
) -> Result<Json<ResumeResponse>, ApiError> {
    let request = optional_json(body)?;
    let outcome = state
        .engine
        .pauses()
        .resume(execution_id, request.node_id.as_deref(), request.resume_data)
        .await?;
    Ok(Json(outcome.into()))
}

/// POST /api/executions/{execution_id}/cancel - Cancel an execution
#[utoipa::path(
    post,
    path = "/api/executions/{execution_id}/cancel",
    params(
        ("execution_id" = Uuid, Path, description = "Execution ID")
    ),
    request_body = ReasonRequest,
    responses(
        (status = 200, description = "Execution cancelled", body = WorkflowExecution),
        (status = 404, description = "Execution not found", body = ErrorResponse),
        (status = 409, description = "Execution already finished", body = ErrorResponse)
    ),
    tag = "executions"
)]
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
    body: Result<Json<ReasonRequest>, JsonRejection>,
) -> Result<Json<WorkflowExecution>, ApiError> {
    let reason = reason_or(optional_json(body)?, "cancelled by operator");
    let execution = state.engine.machine().cancel(execution_id, &reason).await?;
    Ok(Json(execution))
}

/// POST /api/executions/{execution_id}/retry - Retry a failed node
#[utoipa::path(
    post,
    path = "/api/executions/{execution_id}/retry",
    params(
        ("execution_id" = Uuid, Path, description = "Execution ID")
    ),
    request_body = RetryRequest,
    responses(
        (status = 200, description = "Node reset for retry", body = NodeExecution),
        (status = 404, description = "Execution or node not found", body = ErrorResponse),
        (status = 409, description = "Node is not failed or execution was cancelled", body = ErrorResponse)
    ),
    tag = "executions"
)]
pub async fn retry_node(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
    Json(request): Json<RetryRequest>,
) -> Result<Json<NodeExecution>, ApiError> {
    let node = state
        .engine
        .machine()
        .retry_node(execution_id, &request.node_id)
        .await?;
    Ok(Json(node))
}

/// GET /api/executions/{execution_id}/node-snapshot/{node_id} - Last node input
#[utoipa::path(
    get,
    path = "/api/executions/{execution_id}/node-snapshot/{node_id}",
    params(
        ("execution_id" = Uuid, Path, description = "Execution ID"),
        ("node_id" = String, Path, description = "Node ID")
    ),
    responses(
        (status = 200, description = "Input the node last ran with", body = NodeInput),
        (status = 404, description = "Execution or snapshot not found", body = ErrorResponse)
    ),
    tag = "executions"
)]
pub async fn node_snapshot(
    State(state): State<AppState>,
    Path((execution_id, node_id)): Path<(Uuid, String)>,
) -> Result<Json<NodeInput>, ApiError> {
    let snapshot = state.engine.pauses().snapshot(execution_id, &node_id).await?;
    Ok(Json(snapshot))
}

fn reason_or(request: ReasonRequest, default: &str) -> String {
    request
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

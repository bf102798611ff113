// Workflow definition and trigger HTTP routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{post, put},
    Json, Router,
};
use blockflow_engine::model::{Edge, NodeDefinition, WorkflowDefinition, WorkflowExecution};
use blockflow_engine::TriggerOptions;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::common::{ApiError, ErrorResponse};
use super::AppState;

/// Request to register or replace a workflow definition
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SaveWorkflowRequest {
    /// Display name of the workflow.
    #[schema(example = "Invoice approval")]
    pub name: String,
    /// Nodes of the graph. Ids must be unique.
    pub nodes: Vec<NodeDefinition>,
    /// `to` runs after `from` completes. The graph must be acyclic.
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Request to start an execution
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    /// Input handed to the root nodes.
    #[serde(default)]
    #[schema(example = json!({"invoiceId": "INV-1042"}))]
    pub input: serde_json::Value,
    /// User on whose behalf the workflow runs.
    pub user_id: Option<Uuid>,
    /// Higher priorities are leased first.
    #[serde(default)]
    pub priority: i32,
    /// Free-form metadata stored with the execution.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Do not start before this instant.
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl From<TriggerRequest> for TriggerOptions {
    fn from(req: TriggerRequest) -> Self {
        let mut options = TriggerOptions::default()
            .with_priority(req.priority)
            .with_metadata(req.metadata);
        if let Some(user_id) = req.user_id {
            options = options.with_user(user_id);
        }
        if let Some(at) = req.scheduled_for {
            options = options.scheduled_for(at);
        }
        options
    }
}

/// Create workflow routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/workflows/:workflow_id", put(save_workflow))
        .route("/api/workflows/:workflow_id/executions", post(trigger_execution))
        .with_state(state)
}

/// PUT /api/workflows/{workflow_id} - Register a workflow definition
#[utoipa::path(
    put,
    path = "/api/workflows/{workflow_id}",
    params(
        ("workflow_id" = Uuid, Path, description = "Workflow ID")
    ),
    request_body = SaveWorkflowRequest,
    responses(
        (status = 200, description = "Workflow saved", body = WorkflowDefinition),
        (status = 400, description = "Invalid graph or unknown block type", body = ErrorResponse)
    ),
    tag = "workflows"
)]
pub async fn save_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Json(req): Json<SaveWorkflowRequest>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    let mut workflow = WorkflowDefinition::new(workflow_id, req.name);
    workflow.nodes = req.nodes;
    workflow.edges = req.edges;

    let workflow = state.engine.machine().save_workflow(workflow).await?;
    Ok(Json(workflow))
}

/// POST /api/workflows/{workflow_id}/executions - Trigger an execution
#[utoipa::path(
    post,
    path = "/api/workflows/{workflow_id}/executions",
    params(
        ("workflow_id" = Uuid, Path, description = "Workflow ID")
    ),
    request_body = TriggerRequest,
    responses(
        (status = 201, description = "Execution queued", body = WorkflowExecution),
        (status = 404, description = "Workflow not found", body = ErrorResponse)
    ),
    tag = "workflows"
)]
pub async fn trigger_execution(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    body: Option<Json<TriggerRequest>>,
) -> Result<(StatusCode, Json<WorkflowExecution>), ApiError> {
    let mut req = body.map(|Json(r)| r).unwrap_or_default();
    let input = std::mem::take(&mut req.input);

    let execution = state
        .engine
        .machine()
        .trigger(workflow_id, input, req.into())
        .await?;
    Ok((StatusCode::CREATED, Json(execution)))
}

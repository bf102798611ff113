// Dead-letter queue HTTP routes

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use blockflow_engine::model::QueueItem;
use blockflow_engine::EngineError;
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

use super::common::{ApiError, ErrorResponse, ListResponse};
use super::AppState;

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 500;

/// Query parameters for listing dead letters
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DeadLetterQuery {
    /// Maximum number of items to return (default 50, max 500).
    pub limit: Option<u32>,
}

/// Create queue routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/queue/dead-letters", get(list_dead_letters))
        .route("/api/queue/dead-letters/:item_id/requeue", post(requeue_dead_letter))
        .with_state(state)
}

/// GET /api/queue/dead-letters - Items whose delivery retries are exhausted
#[utoipa::path(
    get,
    path = "/api/queue/dead-letters",
    params(DeadLetterQuery),
    responses(
        (status = 200, description = "Dead-lettered items", body = ListResponse<QueueItem>)
    ),
    tag = "queue"
)]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<ListResponse<QueueItem>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let items = state
        .engine
        .queue()
        .dead_letters(limit)
        .await
        .map_err(EngineError::from)?;
    Ok(Json(ListResponse::new(items)))
}

/// POST /api/queue/dead-letters/{item_id}/requeue - Give an item a fresh delivery budget
#[utoipa::path(
    post,
    path = "/api/queue/dead-letters/{item_id}/requeue",
    params(
        ("item_id" = Uuid, Path, description = "Queue item ID")
    ),
    responses(
        (status = 200, description = "Item requeued", body = QueueItem),
        (status = 404, description = "Item not found", body = ErrorResponse),
        (status = 409, description = "Item is not dead-lettered", body = ErrorResponse)
    ),
    tag = "queue"
)]
pub async fn requeue_dead_letter(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
) -> Result<Json<QueueItem>, ApiError> {
    let item = state
        .engine
        .queue()
        .requeue_dead_letter(item_id)
        .await
        .map_err(EngineError::from)?;
    Ok(Json(item))
}

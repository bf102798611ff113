// Circuit breaker HTTP routes

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use blockflow_engine::model::CircuitRecord;
use blockflow_engine::EngineError;

use super::common::{ApiError, ErrorResponse};
use super::AppState;

/// Create circuit routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/circuits/:circuit_id", get(get_circuit))
        .route("/api/circuits/:circuit_id/reset", post(reset_circuit))
        .with_state(state)
}

/// GET /api/circuits/{circuit_id} - Current breaker state
///
/// Circuits that never recorded a call report as closed.
#[utoipa::path(
    get,
    path = "/api/circuits/{circuit_id}",
    params(
        ("circuit_id" = String, Path, description = "Circuit ID")
    ),
    responses(
        (status = 200, description = "Circuit state", body = CircuitRecord),
        (status = 500, description = "Store unavailable", body = ErrorResponse)
    ),
    tag = "circuits"
)]
pub async fn get_circuit(
    State(state): State<AppState>,
    Path(circuit_id): Path<String>,
) -> Result<Json<CircuitRecord>, ApiError> {
    let record = state
        .engine
        .breakers()
        .state(&circuit_id)
        .await
        .map_err(EngineError::from)?;
    Ok(Json(record))
}

/// POST /api/circuits/{circuit_id}/reset - Force a circuit closed
#[utoipa::path(
    post,
    path = "/api/circuits/{circuit_id}/reset",
    params(
        ("circuit_id" = String, Path, description = "Circuit ID")
    ),
    responses(
        (status = 200, description = "Circuit closed", body = CircuitRecord),
        (status = 503, description = "Circuit row contended", body = ErrorResponse)
    ),
    tag = "circuits"
)]
pub async fn reset_circuit(
    State(state): State<AppState>,
    Path(circuit_id): Path<String>,
) -> Result<Json<CircuitRecord>, ApiError> {
    let record = state
        .engine
        .breakers()
        .reset(&circuit_id)
        .await
        .map_err(EngineError::from)?;
    tracing::info!(%circuit_id, "circuit reset by operator");
    Ok(Json(record))
}

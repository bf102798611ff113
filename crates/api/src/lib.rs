// Blockflow API library
// Decision: The router is built here so the server binary and the HTTP tests share it

pub mod api;
pub mod config;
pub mod openapi;

pub use config::ApiConfig;

use axum::http::{header, HeaderValue, Method};
use axum::{routing::get, Json, Router};
use blockflow_engine::Engine;
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::AppState;
use crate::openapi::ApiDoc;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build the full HTTP application around an engine
pub fn app(engine: Engine, config: &ApiConfig) -> Router {
    let state = AppState::new(engine);

    let api_routes = Router::new()
        .merge(api::workflows::routes(state.clone()))
        .merge(api::executions::routes(state.clone()))
        .merge(api::queue::routes(state.clone()))
        .merge(api::circuits::routes(state));

    let app = Router::new()
        .route("/health", get(health))
        .merge(api_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()));

    let cors_origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    // Add CORS layer only if origins are configured
    let app = if cors_origins.is_empty() {
        app
    } else {
        app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(cors_origins))
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]),
        )
    };

    app.layer(TraceLayer::new_for_http())
}

pub mod response;

use crate::config::Config;
use crate::features::{self, FeatureState};
use crate::middleware;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use sqlx::PgPool;
use tower_http::compression::CompressionLayer;

#[derive(Clone)]
pub struct AppState {
    /// Pool backing the record store; absent with the in-memory store
    pub db: Option<PgPool>,
    pub features: FeatureState,
}

/// Create the application router with all routes and middleware
pub fn create_router(state: AppState, config: &Config) -> Router {
    let api_v1 = features::router(state.features.clone());

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .with_state(state)
        .nest("/api/v1", api_v1)
        // Apply layers from innermost to outermost
        .layer(CompressionLayer::new())
        .layer(middleware::tracing_layer())
        .layer(middleware::cors_layer(&config.cors))
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "name": "SDAS Server",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

/// Health check handler
async fn health(State(state): State<AppState>) -> Result<Response, StatusCode> {
    let Some(db) = &state.db else {
        return Ok((StatusCode::OK, Json(json!({"status": "healthy", "database": "in-memory"})))
            .into_response());
    };

    match sqlx::query("SELECT 1").fetch_one(db).await {
        Ok(_) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected"
            })),
        )
            .into_response()),
        Err(e) => {
            tracing::error!("Database health check failed: {:?}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        },
    }
}

//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};

use crate::json::HealthResponse;
use crate::AppState;

/// Health check routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let run_store = state.store.ping().await.is_ok();

    Json(HealthResponse {
        status: if run_store { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        run_store,
    })
}

//! Health and statistics endpoints

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};

use crate::http::AppState;

pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

/// Live rooms, connections, producers and consumers
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.stats())
}

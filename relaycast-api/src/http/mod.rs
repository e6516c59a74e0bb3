//! HTTP server: health, stats and the signaling websocket

mod health;
mod websocket;

use axum::Router;
use relaycast_sfu::SfuManager;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use health::{health_check, stats};
pub use websocket::{websocket_handler, DEFAULT_ROOM};

/// Default websocket frame limit; signaling frames are small
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SfuManager>,
    pub max_message_size: usize,
}

impl AppState {
    pub const fn new(manager: Arc<SfuManager>) -> Self {
        Self {
            manager,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    #[must_use]
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::create_health_router())
        .merge(websocket::create_websocket_router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        // Apply state to all routes (must be last)
        .with_state(state)
}

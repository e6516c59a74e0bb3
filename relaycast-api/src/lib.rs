// Relaycast API Library
//
// HTTP and websocket signaling server for relaycast

pub mod http;
pub mod impls;

// Re-export commonly used types
pub use http::{create_router, AppState};
pub use impls::{spawn_pipe, SignalingHandler};

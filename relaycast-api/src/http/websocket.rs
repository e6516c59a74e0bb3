//! Signaling websocket
//!
//! Adapts axum's websocket to the [`StreamMessage`] trait; all signaling logic
//! lives in [`SignalingHandler`].

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use relaycast_proto::{ClientFrame, ServerFrame};
use relaycast_sfu::RoomId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::http::AppState;
use crate::impls::{MessageSender, SignalingHandler, StreamMessage};

/// Room joined by `/ws`
pub const DEFAULT_ROOM: &str = "default";

/// Outgoing frames buffered per connection before the peer counts as too slow
const SEND_BUFFER_SIZE: usize = 256;

pub fn create_websocket_router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(default_room_handler))
        .route("/ws/{room_id}", get(websocket_handler))
}

struct WebSocketStream {
    receiver: SplitStream<WebSocket>,
    sender: WebSocketMessageSender,
    is_alive: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl StreamMessage for WebSocketStream {
    async fn recv(&mut self) -> Option<Result<ClientFrame, String>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(ClientFrame::decode(text.as_str()).map_err(|e| e.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket receive failed");
                    return None;
                }
                // Ping, pong and binary frames carry no signaling
                Some(Ok(_)) => {}
            }
        }
    }

    fn send(&self, frame: ServerFrame) -> Result<(), String> {
        MessageSender::send(&self.sender, frame)
    }

    fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
struct WebSocketMessageSender {
    sender: mpsc::Sender<String>,
}

impl MessageSender for WebSocketMessageSender {
    fn send(&self, frame: ServerFrame) -> Result<(), String> {
        let text = frame.encode().map_err(|e| e.to_string())?;
        self.sender.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                "Channel full: WebSocket client too slow to consume messages".to_string()
            }
            mpsc::error::TrySendError::Closed(_) => {
                "Channel closed: WebSocket client disconnected".to_string()
            }
        })
    }
}

async fn default_room_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(state, RoomId::new(DEFAULT_ROOM), ws)
}

/// Signaling websocket bound to a room
pub async fn websocket_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade(state, RoomId::new(room_id), ws)
}

fn upgrade(state: AppState, room_id: RoomId, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, room_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, room_id: RoomId) {
    info!(room_id = %room_id, "WebSocket connection established");

    let (tx, mut rx) = mpsc::channel::<String>(SEND_BUFFER_SIZE);
    let is_alive = Arc::new(AtomicBool::new(true));
    let (mut sink, receiver) = socket.split();

    let writer_alive = Arc::clone(&is_alive);
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                error!(error = %e, "Failed to send WebSocket message");
                writer_alive.store(false, Ordering::Relaxed);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let sender = WebSocketMessageSender { sender: tx };
    let handler = SignalingHandler::new(
        Arc::clone(&state.manager),
        room_id.clone(),
        Arc::new(sender.clone()),
    );
    let mut stream = WebSocketStream {
        receiver,
        sender,
        is_alive,
    };

    if let Err(e) = handler.run(&mut stream).await {
        warn!(room_id = %room_id, error = %e, "Signaling connection refused");
    }

    // Dropping the last sender lets the writer flush and close the socket
    drop(stream);
    if let Err(e) = writer.await {
        error!(error = %e, "WebSocket writer task failed");
    }
    info!(room_id = %room_id, "WebSocket connection closed");
}

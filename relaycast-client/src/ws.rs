//! Websocket transport for [`SignalingClient`]

use futures::{SinkExt, StreamExt};
use relaycast_proto::{ClientFrame, ServerFrame};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::channel::SignalingClient;
use crate::error::{NegotiationError, Result};

const FRAME_BUFFER: usize = 64;

/// Open a websocket to the signaling server and start a client on it
pub async fn connect(url: &str) -> Result<SignalingClient> {
    let (socket, _) = connect_async(url)
        .await
        .map_err(|e| NegotiationError::TransportFailure(format!("connect to {url}: {e}")))?;
    info!(url = %url, "Signaling websocket connected");

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientFrame>(FRAME_BUFFER);
    let (inbound_tx, inbound_rx) = mpsc::channel::<ServerFrame>(FRAME_BUFFER);

    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(event = %frame.event, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                warn!(error = %e, "Websocket send failed");
                break;
            }
        }
        let _ = sink.close().await;
        debug!("Websocket writer stopped");
    });

    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "Websocket receive failed");
                    break;
                }
            };
            match ServerFrame::decode(text.as_str()) {
                Ok(frame) => {
                    if inbound_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring undecodable server frame"),
            }
        }
        debug!("Websocket reader stopped");
    });

    Ok(SignalingClient::new(outbound_tx, inbound_rx))
}

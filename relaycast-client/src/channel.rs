//! Signaling client with request/reply correlation
//!
//! Frames travel over a pair of mpsc channels so the same client runs on top of
//! a websocket (see [`crate::ws`]) or an in-memory pipe. A dispatcher task owns
//! the inbound side: replies resolve the pending request with the same id,
//! server notifications are fanned out to subscribers.

use parking_lot::Mutex;
use relaycast_proto::{ClientFrame, Notification, Request, ServerEvent, ServerFrame};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{NegotiationError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Pending replies keyed by request id; `None` once the inbound side ended
type PendingReplies = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Value>>>>>;

pub struct SignalingClient {
    outbound: mpsc::Sender<ClientFrame>,
    pending: PendingReplies,
    next_id: AtomicU64,
    socket_id: watch::Receiver<Option<String>>,
    events: broadcast::Sender<ServerEvent>,
    request_timeout: Option<Duration>,
    dispatcher: AbortHandle,
}

impl SignalingClient {
    /// Start a client over an outbound frame sender and an inbound frame receiver
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(outbound: mpsc::Sender<ClientFrame>, inbound: mpsc::Receiver<ServerFrame>) -> Self {
        let pending: PendingReplies = Arc::new(Mutex::new(Some(HashMap::new())));
        let (socket_tx, socket_id) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let dispatcher = tokio::spawn(dispatch(
            inbound,
            Arc::clone(&pending),
            socket_tx,
            events.clone(),
        ))
        .abort_handle();

        Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            socket_id,
            events,
            request_timeout: None,
            dispatcher,
        }
    }

    /// Fail requests that get no reply within `timeout`
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Send a request and wait for its reply
    pub async fn request<R: Request>(&self, request: &R) -> Result<R::Reply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = ClientFrame::request(id, request)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        match self.pending.lock().as_mut() {
            Some(pending) => pending.insert(id, reply_tx),
            None => return Err(NegotiationError::ChannelClosed),
        };

        debug!(id, event = R::EVENT, "Sending request");
        if self.outbound.send(frame).await.is_err() {
            self.forget(id);
            return Err(NegotiationError::ChannelClosed);
        }

        let data = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.forget(id);
                    warn!(id, event = R::EVENT, "Request timed out");
                    return Err(NegotiationError::Timeout {
                        event: R::EVENT.to_string(),
                    });
                }
            },
            None => reply_rx.await,
        }
        .map_err(|_| NegotiationError::ChannelClosed)?;

        serde_json::from_value(data).map_err(|e| {
            NegotiationError::Protocol(format!("invalid reply to {}: {e}", R::EVENT))
        })
    }

    /// Send a fire-and-forget notification
    pub async fn notify<N: Notification>(&self, notification: &N) -> Result<()> {
        let frame = ClientFrame::notification(notification)?;
        debug!(event = N::EVENT, "Sending notification");
        self.outbound
            .send(frame)
            .await
            .map_err(|_| NegotiationError::ChannelClosed)
    }

    /// Wait for the server's `connection-success` and return the socket id
    pub async fn wait_connected(&self) -> Result<String> {
        let mut socket_id = self.socket_id.clone();
        let id = socket_id
            .wait_for(Option::is_some)
            .await
            .map_err(|_| NegotiationError::ChannelClosed)?;
        id.clone().ok_or(NegotiationError::ChannelClosed)
    }

    #[must_use]
    pub fn socket_id(&self) -> Option<String> {
        self.socket_id.borrow().clone()
    }

    /// Server notifications received after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed() || self.pending.lock().is_none()
    }

    fn forget(&self, id: u64) {
        if let Some(pending) = self.pending.lock().as_mut() {
            pending.remove(&id);
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(
    mut inbound: mpsc::Receiver<ServerFrame>,
    pending: PendingReplies,
    socket_id: watch::Sender<Option<String>>,
    events: broadcast::Sender<ServerEvent>,
) {
    while let Some(frame) = inbound.recv().await {
        if let Some(id) = frame.id {
            let waiter = pending.lock().as_mut().and_then(|p| p.remove(&id));
            match waiter {
                Some(waiter) => {
                    // The requester may have timed out in the meantime
                    let _ = waiter.send(frame.data);
                }
                None => debug!(id, "Discarding reply without pending request"),
            }
            continue;
        }

        let Some(event) = frame.event else {
            warn!("Discarding frame with neither id nor event");
            continue;
        };
        match ServerEvent::decode(&event, frame.data) {
            Ok(ServerEvent::ConnectionSuccess(success)) => {
                debug!(socket_id = %success.socket_id, "Signaling connection established");
                socket_id.send_replace(Some(success.socket_id.clone()));
                let _ = events.send(ServerEvent::ConnectionSuccess(success));
            }
            Ok(other) => {
                let _ = events.send(other);
            }
            Err(e) => warn!(event = %event, error = %e, "Ignoring server notification"),
        }
    }

    debug!("Signaling channel closed, failing pending requests");
    // Dropping the senders wakes every waiter with ChannelClosed
    pending.lock().take();
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycast_proto::{
        events, Ack, ConnectionSuccess, ConsumerClosed, ConsumerResume, GetRouterRtpCapabilities,
        Reply,
    };
    use serde_json::json;

    fn pipe() -> (SignalingClient, mpsc::Receiver<ClientFrame>, mpsc::Sender<ServerFrame>) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        (SignalingClient::new(out_tx, in_rx), out_rx, in_tx)
    }

    #[tokio::test]
    async fn test_reply_resolves_matching_request() {
        let (client, mut server_rx, server_tx) = pipe();

        let server = tokio::spawn(async move {
            let frame = server_rx.recv().await.expect("request");
            assert_eq!(frame.event, events::GET_ROUTER_RTP_CAPABILITIES);
            let id = frame.id.expect("request id");
            // A stale reply first, then the real one
            server_tx
                .send(ServerFrame { id: Some(id + 100), event: None, data: json!({}) })
                .await
                .expect("send");
            server_tx
                .send(ServerFrame {
                    id: Some(id),
                    event: None,
                    data: json!({"routerRtpCapabilities": {"codecs": []}}),
                })
                .await
                .expect("send");
            server_tx
        });

        let reply = client
            .request(&GetRouterRtpCapabilities)
            .await
            .expect("reply")
            .into_result()
            .expect("capabilities");
        assert_eq!(reply.router_rtp_capabilities.as_value(), &json!({"codecs": []}));
        drop(server.await.expect("server task"));
    }

    #[tokio::test]
    async fn test_connection_success_sets_socket_id() {
        let (client, _server_rx, server_tx) = pipe();
        let mut events = client.subscribe();

        server_tx
            .send(ServerFrame::notification(&ConnectionSuccess { socket_id: "s-1".to_string() }).expect("frame"))
            .await
            .expect("send");
        server_tx
            .send(
                ServerFrame::notification(&ConsumerClosed {
                    consumer_id: "c".to_string(),
                    producer_id: "p".to_string(),
                })
                .expect("frame"),
            )
            .await
            .expect("send");

        assert_eq!(client.wait_connected().await.expect("connected"), "s-1");
        assert_eq!(client.socket_id().as_deref(), Some("s-1"));
        assert!(matches!(events.recv().await, Ok(ServerEvent::ConnectionSuccess(_))));
        assert!(matches!(events.recv().await, Ok(ServerEvent::ConsumerClosed(_))));
    }

    #[tokio::test]
    async fn test_channel_loss_fails_pending_request() {
        let (client, mut server_rx, server_tx) = pipe();

        let server = tokio::spawn(async move {
            let _ = server_rx.recv().await;
            drop(server_tx);
        });

        let err = client
            .request(&relaycast_proto::ConnectTransport {
                dtls_parameters: relaycast_proto::DtlsParameters::new(json!({})),
            })
            .await
            .unwrap_err();
        assert_eq!(err, NegotiationError::ChannelClosed);
        server.await.expect("server task");
        assert!(client.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let (client, _server_rx, _server_tx) = pipe();
        let client = client.with_timeout(Duration::from_secs(2));

        let err = client.request(&GetRouterRtpCapabilities).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Timeout { ref event } if event == "getRouterRtpCapabilities"));
    }

    #[tokio::test]
    async fn test_notification_has_no_id() {
        let (client, mut server_rx, _server_tx) = pipe();
        client
            .notify(&ConsumerResume { consumer_id: Some("c1".to_string()) })
            .await
            .expect("notify");

        let frame = server_rx.recv().await.expect("frame");
        assert!(frame.id.is_none());
        assert_eq!(frame.event, events::CONSUMER_RESUME);
    }

    #[tokio::test]
    async fn test_error_reply_decodes_as_failure() {
        let (client, mut server_rx, server_tx) = pipe();
        tokio::spawn(async move {
            let frame = server_rx.recv().await.expect("request");
            let body = json!({"error": "StateError", "reason": "NoSuchTransport"});
            server_tx
                .send(ServerFrame { id: frame.id, event: None, data: body })
                .await
                .expect("send");
            // keep the pipe open until the client is done
            let _ = server_rx.recv().await;
        });

        let reply: Reply<Ack> = client
            .request(&relaycast_proto::ConnectRecvTransport {
                dtls_parameters: relaycast_proto::DtlsParameters::new(json!({})),
            })
            .await
            .expect("reply");
        let err = NegotiationError::from(reply.into_result().unwrap_err());
        assert_eq!(err.reason(), Some(relaycast_proto::StateReason::NoSuchTransport));
    }
}

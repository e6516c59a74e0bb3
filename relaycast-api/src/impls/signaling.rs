//! Transport-agnostic signaling connection handler
//!
//! The websocket route and the in-memory pipe both feed a
//! [`SignalingHandler`] through the [`StreamMessage`] trait. The handler binds
//! the connection to a routing context, processes requests strictly in arrival
//! order on a worker task, and tears everything down when the stream ends.

use relaycast_proto::{
    Ack, CapabilitiesReply, ClientEvent, ClientFrame, ConnectionSuccess, ConsumeReply,
    ConsumerClosed, CreateTransportReply, ErrorPayload, Notification, ProduceReply, Reply,
    ServerFrame,
};
use relaycast_sfu::{
    ConsumerId, EngineEvent, ProducerId, RoomEvent, RoomId, SfuError, SfuManager,
    TransportCoordinator, TransportId, TransportRole,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Requests waiting for the worker, per connection
const REQUEST_QUEUE_SIZE: usize = 64;

/// Trait for sending server frames to a peer
pub trait MessageSender: Send + Sync {
    fn send(&self, frame: ServerFrame) -> Result<(), String>;
}

/// Bidirectional frame stream of one signaling connection
#[async_trait::async_trait]
pub trait StreamMessage: Send {
    /// Next client frame; `None` once the peer is gone
    async fn recv(&mut self) -> Option<Result<ClientFrame, String>>;

    fn send(&self, frame: ServerFrame) -> Result<(), String>;

    fn is_alive(&self) -> bool;
}

/// Per-connection signaling handler
pub struct SignalingHandler {
    manager: Arc<SfuManager>,
    room_id: RoomId,
    sender: Arc<dyn MessageSender>,
}

impl SignalingHandler {
    pub fn new(manager: Arc<SfuManager>, room_id: RoomId, sender: Arc<dyn MessageSender>) -> Self {
        Self {
            manager,
            room_id,
            sender,
        }
    }

    /// Serve the connection until the stream ends
    pub async fn run(self, stream: &mut dyn StreamMessage) -> Result<(), SfuError> {
        let coordinator = self.manager.open_connection(&self.room_id).await?;
        let connection_id = coordinator.connection_id().clone();

        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let worker = tokio::spawn(run_worker(
            Arc::clone(&coordinator),
            Arc::clone(&self.sender),
            request_rx,
            coordinator.room().subscribe(),
            self.manager.engine().subscribe(),
        ));

        send_notification(
            self.sender.as_ref(),
            &ConnectionSuccess {
                socket_id: connection_id.to_string(),
            },
        );

        let cancel = coordinator.cancellation_token();
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => {
                    debug!(connection_id = %connection_id, "Connection closed by the server");
                    break;
                }
                message = stream.recv() => message,
            };
            let Some(message) = message else { break };
            match message {
                Ok(frame) => {
                    if request_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(connection_id = %connection_id, error = %e, "Dropping unreadable frame"),
            }
            if !stream.is_alive() {
                break;
            }
        }

        drop(request_tx);
        coordinator.cancel();
        if let Err(e) = worker.await {
            error!(connection_id = %connection_id, error = %e, "Signaling worker failed");
        }
        self.manager.close_connection(&connection_id).await;

        info!(
            connection_id = %connection_id,
            room_id = %self.room_id,
            "Signaling connection finished"
        );
        Ok(())
    }
}

async fn run_worker(
    coordinator: Arc<TransportCoordinator>,
    sender: Arc<dyn MessageSender>,
    mut requests: mpsc::Receiver<ClientFrame>,
    mut room_events: broadcast::Receiver<RoomEvent>,
    mut engine_events: broadcast::Receiver<EngineEvent>,
) {
    let cancel = coordinator.cancellation_token();
    let connection_id = coordinator.connection_id().clone();

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = requests.recv() => {
                let Some(frame) = frame else { break };
                if let Some(reply) = handle_frame(&coordinator, frame).await {
                    if let Err(e) = sender.send(reply) {
                        warn!(connection_id = %connection_id, error = %e, "Failed to send reply");
                    }
                }
            }
            event = room_events.recv() => match event {
                Ok(RoomEvent::ProducerClosed { producer_id, .. }) => {
                    for closed in coordinator.on_producer_closed(&producer_id).await {
                        send_notification(
                            sender.as_ref(),
                            &ConsumerClosed {
                                consumer_id: closed.consumer_id.to_string(),
                                producer_id: closed.producer_id.to_string(),
                            },
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(connection_id = %connection_id, skipped, "Room events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = engine_events.recv() => match event {
                Ok(event) => coordinator.on_engine_event(&event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(connection_id = %connection_id, skipped, "Engine events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    debug!(connection_id = %connection_id, "Signaling worker stopped");
}

/// Process one client frame; returns the reply for requests
pub async fn handle_frame(coordinator: &TransportCoordinator, frame: ClientFrame) -> Option<ServerFrame> {
    let connection_id = coordinator.connection_id();
    let event = match ClientEvent::decode(&frame.event, frame.data) {
        Ok(event) => event,
        Err(e) => {
            warn!(connection_id = %connection_id, event = %frame.event, error = %e, "Invalid client frame");
            return frame
                .id
                .and_then(|id| encode_reply(id, &ErrorPayload::protocol(&e)));
        }
    };

    if !event.expects_reply() {
        handle_notification(coordinator, event).await;
        return None;
    }
    let Some(id) = frame.id else {
        warn!(connection_id = %connection_id, event = event.name(), "Ignoring request without id");
        return None;
    };

    debug!(connection_id = %connection_id, id, event = event.name(), "Handling request");
    match event {
        ClientEvent::GetRouterRtpCapabilities => {
            let result = coordinator
                .get_capabilities()
                .map(|capabilities| CapabilitiesReply {
                    router_rtp_capabilities: capabilities,
                });
            encode_reply(id, &to_reply(result))
        }
        ClientEvent::CreateWebRtcTransport(request) => {
            let result = coordinator
                .create_transport(TransportRole::from_sender(request.sender))
                .await;
            encode_reply(
                id,
                &CreateTransportReply {
                    params: to_reply(result),
                },
            )
        }
        ClientEvent::ConnectTransport(request) => {
            let result = coordinator
                .connect_transport(TransportRole::Send, &request.dtls_parameters)
                .await
                .map(|()| Ack {});
            encode_reply(id, &to_reply(result))
        }
        ClientEvent::ConnectRecvTransport(request) => {
            let result = coordinator
                .connect_transport(TransportRole::Recv, &request.dtls_parameters)
                .await
                .map(|()| Ack {});
            encode_reply(id, &to_reply(result))
        }
        ClientEvent::Produce(request) => {
            let result = coordinator
                .produce(
                    request.transport_id.map(TransportId::new),
                    request.kind,
                    request.rtp_parameters,
                    request.app_data,
                )
                .await
                .map(|producer_id| ProduceReply {
                    id: producer_id.to_string(),
                });
            encode_reply(id, &to_reply(result))
        }
        ClientEvent::Consume(request) => {
            let result = coordinator
                .consume(
                    request.rtp_capabilities,
                    request.producer_id.map(ProducerId::new),
                )
                .await;
            encode_reply(
                id,
                &ConsumeReply {
                    params: to_reply(result),
                },
            )
        }
        ClientEvent::ConsumerResume(_) | ClientEvent::ProducerClose(_) => None,
    }
}

async fn handle_notification(coordinator: &TransportCoordinator, event: ClientEvent) {
    let connection_id = coordinator.connection_id();
    match event {
        ClientEvent::ConsumerResume(resume) => {
            let consumer_id = resume.consumer_id.map(ConsumerId::new);
            match coordinator.resume_consumer(consumer_id.as_ref()).await {
                Ok(resumed) => debug!(connection_id = %connection_id, resumed, "Consumers resumed"),
                Err(e) => warn!(connection_id = %connection_id, error = %e, "Failed to resume consumer"),
            }
        }
        ClientEvent::ProducerClose(close) => {
            let producer_id = ProducerId::new(close.producer_id);
            if let Err(e) = coordinator.close_producer(&producer_id).await {
                warn!(
                    connection_id = %connection_id,
                    producer_id = %producer_id,
                    error = %e,
                    "Failed to close producer"
                );
            }
        }
        other => debug!(connection_id = %connection_id, event = other.name(), "Not a notification"),
    }
}

fn to_reply<T>(result: Result<T, SfuError>) -> Reply<T> {
    Reply::from(result.map_err(ErrorPayload::from))
}

fn encode_reply<T: Serialize>(id: u64, body: &T) -> Option<ServerFrame> {
    ServerFrame::reply(id, body)
        .inspect_err(|e| error!(id, error = %e, "Failed to encode reply"))
        .ok()
}

fn send_notification<N: Notification>(sender: &dyn MessageSender, notification: &N) {
    let frame = match ServerFrame::notification(notification) {
        Ok(frame) => frame,
        Err(e) => {
            error!(event = N::EVENT, error = %e, "Failed to encode notification");
            return;
        }
    };
    if let Err(e) = sender.send(frame) {
        warn!(event = N::EVENT, error = %e, "Failed to send notification");
    }
}

/// In-memory sender backed by a bounded channel
pub struct ChannelSender {
    sender: mpsc::Sender<ServerFrame>,
}

impl ChannelSender {
    pub const fn new(sender: mpsc::Sender<ServerFrame>) -> Self {
        Self { sender }
    }
}

impl MessageSender for ChannelSender {
    fn send(&self, frame: ServerFrame) -> Result<(), String> {
        self.sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => "Channel full: peer too slow".to_string(),
            mpsc::error::TrySendError::Closed(_) => "Channel closed: peer disconnected".to_string(),
        })
    }
}

/// In-memory [`StreamMessage`] over a pair of channels
pub struct ChannelStream {
    receiver: mpsc::Receiver<ClientFrame>,
    sender: ChannelSender,
}

impl ChannelStream {
    pub const fn new(receiver: mpsc::Receiver<ClientFrame>, sender: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            receiver,
            sender: ChannelSender::new(sender),
        }
    }
}

#[async_trait::async_trait]
impl StreamMessage for ChannelStream {
    async fn recv(&mut self) -> Option<Result<ClientFrame, String>> {
        self.receiver.recv().await.map(Ok)
    }

    fn send(&self, frame: ServerFrame) -> Result<(), String> {
        self.sender.send(frame)
    }

    fn is_alive(&self) -> bool {
        !self.sender.sender.is_closed()
    }
}

/// Serve one connection over in-memory channels
///
/// Returns the client's ends: the frame sender and the frame receiver. The
/// connection ends when the returned sender is dropped.
pub fn spawn_pipe(
    manager: Arc<SfuManager>,
    room_id: RoomId,
    buffer: usize,
) -> (mpsc::Sender<ClientFrame>, mpsc::Receiver<ServerFrame>) {
    let (client_tx, client_rx) = mpsc::channel(buffer);
    let (server_tx, server_rx) = mpsc::channel(buffer);

    tokio::spawn(async move {
        let sender = Arc::new(ChannelSender::new(server_tx.clone()));
        let mut stream = ChannelStream::new(client_rx, server_tx);
        let handler = SignalingHandler::new(manager, room_id.clone(), sender);
        if let Err(e) = handler.run(&mut stream).await {
            warn!(room_id = %room_id, error = %e, "Signaling connection refused");
        }
    });

    (client_tx, server_rx)
}

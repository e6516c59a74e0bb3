//! Client-side session negotiation
//!
//! Drives capabilities, transports, producing and consuming against the server
//! over a [`SignalingClient`]. The send path and the receive path progress
//! independently: a failure on one never resets the other.

use relaycast_proto::{
    Consume, ConsumerResume, CreateWebRtcTransport, GetRouterRtpCapabilities, ProducerClose,
    RtpCapabilities, ServerEvent, StateReason,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::channel::SignalingClient;
use crate::error::{NegotiationError, Result};
use crate::listener::SignalingListener;
use crate::media::{
    Direction, LocalConsumer, LocalMediaContext, LocalProducer, LocalTrack, LocalTransport,
    MediaConstraints, MediaSource, MediaView, ProduceOptions,
};

/// Observable negotiation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    CapabilitiesRequested,
    ContextReady,
    SendTransportPending,
    SendTransportConnected,
    Producing,
    RecvTransportPending,
    RecvTransportConnected,
    Consuming,
    /// The local media context rejected the router capabilities. Terminal.
    Unsupported,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ContextStage {
    Idle,
    Requested,
    Ready(RtpCapabilities),
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathStage {
    Idle,
    Pending,
    Connected,
    /// Producing on the send path, consuming on the receive path
    Active,
}

struct SendPath {
    stage: PathStage,
    transport: Option<Arc<dyn LocalTransport>>,
    producer: Option<LocalProducer>,
}

struct RecvPath {
    stage: PathStage,
    transport: Option<Arc<dyn LocalTransport>>,
    consumers: Vec<LocalConsumer>,
}

impl SendPath {
    const fn new() -> Self {
        Self {
            stage: PathStage::Idle,
            transport: None,
            producer: None,
        }
    }

    fn reset(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.producer = None;
        self.stage = PathStage::Idle;
    }
}

impl RecvPath {
    const fn new() -> Self {
        Self {
            stage: PathStage::Idle,
            transport: None,
            consumers: Vec::new(),
        }
    }

    fn reset(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.consumers.clear();
        self.stage = PathStage::Idle;
    }
}

pub struct SessionNegotiator {
    client: Arc<SignalingClient>,
    context: Arc<dyn LocalMediaContext>,
    source: Arc<dyn MediaSource>,
    view: Arc<dyn MediaView>,
    context_stage: ContextStage,
    local_track: Option<LocalTrack>,
    send: SendPath,
    recv: RecvPath,
}

impl SessionNegotiator {
    pub fn new(
        client: Arc<SignalingClient>,
        context: Arc<dyn LocalMediaContext>,
        source: Arc<dyn MediaSource>,
        view: Arc<dyn MediaView>,
    ) -> Self {
        Self {
            client,
            context,
            source,
            view,
            context_stage: ContextStage::Idle,
            local_track: None,
            send: SendPath::new(),
            recv: RecvPath::new(),
        }
    }

    #[must_use]
    pub fn client(&self) -> &Arc<SignalingClient> {
        &self.client
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        if matches!(self.context_stage, ContextStage::Unsupported(_)) {
            return Phase::Unsupported;
        }
        match self.recv.stage {
            PathStage::Active => return Phase::Consuming,
            PathStage::Connected => return Phase::RecvTransportConnected,
            PathStage::Pending => return Phase::RecvTransportPending,
            PathStage::Idle => {}
        }
        match self.send.stage {
            PathStage::Active => return Phase::Producing,
            PathStage::Connected => return Phase::SendTransportConnected,
            PathStage::Pending => return Phase::SendTransportPending,
            PathStage::Idle => {}
        }
        match self.context_stage {
            ContextStage::Idle => Phase::Idle,
            ContextStage::Requested => Phase::CapabilitiesRequested,
            ContextStage::Ready(_) => Phase::ContextReady,
            ContextStage::Unsupported(_) => Phase::Unsupported,
        }
    }

    #[must_use]
    pub const fn local_track(&self) -> Option<&LocalTrack> {
        self.local_track.as_ref()
    }

    #[must_use]
    pub const fn producer(&self) -> Option<&LocalProducer> {
        self.send.producer.as_ref()
    }

    #[must_use]
    pub fn consumers(&self) -> &[LocalConsumer] {
        &self.recv.consumers
    }

    fn ensure_supported(&self) -> Result<()> {
        match &self.context_stage {
            ContextStage::Unsupported(reason) => {
                Err(NegotiationError::UnsupportedContext(reason.clone()))
            }
            _ => Ok(()),
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        self.ensure_supported()?;
        match self.context_stage {
            ContextStage::Ready(_) => Ok(()),
            _ => Err(NegotiationError::out_of_order(
                "router capabilities not loaded",
            )),
        }
    }

    /// Fetch the router capabilities and load them into the local media context
    pub async fn request_capabilities(&mut self) -> Result<RtpCapabilities> {
        self.ensure_supported()?;
        if let ContextStage::Ready(capabilities) = &self.context_stage {
            return Ok(capabilities.clone());
        }

        self.context_stage = ContextStage::Requested;
        let reply = match self.client.request(&GetRouterRtpCapabilities).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "Failed to fetch router capabilities");
                self.context_stage = ContextStage::Idle;
                return Err(err);
            }
        };

        let capabilities = match reply.into_result() {
            Ok(reply) => reply.router_rtp_capabilities,
            Err(payload) => {
                warn!(error = %payload, "Router capabilities refused");
                self.context_stage = ContextStage::Idle;
                return Err(NegotiationError::from(payload));
            }
        };
        if let Err(err) = self.context.load(&capabilities).await {
            let reason = match err {
                NegotiationError::UnsupportedContext(reason) => reason,
                other => other.to_string(),
            };
            warn!(reason = %reason, "Local media context cannot load router capabilities");
            self.context_stage = ContextStage::Unsupported(reason.clone());
            return Err(NegotiationError::UnsupportedContext(reason));
        }

        info!("Router capabilities loaded");
        self.context_stage = ContextStage::Ready(capabilities.clone());
        Ok(capabilities)
    }

    /// Capture a local track and show it in the preview
    pub async fn acquire_local_media(&mut self, constraints: &MediaConstraints) -> Result<LocalTrack> {
        self.ensure_supported()?;

        let track = self.source.acquire(constraints).await.map_err(|err| {
            warn!(error = %err, "Failed to acquire local media");
            match err {
                NegotiationError::MediaAcquisition(_) => err,
                other => NegotiationError::MediaAcquisition(other.to_string()),
            }
        })?;

        self.view.attach_local(&track);
        debug!(track_id = %track.id, kind = %track.kind, "Local media acquired");
        self.local_track = Some(track.clone());
        Ok(track)
    }

    async fn establish(&self, direction: Direction) -> Result<Arc<dyn LocalTransport>> {
        let reply = self
            .client
            .request(&CreateWebRtcTransport {
                sender: direction == Direction::Send,
            })
            .await?;
        let params = reply.params.into_result()?;
        let transport_id = params.id.clone();

        let listener = Arc::new(SignalingListener::new(
            Arc::clone(&self.client),
            direction,
            transport_id.clone(),
        ));
        let transport = self.context.create_transport(direction, params, listener)?;
        if let Err(err) = transport.connect().await {
            transport.close();
            return Err(err);
        }

        info!(transport_id = %transport_id, direction = %direction, "Transport connected");
        Ok(transport)
    }

    /// Create and connect the send transport
    pub async fn open_send_transport(&mut self) -> Result<()> {
        self.ensure_ready()?;
        if self.local_track.is_none() {
            return Err(NegotiationError::out_of_order("no local track to send"));
        }
        if self.send.stage != PathStage::Idle {
            return Err(NegotiationError::out_of_order("send transport already open"));
        }

        self.send.stage = PathStage::Pending;
        match self.establish(Direction::Send).await {
            Ok(transport) => {
                self.send.transport = Some(transport);
                self.send.stage = PathStage::Connected;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Send transport setup failed");
                self.send.reset();
                Err(err)
            }
        }
    }

    /// Send the local track
    pub async fn produce(&mut self, options: &ProduceOptions) -> Result<LocalProducer> {
        self.ensure_supported()?;
        let transport = match (self.send.stage, &self.send.transport) {
            (PathStage::Connected, Some(transport)) => Arc::clone(transport),
            (PathStage::Active, _) => {
                return Err(NegotiationError::out_of_order("already producing"));
            }
            _ => return Err(NegotiationError::out_of_order("send transport not connected")),
        };
        let track = self
            .local_track
            .clone()
            .ok_or_else(|| NegotiationError::out_of_order("no local track to send"))?;

        let producer = transport.produce(&track, options).await.inspect_err(|err| {
            warn!(track_id = %track.id, error = %err, "Produce failed");
        })?;

        info!(producer_id = %producer.id, kind = %producer.kind, "Producing");
        self.send.producer = Some(producer.clone());
        self.send.stage = PathStage::Active;
        Ok(producer)
    }

    /// Stop sending and tell the server
    pub async fn close_producer(&mut self) -> Result<()> {
        let producer = self.send.producer.take().ok_or_else(|| {
            NegotiationError::state(StateReason::NoSuchProducer, "not producing")
        })?;
        if let Some(transport) = &self.send.transport {
            transport.close_producer(&producer.id);
        }
        self.send.stage = PathStage::Connected;

        info!(producer_id = %producer.id, "Producer closed");
        self.client
            .notify(&ProducerClose {
                producer_id: producer.id,
            })
            .await
    }

    /// The capture source ended a track
    pub async fn on_track_ended(&mut self, track_id: &str) -> Result<()> {
        if self.local_track.as_ref().is_some_and(|t| t.id == track_id) {
            self.local_track = None;
        }
        let produced = self
            .send
            .producer
            .as_ref()
            .is_some_and(|p| p.track_id == track_id);
        if produced {
            self.close_producer().await
        } else {
            Ok(())
        }
    }

    /// Create and connect the receive transport
    pub async fn open_receive_transport(&mut self) -> Result<()> {
        self.ensure_ready()?;
        if self.recv.stage != PathStage::Idle {
            return Err(NegotiationError::out_of_order("receive transport already open"));
        }

        self.recv.stage = PathStage::Pending;
        match self.establish(Direction::Recv).await {
            Ok(transport) => {
                self.recv.transport = Some(transport);
                self.recv.stage = PathStage::Connected;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Receive transport setup failed");
                self.recv.reset();
                Err(err)
            }
        }
    }

    /// Consume the most recently published producer
    pub async fn consume(&mut self) -> Result<LocalConsumer> {
        self.consume_producer(None).await
    }

    /// Consume a producer, attach it to playback, then ask the server to resume it
    pub async fn consume_producer(&mut self, producer_id: Option<String>) -> Result<LocalConsumer> {
        self.ensure_supported()?;
        let transport = match (self.recv.stage, &self.recv.transport) {
            (PathStage::Connected | PathStage::Active, Some(transport)) => Arc::clone(transport),
            _ => return Err(NegotiationError::out_of_order("receive transport not connected")),
        };
        let rtp_capabilities = self
            .context
            .rtp_capabilities()
            .ok_or_else(|| NegotiationError::out_of_order("local capabilities not loaded"))?;

        let reply = self
            .client
            .request(&Consume {
                rtp_capabilities,
                producer_id,
            })
            .await?;
        let params = reply.params.into_result().map_err(|payload| {
            warn!(error = %payload, "Server refused consume");
            NegotiationError::from(payload)
        })?;

        let consumer = transport.consume(&params).await.inspect_err(|err| {
            warn!(consumer_id = %params.id, error = %err, "Local consumer setup failed");
        })?;
        self.view.attach_remote(&consumer.track);

        let resumed = self
            .client
            .notify(&ConsumerResume {
                consumer_id: Some(consumer.id.clone()),
            })
            .await;
        if let Err(err) = resumed {
            warn!(consumer_id = %consumer.id, error = %err, "Failed to resume consumer");
            transport.close_consumer(&consumer.id);
            self.view.detach_remote(&consumer.id);
            return Err(err);
        }

        info!(consumer_id = %consumer.id, producer_id = %consumer.producer_id, "Consuming");
        self.recv.consumers.push(consumer.clone());
        self.recv.stage = PathStage::Active;
        Ok(consumer)
    }

    /// Apply a server notification
    pub fn handle_server_event(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::ConnectionSuccess(success) => {
                debug!(socket_id = %success.socket_id, "Signaling connected");
            }
            ServerEvent::ConsumerClosed(closed) => {
                let before = self.recv.consumers.len();
                self.recv.consumers.retain(|c| c.id != closed.consumer_id);
                if self.recv.consumers.len() == before {
                    return;
                }

                if let Some(transport) = &self.recv.transport {
                    transport.close_consumer(&closed.consumer_id);
                }
                self.view.detach_remote(&closed.consumer_id);
                if self.recv.consumers.is_empty() && self.recv.stage == PathStage::Active {
                    self.recv.stage = PathStage::Connected;
                }
                info!(
                    consumer_id = %closed.consumer_id,
                    producer_id = %closed.producer_id,
                    "Remote producer closed"
                );
            }
        }
    }

    /// Close everything local and return to `Idle`
    pub fn close(&mut self) {
        self.send.reset();
        self.recv.reset();
        self.local_track = None;
        self.view.clear();
        if !matches!(self.context_stage, ContextStage::Unsupported(_)) {
            self.context_stage = ContextStage::Idle;
        }
        debug!("Negotiator closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackDevice, LoopbackSource, RecordingView};
    use relaycast_proto::{
        events, ClientFrame, ConsumerClosed, ErrorKind, ServerFrame,
    };
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    /// Scripted server answering every request from a closure
    fn scripted<F>(respond: F) -> (Arc<SignalingClient>, mpsc::UnboundedReceiver<ClientFrame>)
    where
        F: Fn(&ClientFrame) -> Value + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Some(id) = frame.id {
                    let data = respond(&frame);
                    let _ = in_tx.send(ServerFrame { id: Some(id), event: None, data }).await;
                }
                let _ = seen_tx.send(frame);
            }
        });

        (Arc::new(SignalingClient::new(out_tx, in_rx)), seen_rx)
    }

    fn router_caps() -> Value {
        json!({
            "codecs": [
                {"kind": "audio", "mimeType": "audio/opus", "preferredPayloadType": 100, "clockRate": 48000, "channels": 2},
                {"kind": "video", "mimeType": "video/VP8", "preferredPayloadType": 101, "clockRate": 90000},
            ],
            "headerExtensions": [],
        })
    }

    fn transport_params(id: &str) -> Value {
        json!({"params": {
            "id": id,
            "iceParameters": {"usernameFragment": "u", "password": "p"},
            "iceCandidates": [],
            "dtlsParameters": {"role": "auto", "fingerprints": []},
        }})
    }

    fn happy_server(frame: &ClientFrame) -> Value {
        match frame.event.as_str() {
            events::GET_ROUTER_RTP_CAPABILITIES => json!({"routerRtpCapabilities": router_caps()}),
            events::CREATE_WEBRTC_TRANSPORT => {
                if frame.data["sender"] == json!(true) {
                    transport_params("send-1")
                } else {
                    transport_params("recv-1")
                }
            }
            events::TRANSPORT_PRODUCE => json!({"id": "producer-1"}),
            events::CONSUME => json!({"params": {
                "id": "consumer-1",
                "producerId": "producer-1",
                "kind": "video",
                "rtpParameters": {"codecs": []},
            }}),
            _ => json!({}),
        }
    }

    struct Harness {
        negotiator: SessionNegotiator,
        seen: mpsc::UnboundedReceiver<ClientFrame>,
        view: Arc<RecordingView>,
        source: Arc<LoopbackSource>,
    }

    fn harness<F>(device: LoopbackDevice, respond: F) -> Harness
    where
        F: Fn(&ClientFrame) -> Value + Send + 'static,
    {
        let (client, seen) = scripted(respond);
        let view = Arc::new(RecordingView::default());
        let source = Arc::new(LoopbackSource::default());
        let negotiator = SessionNegotiator::new(
            client,
            Arc::new(device),
            Arc::clone(&source) as Arc<dyn MediaSource>,
            Arc::clone(&view) as Arc<dyn MediaView>,
        );
        Harness {
            negotiator,
            seen,
            view,
            source,
        }
    }

    /// Scripted server that hangs up right after answering `last`
    fn hangs_up_after(last: &'static str) -> Arc<SignalingClient> {
        let (out_tx, mut out_rx) = mpsc::channel::<ClientFrame>(16);
        let (in_tx, in_rx) = mpsc::channel(16);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Some(id) = frame.id {
                    let data = happy_server(&frame);
                    let _ = in_tx.send(ServerFrame { id: Some(id), event: None, data }).await;
                }
                if frame.event == last {
                    break;
                }
            }
        });

        Arc::new(SignalingClient::new(out_tx, in_rx))
    }

    fn drain_events(seen: &mut mpsc::UnboundedReceiver<ClientFrame>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(frame) = seen.try_recv() {
            names.push(frame.event);
        }
        names
    }

    #[tokio::test]
    async fn test_send_then_receive_flow() {
        let mut h = harness(LoopbackDevice::default(), happy_server);
        let n = &mut h.negotiator;
        assert_eq!(n.phase(), Phase::Idle);

        n.request_capabilities().await.expect("capabilities");
        assert_eq!(n.phase(), Phase::ContextReady);

        n.acquire_local_media(&MediaConstraints::default()).await.expect("media");
        assert!(h.view.local().is_some());

        n.open_send_transport().await.expect("send transport");
        assert_eq!(n.phase(), Phase::SendTransportConnected);

        let producer = n.produce(&ProduceOptions::simulcast_video()).await.expect("produce");
        assert_eq!(producer.id, "producer-1");
        assert_eq!(n.phase(), Phase::Producing);

        n.open_receive_transport().await.expect("recv transport");
        assert_eq!(n.phase(), Phase::RecvTransportConnected);

        let consumer = n.consume().await.expect("consume");
        assert_eq!(consumer.producer_id, "producer-1");
        assert_eq!(n.phase(), Phase::Consuming);
        assert_eq!(h.view.remote().len(), 1);

        // Let the scripted server observe the trailing notification
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(
            drain_events(&mut h.seen),
            vec![
                events::GET_ROUTER_RTP_CAPABILITIES,
                events::CREATE_WEBRTC_TRANSPORT,
                events::TRANSPORT_CONNECT,
                events::TRANSPORT_PRODUCE,
                events::CREATE_WEBRTC_TRANSPORT,
                events::TRANSPORT_RECV_CONNECT,
                events::CONSUME,
                events::CONSUMER_RESUME,
            ]
        );
    }

    #[tokio::test]
    async fn test_unsupported_context_is_terminal() {
        let mut h = harness(LoopbackDevice::new(["video/H264"]), happy_server);
        let n = &mut h.negotiator;

        let err = n.request_capabilities().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedContext);
        assert_eq!(n.phase(), Phase::Unsupported);

        let err = n.open_receive_transport().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedContext);
        let err = n.request_capabilities().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedContext);
    }

    #[tokio::test]
    async fn test_media_acquisition_failure_allows_retry() {
        let mut h = harness(LoopbackDevice::default(), happy_server);
        h.negotiator.request_capabilities().await.expect("capabilities");

        h.source.deny();
        let err = h
            .negotiator
            .acquire_local_media(&MediaConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MediaAcquisition);
        assert_eq!(h.negotiator.phase(), Phase::ContextReady);

        h.source.allow();
        h.negotiator
            .acquire_local_media(&MediaConstraints::default())
            .await
            .expect("retry succeeds");
    }

    #[tokio::test]
    async fn test_steps_out_of_order() {
        let mut h = harness(LoopbackDevice::default(), happy_server);
        let n = &mut h.negotiator;

        let err = n.open_send_transport().await.unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::OutOfOrder));

        n.request_capabilities().await.expect("capabilities");
        let err = n.open_send_transport().await.unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::OutOfOrder));

        let err = n.consume().await.unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::OutOfOrder));
    }

    #[tokio::test]
    async fn test_consume_denied_keeps_send_path() {
        let mut h = harness(LoopbackDevice::default(), |frame: &ClientFrame| {
            if frame.event == events::CONSUME {
                json!({"params": {"error": "ConsumeDenied", "message": "incompatible"}})
            } else {
                happy_server(frame)
            }
        });
        let n = &mut h.negotiator;
        n.request_capabilities().await.expect("capabilities");
        n.acquire_local_media(&MediaConstraints::default()).await.expect("media");
        n.open_send_transport().await.expect("send transport");
        n.produce(&ProduceOptions::default()).await.expect("produce");
        n.open_receive_transport().await.expect("recv transport");

        let err = n.consume().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConsumeDenied);
        assert_eq!(n.phase(), Phase::RecvTransportConnected);
        assert!(n.producer().is_some());
        assert!(n.consumers().is_empty());
        assert!(h.view.remote().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_resets_send_path() {
        let mut h = harness(LoopbackDevice::default(), |frame: &ClientFrame| {
            if frame.event == events::TRANSPORT_CONNECT {
                json!({"error": "TransportFailure", "message": "dtls rejected"})
            } else {
                happy_server(frame)
            }
        });
        let n = &mut h.negotiator;
        n.request_capabilities().await.expect("capabilities");
        n.acquire_local_media(&MediaConstraints::default()).await.expect("media");

        let err = n.open_send_transport().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
        assert_eq!(n.phase(), Phase::ContextReady);

        // The receive side is unaffected
        n.open_receive_transport().await.expect("recv transport");
        assert_eq!(n.phase(), Phase::RecvTransportConnected);
    }

    #[tokio::test]
    async fn test_track_end_notifies_server() {
        let mut h = harness(LoopbackDevice::default(), happy_server);
        let n = &mut h.negotiator;
        n.request_capabilities().await.expect("capabilities");
        let track = n.acquire_local_media(&MediaConstraints::default()).await.expect("media");
        n.open_send_transport().await.expect("send transport");
        n.produce(&ProduceOptions::default()).await.expect("produce");
        drain_events(&mut h.seen);

        n.on_track_ended(&track.id).await.expect("track end");
        assert!(n.producer().is_none());
        assert_eq!(n.phase(), Phase::SendTransportConnected);

        let frame = h.seen.recv().await.expect("notification");
        assert_eq!(frame.event, events::PRODUCER_CLOSE);
        assert!(frame.id.is_none());
        assert_eq!(frame.data, json!({"producerId": "producer-1"}));
    }

    #[tokio::test]
    async fn test_capabilities_error_is_not_terminal() {
        let mut h = harness(LoopbackDevice::default(), |frame: &ClientFrame| {
            if frame.event == events::GET_ROUTER_RTP_CAPABILITIES {
                json!({"error": "StateError", "reason": "Closed", "message": "connection closed"})
            } else {
                happy_server(frame)
            }
        });

        let err = h.negotiator.request_capabilities().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert_eq!(err.reason(), Some(StateReason::Closed));
        assert_eq!(h.negotiator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_unknown_connect_error_halts() {
        let mut h = harness(LoopbackDevice::default(), |frame: &ClientFrame| {
            if frame.event == events::TRANSPORT_RECV_CONNECT {
                json!({"error": "Unavailable", "message": "worker died"})
            } else {
                happy_server(frame)
            }
        });
        let n = &mut h.negotiator;
        n.request_capabilities().await.expect("capabilities");

        let err = n.open_receive_transport().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
        assert_eq!(n.phase(), Phase::ContextReady);
    }

    #[tokio::test]
    async fn test_resume_failure_detaches_remote_track() {
        let view = Arc::new(RecordingView::default());
        let mut n = SessionNegotiator::new(
            hangs_up_after(events::CONSUME),
            Arc::new(LoopbackDevice::default()),
            Arc::new(LoopbackSource::default()),
            Arc::clone(&view) as Arc<dyn MediaView>,
        );
        n.request_capabilities().await.expect("capabilities");
        n.open_receive_transport().await.expect("recv transport");

        let err = n.consume().await.unwrap_err();
        assert_eq!(err, NegotiationError::ChannelClosed);
        assert!(view.remote().is_empty());
        assert!(n.consumers().is_empty());
        assert_eq!(n.phase(), Phase::RecvTransportConnected);
    }

    #[tokio::test]
    async fn test_consumer_closed_event() {
        let mut h = harness(LoopbackDevice::default(), happy_server);
        let n = &mut h.negotiator;
        n.request_capabilities().await.expect("capabilities");
        n.open_receive_transport().await.expect("recv transport");
        n.consume().await.expect("consume");

        n.handle_server_event(&ServerEvent::ConsumerClosed(ConsumerClosed {
            consumer_id: "consumer-1".to_string(),
            producer_id: "producer-1".to_string(),
        }));
        assert!(n.consumers().is_empty());
        assert_eq!(n.phase(), Phase::RecvTransportConnected);
        assert!(h.view.remote().is_empty());

        n.close();
        assert_eq!(n.phase(), Phase::Idle);
    }
}

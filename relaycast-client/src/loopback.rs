//! In-process local media stack
//!
//! Stands in for a browser or native WebRTC stack: negotiates capabilities and
//! walks the transport callbacks, but captures and renders nothing. Used by the
//! probe command and by tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use relaycast_proto::{
    ConsumerParams, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, StateReason,
    TransportParams,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::error::{NegotiationError, Result};
use crate::media::{
    encodings_value, Direction, LocalConsumer, LocalMediaContext, LocalProducer, LocalTrack,
    LocalTransport, MediaConstraints, MediaSource, MediaView, ProduceOptions, RemoteTrack,
    TransportListener,
};

/// Local media context supporting a fixed set of MIME types
pub struct LoopbackDevice {
    supported: Vec<String>,
    loaded: Mutex<Option<RtpCapabilities>>,
}

impl LoopbackDevice {
    pub fn new<I, S>(supported_mime_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            supported: supported_mime_types
                .into_iter()
                .map(|mime| mime.into().to_lowercase())
                .collect(),
            loaded: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded.lock().is_some()
    }

    fn supports(&self, codec: &Value) -> bool {
        codec
            .get("mimeType")
            .and_then(Value::as_str)
            .is_some_and(|mime| self.supported.contains(&mime.to_lowercase()))
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new(["audio/opus", "video/VP8"])
    }
}

#[async_trait]
impl LocalMediaContext for LoopbackDevice {
    async fn load(&self, router_rtp_capabilities: &RtpCapabilities) -> Result<()> {
        let router = router_rtp_capabilities.as_value();
        let codecs: Vec<Value> = router
            .get("codecs")
            .and_then(Value::as_array)
            .map(|codecs| codecs.iter().filter(|c| self.supports(c)).cloned().collect())
            .unwrap_or_default();
        if codecs.is_empty() {
            return Err(NegotiationError::UnsupportedContext(
                "no router codec is supported locally".to_string(),
            ));
        }

        let header_extensions = router
            .get("headerExtensions")
            .cloned()
            .unwrap_or_else(|| json!([]));
        *self.loaded.lock() = Some(RtpCapabilities::new(json!({
            "codecs": codecs,
            "headerExtensions": header_extensions,
        })));
        Ok(())
    }

    fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.loaded.lock().clone()
    }

    fn create_transport(
        &self,
        direction: Direction,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn LocalTransport>> {
        let capabilities = self.rtp_capabilities().ok_or_else(|| {
            NegotiationError::out_of_order("device capabilities not loaded")
        })?;
        Ok(Arc::new(LoopbackTransport {
            id: params.id,
            direction,
            listener,
            capabilities,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_ssrc: AtomicU32::new(1_000),
            producers: Mutex::new(HashSet::new()),
            consumers: Mutex::new(HashSet::new()),
        }))
    }
}

pub struct LoopbackTransport {
    id: String,
    direction: Direction,
    listener: Arc<dyn TransportListener>,
    capabilities: RtpCapabilities,
    connected: AtomicBool,
    closed: AtomicBool,
    next_ssrc: AtomicU32,
    producers: Mutex<HashSet<String>>,
    consumers: Mutex<HashSet<String>>,
}

impl LoopbackTransport {
    fn ensure_usable(&self, direction: Direction) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::state(
                StateReason::Closed,
                format!("transport {} is closed", self.id),
            ));
        }
        if self.direction != direction {
            return Err(NegotiationError::state(
                StateReason::TransportMismatch,
                format!("transport {} is a {} transport", self.id, self.direction),
            ));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(NegotiationError::state(
                StateReason::TransportNotConnected,
                format!("transport {} is not connected", self.id),
            ));
        }
        Ok(())
    }

    fn codecs_for(&self, kind: MediaKind) -> Vec<Value> {
        let prefix = format!("{kind}/");
        self.capabilities
            .as_value()
            .get("codecs")
            .and_then(Value::as_array)
            .map(|codecs| {
                codecs
                    .iter()
                    .filter(|codec| {
                        codec
                            .get("mimeType")
                            .and_then(Value::as_str)
                            .is_some_and(|mime| mime.to_lowercase().starts_with(&prefix))
                    })
                    .map(|codec| {
                        json!({
                            "mimeType": codec["mimeType"],
                            "payloadType": codec["preferredPayloadType"],
                            "clockRate": codec["clockRate"],
                            "channels": codec.get("channels"),
                            "parameters": codec.get("parameters").cloned().unwrap_or_else(|| json!({})),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl LocalTransport for LoopbackTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    async fn connect(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::state(StateReason::Closed, "transport closed"));
        }
        if self.connected.load(Ordering::SeqCst) {
            return Err(NegotiationError::state(
                StateReason::AlreadyConnected,
                format!("transport {} already connected", self.id),
            ));
        }

        let dtls = DtlsParameters::new(json!({
            "role": "client",
            "fingerprints": [{"algorithm": "sha-256", "value": fingerprint(&self.id)}],
        }));
        self.listener.on_connect(dtls).await?;
        self.connected.store(true, Ordering::SeqCst);
        debug!(transport_id = %self.id, direction = %self.direction, "Loopback transport connected");
        Ok(())
    }

    async fn produce(&self, track: &LocalTrack, options: &ProduceOptions) -> Result<LocalProducer> {
        self.ensure_usable(Direction::Send)?;

        let codecs = self.codecs_for(track.kind);
        if codecs.is_empty() {
            return Err(NegotiationError::UnsupportedContext(format!(
                "no {} codec available",
                track.kind
            )));
        }

        let ssrc = self.next_ssrc.fetch_add(1, Ordering::Relaxed);
        let encodings = if options.encodings.is_empty() {
            json!([{ "ssrc": ssrc }])
        } else {
            encodings_value(&options.encodings)
        };
        let rtp_parameters = RtpParameters::new(json!({
            "mid": track.id,
            "codecs": codecs,
            "encodings": encodings,
            "codecOptions": options.codec_options,
            "rtcp": {"cname": self.id, "reducedSize": true},
        }));

        let id = self
            .listener
            .on_produce(track.kind, rtp_parameters, options.app_data.clone())
            .await?;
        self.producers.lock().insert(id.clone());

        Ok(LocalProducer {
            id,
            kind: track.kind,
            track_id: track.id.clone(),
        })
    }

    async fn consume(&self, params: &ConsumerParams) -> Result<LocalConsumer> {
        self.ensure_usable(Direction::Recv)?;
        self.consumers.lock().insert(params.id.clone());

        Ok(LocalConsumer {
            id: params.id.clone(),
            producer_id: params.producer_id.clone(),
            kind: params.kind,
            track: RemoteTrack {
                id: format!("remote-{}", params.id),
                kind: params.kind,
                consumer_id: params.id.clone(),
            },
        })
    }

    fn close_producer(&self, producer_id: &str) {
        self.producers.lock().remove(producer_id);
    }

    fn close_consumer(&self, consumer_id: &str) {
        self.consumers.lock().remove(consumer_id);
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.producers.lock().clear();
            self.consumers.lock().clear();
            debug!(transport_id = %self.id, "Loopback transport closed");
        }
    }
}

/// Media source handing out synthetic tracks
#[derive(Default)]
pub struct LoopbackSource {
    next_track: AtomicU32,
    denied: AtomicBool,
}

impl LoopbackSource {
    /// Refuse every later capture, like a user denying permission
    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }

    pub fn allow(&self) {
        self.denied.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaSource for LoopbackSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalTrack> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(NegotiationError::MediaAcquisition(
                "permission denied".to_string(),
            ));
        }

        let kind = match (constraints.video, constraints.audio) {
            (Some(_), _) => MediaKind::Video,
            (None, true) => MediaKind::Audio,
            (None, false) => {
                return Err(NegotiationError::MediaAcquisition(
                    "neither audio nor video requested".to_string(),
                ))
            }
        };
        let n = self.next_track.fetch_add(1, Ordering::Relaxed);

        Ok(LocalTrack {
            id: format!("track-{n}"),
            kind,
            label: format!("loopback {kind}"),
        })
    }
}

/// View that records what was attached to it
#[derive(Default)]
pub struct RecordingView {
    local: Mutex<Option<LocalTrack>>,
    remote: Mutex<Vec<RemoteTrack>>,
}

impl RecordingView {
    pub fn local(&self) -> Option<LocalTrack> {
        self.local.lock().clone()
    }

    pub fn remote(&self) -> Vec<RemoteTrack> {
        self.remote.lock().clone()
    }
}

impl MediaView for RecordingView {
    fn attach_local(&self, track: &LocalTrack) {
        *self.local.lock() = Some(track.clone());
    }

    fn attach_remote(&self, track: &RemoteTrack) {
        self.remote.lock().push(track.clone());
    }

    fn detach_remote(&self, consumer_id: &str) {
        self.remote.lock().retain(|t| t.consumer_id != consumer_id);
    }

    fn clear(&self) {
        self.local.lock().take();
        self.remote.lock().clear();
    }
}

fn fingerprint(seed: &str) -> String {
    let bytes = seed.as_bytes();
    (0..32)
        .map(|i| {
            let b = bytes.get(i % bytes.len().max(1)).copied().unwrap_or_default();
            format!("{:02X}", b.rotate_left(3))
        })
        .collect::<Vec<_>>()
        .join(":")
}

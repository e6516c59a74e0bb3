//! Local media seams
//!
//! The negotiator never touches capture devices, codecs or DTLS itself. It
//! drives these traits, which a browser binding, a native WebRTC stack or the
//! in-process [`crate::loopback`] implementation provide.

use async_trait::async_trait;
use relaycast_proto::{
    AppData, ConsumerParams, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters,
    TransportParams,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Direction of a local transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Recv => "recv",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured outgoing track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
}

/// Incoming track delivered by a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub consumer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalProducer {
    pub id: String,
    pub kind: MediaKind,
    pub track_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConsumer {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub track: RemoteTrack,
}

/// Inclusive range constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: Range,
    pub height: Range,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: Range { min: 640, max: 1920 },
            height: Range { min: 400, max: 1080 },
        }
    }
}

/// What to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

impl Default for MediaConstraints {
    /// Camera only, 640x400 up to 1920x1080
    fn default() -> Self {
        Self {
            audio: false,
            video: Some(VideoConstraints::default()),
        }
    }
}

/// One simulcast layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Encoding {
    pub rid: String,
    pub max_bitrate: u32,
    pub scalability_mode: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_google_start_bitrate: Option<u32>,
}

/// How a track is sent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProduceOptions {
    pub encodings: Vec<Encoding>,
    pub codec_options: CodecOptions,
    pub app_data: AppData,
}

impl ProduceOptions {
    /// Three spatial layers at 100, 300 and 900 kbps
    #[must_use]
    pub fn simulcast_video() -> Self {
        let layer = |rid: &str, max_bitrate| Encoding {
            rid: rid.to_string(),
            max_bitrate,
            scalability_mode: "S1T3".to_string(),
        };
        Self {
            encodings: vec![
                layer("r0", 100_000),
                layer("r1", 300_000),
                layer("r2", 900_000),
            ],
            codec_options: CodecOptions {
                video_google_start_bitrate: Some(1000),
            },
            app_data: AppData::default(),
        }
    }
}

/// Callbacks a local transport fires towards signaling
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// DTLS parameters are ready; resolve once the server accepted them
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> Result<()>;

    /// A producer is about to be created; resolve with the server-assigned id
    async fn on_produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppData,
    ) -> Result<String>;
}

/// Client-side transport built from server parameters
#[async_trait]
pub trait LocalTransport: Send + Sync {
    fn id(&self) -> &str;

    fn direction(&self) -> Direction;

    /// Run the DTLS handshake, firing [`TransportListener::on_connect`]
    async fn connect(&self) -> Result<()>;

    async fn produce(&self, track: &LocalTrack, options: &ProduceOptions) -> Result<LocalProducer>;

    async fn consume(&self, params: &ConsumerParams) -> Result<LocalConsumer>;

    fn close_producer(&self, producer_id: &str);

    fn close_consumer(&self, consumer_id: &str);

    fn close(&self);
}

/// The local media stack (a "device")
#[async_trait]
pub trait LocalMediaContext: Send + Sync {
    /// Load the router capabilities; fails when nothing can be negotiated
    async fn load(&self, router_rtp_capabilities: &RtpCapabilities) -> Result<()>;

    /// Capabilities to announce when consuming, available after `load`
    fn rtp_capabilities(&self) -> Option<RtpCapabilities>;

    fn create_transport(
        &self,
        direction: Direction,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn LocalTransport>>;
}

/// Capture device access
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalTrack>;
}

/// Preview and playback surface
pub trait MediaView: Send + Sync {
    fn attach_local(&self, track: &LocalTrack);

    fn attach_remote(&self, track: &RemoteTrack);

    fn detach_remote(&self, consumer_id: &str);

    fn clear(&self);
}

/// Encodings as the wire-level `encodings` array
#[must_use]
pub fn encodings_value(encodings: &[Encoding]) -> Value {
    serde_json::to_value(encodings).unwrap_or(Value::Array(Vec::new()))
}

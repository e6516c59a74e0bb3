//! Router capability registry
//!
//! Computes the capability document advertised by `getRouterRtpCapabilities`
//! from the configured codecs, and caches the document of every routing context
//! so repeated queries return the identical value.

use dashmap::DashMap;
use relaycast_proto::{MediaKind, RtpCapabilities};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::MediaCodec;
use crate::types::RoomId;

/// First dynamic RTP payload type handed out to configured codecs
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

/// Codec entry extracted from an opaque capability or parameter object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecRef {
    pub kind: MediaKind,
    /// Lowercased MIME type
    pub mime_type: String,
}

pub struct CapabilityRegistry {
    codecs: Vec<MediaCodec>,
    by_room: DashMap<RoomId, Arc<RtpCapabilities>>,
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new(codecs: Vec<MediaCodec>) -> Self {
        Self {
            codecs,
            by_room: DashMap::new(),
        }
    }

    #[must_use]
    pub fn codecs(&self) -> &[MediaCodec] {
        &self.codecs
    }

    /// Remember the capabilities a router was created with
    pub fn register(&self, room_id: RoomId, capabilities: RtpCapabilities) -> Arc<RtpCapabilities> {
        let capabilities = Arc::new(capabilities);
        self.by_room.insert(room_id, Arc::clone(&capabilities));
        capabilities
    }

    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<Arc<RtpCapabilities>> {
        self.by_room.get(room_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, room_id: &RoomId) {
        self.by_room.remove(room_id);
    }

    #[must_use]
    pub fn supports(&self, mime_type: &str) -> bool {
        self.codecs
            .iter()
            .any(|codec| codec.mime_type.eq_ignore_ascii_case(mime_type))
    }
}

/// Build a router capability document for the given codecs
#[must_use]
pub fn build_capabilities(codecs: &[MediaCodec]) -> RtpCapabilities {
    let entries: Vec<Value> = codecs
        .iter()
        .zip(FIRST_DYNAMIC_PAYLOAD_TYPE..)
        .map(|(codec, payload_type)| {
            let mut entry = json!({
                "kind": codec.kind,
                "mimeType": codec.mime_type,
                "preferredPayloadType": payload_type,
                "clockRate": codec.clock_rate,
                "parameters": codec.parameters,
                "rtcpFeedback": rtcp_feedback(codec.kind),
            });
            if let Some(channels) = codec.channels {
                entry["channels"] = json!(channels);
            }
            entry
        })
        .collect();

    RtpCapabilities::new(json!({
        "codecs": entries,
        "headerExtensions": [
            {"kind": "audio", "uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "preferredId": 1},
            {"kind": "video", "uri": "urn:ietf:params:rtp-hdrext:sdes:mid", "preferredId": 1},
            {"kind": "video", "uri": "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time", "preferredId": 4},
        ],
    }))
}

fn rtcp_feedback(kind: MediaKind) -> Value {
    match kind {
        MediaKind::Audio => json!([{"type": "transport-cc", "parameter": ""}]),
        MediaKind::Video => json!([
            {"type": "nack", "parameter": ""},
            {"type": "nack", "parameter": "pli"},
            {"type": "ccm", "parameter": "fir"},
            {"type": "goog-remb", "parameter": ""},
            {"type": "transport-cc", "parameter": ""},
        ]),
    }
}

/// Read the `codecs` array of a capability or RTP parameter object
///
/// Entries without a usable MIME type are skipped. The kind falls back to the
/// MIME type prefix when the entry has no `kind` field.
#[must_use]
pub fn codec_refs(value: &Value) -> Vec<CodecRef> {
    let Some(codecs) = value.get("codecs").and_then(Value::as_array) else {
        return Vec::new();
    };

    codecs
        .iter()
        .filter_map(|codec| {
            let mime_type = codec.get("mimeType")?.as_str()?.to_lowercase();
            let kind = match codec.get("kind").and_then(Value::as_str) {
                Some("audio") => MediaKind::Audio,
                Some("video") => MediaKind::Video,
                _ if mime_type.starts_with("audio/") => MediaKind::Audio,
                _ if mime_type.starts_with("video/") => MediaKind::Video,
                _ => return None,
            };
            Some(CodecRef { kind, mime_type })
        })
        .collect()
}

//! SFU Configuration

use relaycast_proto::MediaKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One codec the routers accept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCodec {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl MediaCodec {
    pub fn opus() -> Self {
        Self {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
        }
    }

    pub fn vp8() -> Self {
        let mut parameters = Map::new();
        parameters.insert("x-google-start-bitrate".to_string(), Value::from(1000));
        Self {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters,
        }
    }
}

/// Address a transport listens on, optionally announced under another IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenIp {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announced_ip: Option<String>,
}

impl ListenIp {
    /// Address placed into ICE candidates
    #[must_use]
    pub fn candidate_ip(&self) -> &str {
        self.announced_ip.as_deref().unwrap_or(&self.ip)
    }
}

/// What a repeated `transport-produce` does when the connection already has a
/// live producer of the same kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProducerSlotPolicy {
    /// Close the previous producer, then register the new one
    #[default]
    Replace,
    /// Refuse with `StateError(ProducerExists)`
    Reject,
    /// Keep both (multi-track)
    Allow,
}

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Codecs every router is created with
    pub media_codecs: Vec<MediaCodec>,
    /// Transport listen addresses
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    /// RTC port range handed to the media engine
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Maximum number of concurrent routing contexts (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum signaling connections per routing context (0 = unlimited)
    pub max_connections_per_room: usize,
    /// Repeated produce behaviour
    pub producer_slot_policy: ProducerSlotPolicy,
    /// Seconds between empty-room sweeps
    pub cleanup_interval_secs: u64,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            media_codecs: vec![MediaCodec::opus(), MediaCodec::vp8()],
            listen_ips: vec![ListenIp {
                ip: "127.0.0.1".to_string(),
                announced_ip: Some("127.0.0.1".to_string()),
            }],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            max_rooms: 0,
            max_connections_per_room: 50,
            producer_slot_policy: ProducerSlotPolicy::Replace,
            cleanup_interval_secs: 60,
        }
    }
}

impl SfuConfig {
    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.media_codecs.is_empty() {
            errors.push("sfu.media_codecs must not be empty".to_string());
        }
        for codec in &self.media_codecs {
            let expected_prefix = format!("{}/", codec.kind);
            if !codec.mime_type.to_lowercase().starts_with(&expected_prefix) {
                errors.push(format!(
                    "sfu.media_codecs: {} does not match kind {}",
                    codec.mime_type, codec.kind
                ));
            }
        }
        if self.listen_ips.is_empty() {
            errors.push("sfu.listen_ips must not be empty".to_string());
        }
        if !self.enable_udp && !self.enable_tcp {
            errors.push("sfu: at least one of enable_udp/enable_tcp must be set".to_string());
        }
        if self.rtc_min_port > self.rtc_max_port {
            errors.push(format!(
                "sfu.rtc_min_port ({}) is greater than sfu.rtc_max_port ({})",
                self.rtc_min_port, self.rtc_max_port
            ));
        }
        if self.cleanup_interval_secs == 0 {
            errors.push("sfu.cleanup_interval_secs must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

//! Negotiation payloads

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

macro_rules! opaque_payload {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Value);

        impl $name {
            #[must_use]
            pub const fn new(value: Value) -> Self {
                Self(value)
            }

            #[must_use]
            pub const fn as_value(&self) -> &Value {
                &self.0
            }

            #[must_use]
            pub fn into_value(self) -> Value {
                self.0
            }
        }

        impl From<Value> for $name {
            fn from(value: Value) -> Self {
                Self(value)
            }
        }
    };
}

opaque_payload!(
    /// Codec and header extension support of a router or a local media context
    RtpCapabilities
);
opaque_payload!(
    /// DTLS role and fingerprints of one transport endpoint
    DtlsParameters
);
opaque_payload!(
    /// ICE username fragment and password
    IceParameters
);
opaque_payload!(
    /// ICE candidate list
    IceCandidates
);
opaque_payload!(
    /// SCTP parameters for data channels
    SctpParameters
);
opaque_payload!(
    /// RTP send/receive parameters of one track
    RtpParameters
);
opaque_payload!(
    /// Application metadata attached to a producer or consumer
    AppData
);

impl Default for AppData {
    fn default() -> Self {
        Self(Value::Object(serde_json::Map::new()))
    }
}

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters of a freshly created server-side transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: IceCandidates,
    pub dtls_parameters: DtlsParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<SctpParameters>,
}

/// Parameters the client needs to build a local consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: AppData,
}

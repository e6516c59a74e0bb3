//! Identifiers and small enums shared across the SFU

use serde::{Deserialize, Serialize};
use std::fmt;

/// Generate a 12-character nanoid for entity IDs
#[must_use]
pub fn generate_id() -> String {
    nanoid::nanoid!(12)
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh random identifier
            #[must_use]
            pub fn generate() -> Self {
                Self(generate_id())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// One signaling connection (one peer session)
    ConnectionId
);
string_id!(
    /// One routing context
    RoomId
);
string_id!(
    /// Media engine router backing a routing context
    RouterId
);
string_id!(TransportId);
string_id!(ProducerId);
string_id!(ConsumerId);

/// Direction of a transport relative to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportRole {
    /// Peer sends media to the router
    Send,
    /// Router sends media to the peer
    Recv,
}

impl TransportRole {
    #[must_use]
    pub const fn from_sender(sender: bool) -> Self {
        if sender {
            Self::Send
        } else {
            Self::Recv
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Recv => "recv",
        }
    }
}

impl fmt::Display for TransportRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    Created,
    Connecting,
    Connected,
    Closed,
}

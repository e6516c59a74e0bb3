use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Failure categories shared by both ends of the signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Local media context cannot load the router capabilities. Terminal.
    UnsupportedContext,
    /// Local capture device unavailable or permission denied.
    #[serde(rename = "MediaAcquisitionError")]
    MediaAcquisition,
    /// Operation references a missing or closed transport, producer or consumer.
    #[serde(rename = "StateError")]
    State,
    /// Capabilities do not allow consuming the requested producer.
    ConsumeDenied,
    /// The media engine rejected create, connect, produce or consume.
    TransportFailure,
    /// Malformed frame or unknown event.
    ProtocolError,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedContext => "UnsupportedContext",
            Self::MediaAcquisition => "MediaAcquisitionError",
            Self::State => "StateError",
            Self::ConsumeDenied => "ConsumeDenied",
            Self::TransportFailure => "TransportFailure",
            Self::ProtocolError => "ProtocolError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detail attached to [`ErrorKind::State`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateReason {
    NoSuchTransport,
    NoSuchProducer,
    NoSuchConsumer,
    TransportExists,
    TransportNotConnected,
    AlreadyConnected,
    TransportMismatch,
    ProducerExists,
    /// The connection (or the local session) has been torn down.
    Closed,
    /// The client-side negotiator was asked to skip a step.
    OutOfOrder,
}

impl StateReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoSuchTransport => "NoSuchTransport",
            Self::NoSuchProducer => "NoSuchProducer",
            Self::NoSuchConsumer => "NoSuchConsumer",
            Self::TransportExists => "TransportExists",
            Self::TransportNotConnected => "TransportNotConnected",
            Self::AlreadyConnected => "AlreadyConnected",
            Self::TransportMismatch => "TransportMismatch",
            Self::ProducerExists => "ProducerExists",
            Self::Closed => "Closed",
            Self::OutOfOrder => "OutOfOrder",
        }
    }
}

impl fmt::Display for StateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured `{error}` reply body
///
/// ```json
/// {"error": "StateError", "reason": "NoSuchTransport", "message": "no send transport"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<StateReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorPayload {
    #[must_use]
    pub fn new(error: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error,
            reason: None,
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn state(reason: StateReason, message: impl Into<String>) -> Self {
        Self {
            error: ErrorKind::State,
            reason: Some(reason),
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn consume_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConsumeDenied, message)
    }

    #[must_use]
    pub fn protocol(err: &ProtocolError) -> Self {
        Self::new(ErrorKind::ProtocolError, err.to_string())
    }

    /// Read an `{error}` body from the peer
    ///
    /// Kinds this side does not know become [`ErrorKind::ProtocolError`] with
    /// the raw kind kept in the message.
    #[must_use]
    pub fn from_wire(value: &Value) -> Self {
        if let Ok(payload) = Self::deserialize(value) {
            return payload;
        }

        let kind = match value.get("error") {
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => other.to_string(),
            None => "missing error kind".to_string(),
        };
        let reason = value
            .get("reason")
            .and_then(|reason| StateReason::deserialize(reason).ok());
        let message = match value.get("message").and_then(Value::as_str) {
            Some(message) => format!("{kind}: {message}"),
            None => kind,
        };
        Self {
            error: ErrorKind::ProtocolError,
            reason,
            message: Some(message),
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(reason) = self.reason {
            write!(f, "({reason})")?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

/// Frame encoding/decoding failures
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("invalid payload for {event}: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

use relaycast_proto::{ErrorKind, ErrorPayload, ProtocolError, StateReason};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("local media context cannot load router capabilities: {0}")]
    UnsupportedContext(String),

    #[error("media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("state error ({reason}): {message}")]
    State {
        reason: StateReason,
        message: String,
    },

    #[error("consume denied: {0}")]
    ConsumeDenied(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{event} got no reply in time")]
    Timeout { event: String },

    #[error("signaling channel closed")]
    ChannelClosed,
}

impl NegotiationError {
    pub fn state(reason: StateReason, message: impl Into<String>) -> Self {
        Self::State {
            reason,
            message: message.into(),
        }
    }

    pub(crate) fn out_of_order(message: impl Into<String>) -> Self {
        Self::state(StateReason::OutOfOrder, message)
    }

    /// Wire category of the error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedContext(_) => ErrorKind::UnsupportedContext,
            Self::MediaAcquisition(_) => ErrorKind::MediaAcquisition,
            Self::State { .. } => ErrorKind::State,
            Self::ConsumeDenied(_) => ErrorKind::ConsumeDenied,
            Self::TransportFailure(_) | Self::Timeout { .. } | Self::ChannelClosed => {
                ErrorKind::TransportFailure
            }
            Self::Protocol(_) => ErrorKind::ProtocolError,
        }
    }

    #[must_use]
    pub const fn reason(&self) -> Option<StateReason> {
        match self {
            Self::State { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl From<ErrorPayload> for NegotiationError {
    fn from(payload: ErrorPayload) -> Self {
        let message = payload
            .message
            .clone()
            .unwrap_or_else(|| payload.error.to_string());
        match payload.error {
            ErrorKind::UnsupportedContext => Self::UnsupportedContext(message),
            ErrorKind::MediaAcquisition => Self::MediaAcquisition(message),
            ErrorKind::State => Self::State {
                reason: payload.reason.unwrap_or(StateReason::OutOfOrder),
                message,
            },
            ErrorKind::ConsumeDenied => Self::ConsumeDenied(message),
            ErrorKind::TransportFailure => Self::TransportFailure(message),
            ErrorKind::ProtocolError => Self::Protocol(message),
        }
    }
}

impl From<ProtocolError> for NegotiationError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<serde_json::Error> for NegotiationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NegotiationError>;

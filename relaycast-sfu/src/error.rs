use relaycast_proto::{ErrorKind, ErrorPayload, StateReason};
use thiserror::Error;

use crate::engine::EngineError;

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("state error ({reason}): {message}")]
    State {
        reason: StateReason,
        message: String,
    },

    #[error("consume denied: {0}")]
    ConsumeDenied(String),

    #[error("media engine failure: {0}")]
    TransportFailure(#[from] EngineError),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SfuError {
    pub fn state(reason: StateReason, message: impl Into<String>) -> Self {
        Self::State {
            reason,
            message: message.into(),
        }
    }

    pub(crate) fn closed() -> Self {
        Self::state(StateReason::Closed, "connection is closed")
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::State { .. } => ErrorKind::State,
            Self::ConsumeDenied(_) => ErrorKind::ConsumeDenied,
            Self::TransportFailure(_) | Self::Capacity(_) | Self::Config(_) => {
                ErrorKind::TransportFailure
            }
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

impl From<&SfuError> for ErrorPayload {
    fn from(err: &SfuError) -> Self {
        match err {
            SfuError::State { reason, message } => Self::state(*reason, message.clone()),
            SfuError::ConsumeDenied(message) => Self::consume_denied(message.clone()),
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}

impl From<SfuError> for ErrorPayload {
    fn from(err: SfuError) -> Self {
        Self::from(&err)
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;

//! Text frames carried by the signaling channel

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::event::{Notification, Request};

/// Client-to-server frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Correlation id; present on requests, absent on notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ClientFrame {
    pub fn request<R: Request>(id: u64, request: &R) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: Some(id),
            event: R::EVENT.to_string(),
            data: serde_json::to_value(request)?,
        })
    }

    pub fn notification<N: Notification>(notification: &N) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: None,
            event: N::EVENT.to_string(),
            data: serde_json::to_value(notification)?,
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Server-to-client frame
///
/// Replies carry `id`; notifications carry `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl ServerFrame {
    pub fn reply<T: Serialize>(id: u64, body: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: Some(id),
            event: None,
            data: serde_json::to_value(body)?,
        })
    }

    pub fn notification<N: Notification>(notification: &N) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: None,
            event: Some(N::EVENT.to_string()),
            data: serde_json::to_value(notification)?,
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

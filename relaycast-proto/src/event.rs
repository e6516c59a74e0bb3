//! Named negotiation events and their typed payloads

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorPayload, ProtocolError};
use crate::payload::{
    AppData, ConsumerParams, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters,
    TransportParams,
};

/// Event names as they appear on the wire
pub mod events {
    pub const GET_ROUTER_RTP_CAPABILITIES: &str = "getRouterRtpCapabilities";
    pub const CREATE_WEBRTC_TRANSPORT: &str = "createWebRTCTransport";
    pub const TRANSPORT_CONNECT: &str = "transport-connect";
    pub const TRANSPORT_PRODUCE: &str = "transport-produce";
    pub const TRANSPORT_RECV_CONNECT: &str = "transport-recv-connect";
    pub const CONSUME: &str = "consume";
    pub const CONSUMER_RESUME: &str = "consumer-resume";
    pub const PRODUCER_CLOSE: &str = "producer-close";

    pub const CONNECTION_SUCCESS: &str = "connection-success";
    pub const CONSUMER_CLOSED: &str = "consumer-closed";
}

/// A client event answered by exactly one reply
pub trait Request: Serialize {
    const EVENT: &'static str;
    type Reply: Serialize + DeserializeOwned;
}

/// A fire-and-forget event
pub trait Notification: Serialize {
    const EVENT: &'static str;
}

/// Success-or-error reply body
///
/// Any body carrying an `error` key is a failure, whatever else it holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply<T> {
    Failure(ErrorPayload),
    Success(T),
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Reply<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if value.get("error").is_some() {
            return Ok(Self::Failure(ErrorPayload::from_wire(&value)));
        }
        T::deserialize(value)
            .map(Self::Success)
            .map_err(de::Error::custom)
    }
}

impl<T> Reply<T> {
    pub fn into_result(self) -> Result<T, ErrorPayload> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(err) => Err(err),
        }
    }
}

impl<T> From<Result<T, ErrorPayload>> for Reply<T> {
    fn from(result: Result<T, ErrorPayload>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) => Self::Failure(err),
        }
    }
}

/// Empty acknowledgement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ack {}

// --- getRouterRtpCapabilities ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetRouterRtpCapabilities;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesReply {
    pub router_rtp_capabilities: RtpCapabilities,
}

impl Request for GetRouterRtpCapabilities {
    const EVENT: &'static str = events::GET_ROUTER_RTP_CAPABILITIES;
    type Reply = Reply<CapabilitiesReply>;
}

// --- createWebRTCTransport ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWebRtcTransport {
    /// `true` for the send (producer) transport, `false` for the receive one
    pub sender: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTransportReply {
    pub params: Reply<TransportParams>,
}

impl Request for CreateWebRtcTransport {
    const EVENT: &'static str = events::CREATE_WEBRTC_TRANSPORT;
    type Reply = CreateTransportReply;
}

// --- transport-connect / transport-recv-connect ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransport {
    pub dtls_parameters: DtlsParameters,
}

impl Request for ConnectTransport {
    const EVENT: &'static str = events::TRANSPORT_CONNECT;
    type Reply = Reply<Ack>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRecvTransport {
    pub dtls_parameters: DtlsParameters,
}

impl Request for ConnectRecvTransport {
    const EVENT: &'static str = events::TRANSPORT_RECV_CONNECT;
    type Reply = Reply<Ack>;
}

// --- transport-produce ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Produce {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id: Option<String>,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: AppData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceReply {
    pub id: String,
}

impl Request for Produce {
    const EVENT: &'static str = events::TRANSPORT_PRODUCE;
    type Reply = Reply<ProduceReply>;
}

// --- consume ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consume {
    pub rtp_capabilities: RtpCapabilities,
    /// Producer to consume; the most recently published one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeReply {
    pub params: Reply<ConsumerParams>,
}

impl Request for Consume {
    const EVENT: &'static str = events::CONSUME;
    type Reply = ConsumeReply;
}

// --- notifications ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerResume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
}

impl Notification for ConsumerResume {
    const EVENT: &'static str = events::CONSUMER_RESUME;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClose {
    pub producer_id: String,
}

impl Notification for ProducerClose {
    const EVENT: &'static str = events::PRODUCER_CLOSE;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSuccess {
    pub socket_id: String,
}

impl Notification for ConnectionSuccess {
    const EVENT: &'static str = events::CONNECTION_SUCCESS;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerClosed {
    pub consumer_id: String,
    pub producer_id: String,
}

impl Notification for ConsumerClosed {
    const EVENT: &'static str = events::CONSUMER_CLOSED;
}

/// Decoded client-to-server event
#[derive(Debug, Clone)]
pub enum ClientEvent {
    GetRouterRtpCapabilities,
    CreateWebRtcTransport(CreateWebRtcTransport),
    ConnectTransport(ConnectTransport),
    Produce(Produce),
    ConnectRecvTransport(ConnectRecvTransport),
    Consume(Consume),
    ConsumerResume(ConsumerResume),
    ProducerClose(ProducerClose),
}

impl ClientEvent {
    /// Decode an event by name; a `null` payload is read as an empty object
    pub fn decode(event: &str, data: Value) -> Result<Self, ProtocolError> {
        let data = if data.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            data
        };

        let decoded = match event {
            events::GET_ROUTER_RTP_CAPABILITIES => Self::GetRouterRtpCapabilities,
            events::CREATE_WEBRTC_TRANSPORT => Self::CreateWebRtcTransport(parse(event, data)?),
            events::TRANSPORT_CONNECT => Self::ConnectTransport(parse(event, data)?),
            events::TRANSPORT_PRODUCE => Self::Produce(parse(event, data)?),
            events::TRANSPORT_RECV_CONNECT => Self::ConnectRecvTransport(parse(event, data)?),
            events::CONSUME => Self::Consume(parse(event, data)?),
            events::CONSUMER_RESUME => Self::ConsumerResume(parse(event, data)?),
            events::PRODUCER_CLOSE => Self::ProducerClose(parse(event, data)?),
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };

        Ok(decoded)
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GetRouterRtpCapabilities => events::GET_ROUTER_RTP_CAPABILITIES,
            Self::CreateWebRtcTransport(_) => events::CREATE_WEBRTC_TRANSPORT,
            Self::ConnectTransport(_) => events::TRANSPORT_CONNECT,
            Self::Produce(_) => events::TRANSPORT_PRODUCE,
            Self::ConnectRecvTransport(_) => events::TRANSPORT_RECV_CONNECT,
            Self::Consume(_) => events::CONSUME,
            Self::ConsumerResume(_) => events::CONSUMER_RESUME,
            Self::ProducerClose(_) => events::PRODUCER_CLOSE,
        }
    }

    /// Notifications never receive a reply, even when the frame carries an id
    #[must_use]
    pub const fn expects_reply(&self) -> bool {
        !matches!(self, Self::ConsumerResume(_) | Self::ProducerClose(_))
    }
}

/// Decoded server-to-client notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ConnectionSuccess(ConnectionSuccess),
    ConsumerClosed(ConsumerClosed),
}

impl ServerEvent {
    pub fn decode(event: &str, data: Value) -> Result<Self, ProtocolError> {
        match event {
            events::CONNECTION_SUCCESS => Ok(Self::ConnectionSuccess(parse(event, data)?)),
            events::CONSUMER_CLOSED => Ok(Self::ConsumerClosed(parse(event, data)?)),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}

fn parse<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidPayload {
        event: event.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, StateReason};
    use serde_json::json;

    #[test]
    fn test_decode_create_transport() {
        let event = ClientEvent::decode("createWebRTCTransport", json!({"sender": true}))
            .expect("should decode");
        match event {
            ClientEvent::CreateWebRtcTransport(req) => assert!(req.sender),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_capabilities_ignores_payload() {
        let event = ClientEvent::decode("getRouterRtpCapabilities", Value::Null)
            .expect("should decode");
        assert!(matches!(event, ClientEvent::GetRouterRtpCapabilities));
        assert!(event.expects_reply());
    }

    #[test]
    fn test_decode_resume_without_payload() {
        let event = ClientEvent::decode("consumer-resume", Value::Null).expect("should decode");
        match event {
            ClientEvent::ConsumerResume(resume) => assert!(resume.consumer_id.is_none()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_event() {
        let err = ClientEvent::decode("join-room", json!({})).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownEvent(name) if name == "join-room"));
    }

    #[test]
    fn test_decode_invalid_payload() {
        let err = ClientEvent::decode("transport-produce", json!({"kind": "hologram"})).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { ref event, .. } if event == "transport-produce"));
    }

    #[test]
    fn test_reply_prefers_error_shape() {
        let reply: ConsumeReply =
            serde_json::from_value(json!({"params": {"error": "ConsumeDenied"}}))
                .expect("should parse");
        let err = reply.params.into_result().unwrap_err();
        assert_eq!(err.error, ErrorKind::ConsumeDenied);
    }

    #[test]
    fn test_ack_reply_success_and_failure() {
        let ok: Reply<Ack> = serde_json::from_value(json!({})).expect("should parse");
        assert_eq!(ok, Reply::Success(Ack {}));

        let failed: Reply<Ack> = serde_json::from_value(
            json!({"error": "StateError", "reason": "NoSuchTransport"}),
        )
        .expect("should parse");
        let err = failed.into_result().unwrap_err();
        assert_eq!(err.reason, Some(StateReason::NoSuchTransport));
    }

    #[test]
    fn test_unknown_error_kind_is_still_a_failure() {
        let reply: Reply<Ack> =
            serde_json::from_value(json!({"error": "Unavailable", "message": "worker died"}))
                .expect("should parse");
        let err = reply.into_result().unwrap_err();
        assert_eq!(err.error, ErrorKind::ProtocolError);
        assert_eq!(err.message.as_deref(), Some("Unavailable: worker died"));

        let reply: Reply<ProduceReply> =
            serde_json::from_value(json!({"error": {"code": 500}, "id": "p1"}))
                .expect("should parse");
        assert!(reply.into_result().is_err());
    }

    #[test]
    fn test_ack_rejects_unexpected_fields() {
        let result = serde_json::from_value::<Reply<Ack>>(json!({"status": "connected"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_capabilities_reply_carries_errors() {
        let reply: <GetRouterRtpCapabilities as Request>::Reply = serde_json::from_value(
            json!({"error": "StateError", "reason": "Closed", "message": "connection closed"}),
        )
        .expect("should parse");
        let err = reply.into_result().unwrap_err();
        assert_eq!(err.reason, Some(StateReason::Closed));

        let reply: <GetRouterRtpCapabilities as Request>::Reply =
            serde_json::from_value(json!({"routerRtpCapabilities": {"codecs": []}}))
                .expect("should parse");
        assert!(reply.into_result().is_ok());
    }

    #[test]
    fn test_server_event_decode() {
        let event = ServerEvent::decode("connection-success", json!({"socketId": "abc"}))
            .expect("should decode");
        assert_eq!(
            event,
            ServerEvent::ConnectionSuccess(ConnectionSuccess {
                socket_id: "abc".to_string()
            })
        );
    }
}

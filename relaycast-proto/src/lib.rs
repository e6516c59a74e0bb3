//! Relaycast signaling protocol
//!
//! Wire contract shared by the signaling server (`relaycast-api`) and the
//! client negotiator (`relaycast-client`).
//!
//! ## Frames
//!
//! Every message is a JSON text frame:
//!
//! - client request: `{"id": 3, "event": "createWebRTCTransport", "data": {"sender": true}}`
//! - client notification: `{"event": "consumer-resume", "data": {"consumerId": "..."}}`
//! - server reply: `{"id": 3, "data": {"params": {...}}}`
//! - server notification: `{"event": "connection-success", "data": {"socketId": "..."}}`
//!
//! A frame carrying an `id` expects exactly one reply with the same `id`.
//!
//! ## Payloads
//!
//! Capability, ICE, DTLS, SCTP and RTP objects are opaque JSON values. They are
//! relayed between the client's local media context and the server's media
//! engine without interpretation.

mod error;
mod event;
mod frame;
mod payload;

pub use error::{ErrorKind, ErrorPayload, ProtocolError, StateReason};
pub use event::{
    events, Ack, CapabilitiesReply, ClientEvent, ConnectRecvTransport, ConnectTransport,
    ConnectionSuccess, Consume, ConsumeReply, ConsumerClosed, ConsumerResume,
    CreateTransportReply, CreateWebRtcTransport, GetRouterRtpCapabilities, Notification,
    Produce, ProduceReply, ProducerClose, Reply, Request, ServerEvent,
};
pub use frame::{ClientFrame, ServerFrame};
pub use payload::{
    AppData, ConsumerParams, DtlsParameters, IceCandidates, IceParameters, MediaKind,
    RtpCapabilities, RtpParameters, SctpParameters, TransportParams,
};

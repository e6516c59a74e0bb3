//! Media engine seam
//!
//! The engine owns everything below signaling: ICE/DTLS/SRTP, RTP forwarding
//! and codec capability computation. The coordinator only sees the narrow
//! interface below and relays the opaque parameter objects it returns.
//! Lifecycle changes flow back up through [`MediaEngine::subscribe`].

use async_trait::async_trait;
use relaycast_proto::{
    AppData, DtlsParameters, IceCandidates, IceParameters, MediaKind, RtpCapabilities,
    RtpParameters, SctpParameters,
};
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::{ListenIp, MediaCodec};
use crate::types::{ConsumerId, ProducerId, RoomId, RouterId, TransportId, TransportRole};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("rejected by media engine: {0}")]
    Rejected(String),

    #[error("unknown engine entity: {0}")]
    NotFound(String),

    #[error("media engine unavailable: {0}")]
    Unavailable(String),
}

/// Router created for one routing context
#[derive(Debug, Clone)]
pub struct RouterHandle {
    pub id: RouterId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub role: TransportRole,
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

/// Connection parameters of an engine transport
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: IceCandidates,
    pub dtls_parameters: DtlsParameters,
    pub sctp_parameters: Option<SctpParameters>,
}

#[derive(Debug, Clone)]
pub struct ProduceOptions {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: AppData,
}

#[derive(Debug, Clone)]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
    pub paused: bool,
}

#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: AppData,
    pub paused: bool,
}

/// Why a producer went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerCloseReason {
    /// Closed through [`MediaEngine::close_producer`]
    Closed,
    /// The source track ended
    TrackEnded,
    /// Its transport closed
    TransportClosed,
}

impl fmt::Display for ProducerCloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::TrackEnded => write!(f, "trackended"),
            Self::TransportClosed => write!(f, "transportclose"),
        }
    }
}

/// Lifecycle change of an engine entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The transport is gone, e.g. its DTLS state reached `closed`
    TransportClosed { transport_id: TransportId },
    ProducerClosed {
        producer_id: ProducerId,
        reason: ProducerCloseReason,
    },
    /// The media worker is gone and took every entity with it
    WorkerDied { reason: String },
}

/// Operations the signaling core needs from the media engine
///
/// Implementations are constructed once at startup and shared by every
/// connection. Close operations are best effort and never fail.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Lifecycle events emitted after this call
    ///
    /// Every close is reported, including the ones requested through this
    /// trait. Subscribers ignore entities they do not own.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    async fn create_router(
        &self,
        room_id: &RoomId,
        codecs: &[MediaCodec],
    ) -> Result<RouterHandle, EngineError>;

    async fn create_transport(
        &self,
        router: &RouterHandle,
        options: &TransportOptions,
    ) -> Result<TransportInfo, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError>;

    async fn produce(
        &self,
        transport_id: &TransportId,
        options: ProduceOptions,
    ) -> Result<ProducerInfo, EngineError>;

    /// Whether a consumer with these capabilities could receive the producer
    fn can_consume(
        &self,
        router: &RouterHandle,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool;

    async fn consume(
        &self,
        transport_id: &TransportId,
        options: ConsumeOptions,
    ) -> Result<ConsumerInfo, EngineError>;

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError>;

    async fn close_transport(&self, transport_id: &TransportId);

    async fn close_producer(&self, producer_id: &ProducerId);

    async fn close_consumer(&self, consumer_id: &ConsumerId);

    async fn close_router(&self, router_id: &RouterId);
}

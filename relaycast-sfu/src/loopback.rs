//! In-process reference media engine
//!
//! Keeps the bookkeeping a real engine would (routers, transports, producers,
//! consumers and their ownership) and hands out well-formed opaque parameters,
//! but moves no media. The `simulate_*` hooks stand in for what a real engine
//! observes on the wire: DTLS closing, a source track ending, the worker dying.

use async_trait::async_trait;
use dashmap::DashMap;
use relaycast_proto::{
    AppData, DtlsParameters, IceCandidates, IceParameters, MediaKind, RtpCapabilities,
    RtpParameters,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::capability::{build_capabilities, codec_refs, CodecRef};
use crate::config::{MediaCodec, SfuConfig};
use crate::engine::{
    ConsumeOptions, ConsumerInfo, EngineError, EngineEvent, MediaEngine, ProduceOptions,
    ProducerCloseReason, ProducerInfo, RouterHandle, TransportInfo, TransportOptions,
};
use crate::types::{
    generate_id, ConsumerId, ProducerId, RoomId, RouterId, TransportId, TransportRole,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct RouterEntry {
    room_id: RoomId,
    codecs: Vec<CodecRef>,
}

#[derive(Debug)]
struct TransportEntry {
    router_id: RouterId,
    role: TransportRole,
    connected: bool,
}

#[derive(Debug)]
struct ProducerEntry {
    transport_id: TransportId,
    router_id: RouterId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[derive(Debug)]
struct ConsumerEntry {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

/// Reference [`MediaEngine`] without media I/O
pub struct LoopbackEngine {
    routers: DashMap<RouterId, RouterEntry>,
    transports: DashMap<TransportId, TransportEntry>,
    producers: DashMap<ProducerId, ProducerEntry>,
    consumers: DashMap<ConsumerId, ConsumerEntry>,
    min_port: u16,
    max_port: u16,
    next_port: AtomicU16,
    next_ssrc: AtomicU32,
    latency: Duration,
    shut_down: AtomicBool,
    events: broadcast::Sender<EngineEvent>,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new(min_port: u16, max_port: u16) -> Self {
        let (min_port, max_port) = if min_port <= max_port {
            (min_port, max_port)
        } else {
            (max_port, min_port)
        };

        Self {
            routers: DashMap::new(),
            transports: DashMap::new(),
            producers: DashMap::new(),
            consumers: DashMap::new(),
            min_port,
            max_port,
            next_port: AtomicU16::new(0),
            next_ssrc: AtomicU32::new(100_000_000),
            latency: Duration::ZERO,
            shut_down: AtomicBool::new(false),
            events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        }
    }

    #[must_use]
    pub fn from_config(config: &SfuConfig) -> Self {
        Self::new(config.rtc_min_port, config.rtc_max_port)
    }

    /// Delay every async operation, e.g. to exercise teardown races
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every later operation fail with [`EngineError::Unavailable`]
    pub fn shut_down(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    /// The worker died: drop every entity and report it
    pub fn simulate_worker_died(&self, reason: &str) {
        self.shut_down();
        self.consumers.clear();
        self.producers.clear();
        self.transports.clear();
        self.routers.clear();
        warn!(reason, "Loopback media worker died");
        self.emit(EngineEvent::WorkerDied {
            reason: reason.to_string(),
        });
    }

    /// The DTLS state of a transport reached `closed`
    pub async fn simulate_dtls_closed(&self, transport_id: &TransportId) {
        debug!(transport_id = %transport_id, "Loopback DTLS closed");
        self.close_transport(transport_id).await;
    }

    /// The source track of a producer ended
    pub fn simulate_track_ended(&self, producer_id: &ProducerId) {
        self.remove_producer(producer_id, ProducerCloseReason::TrackEnded);
    }

    pub fn router_count(&self) -> usize {
        self.routers.len()
    }

    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Pause state of a consumer, `None` when it does not exist
    pub fn is_paused(&self, consumer_id: &ConsumerId) -> Option<bool> {
        self.consumers.get(consumer_id).map(|c| c.paused)
    }

    pub fn is_connected(&self, transport_id: &TransportId) -> Option<bool> {
        self.transports.get(transport_id).map(|t| t.connected)
    }

    async fn enter(&self) -> Result<(), EngineError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable("media worker shut down".to_string()));
        }
        Ok(())
    }

    fn allocate_port(&self) -> u16 {
        let span = u32::from(self.max_port - self.min_port) + 1;
        let offset = u32::from(self.next_port.fetch_add(1, Ordering::Relaxed)) % span;
        // offset < span <= u16::MAX + 1, so the sum stays within max_port
        self.min_port + u16::try_from(offset).unwrap_or(0)
    }

    fn remove_consumers_where(&self, predicate: impl Fn(&ConsumerEntry) -> bool) {
        self.consumers.retain(|_, consumer| !predicate(consumer));
    }

    fn remove_producer(&self, producer_id: &ProducerId, reason: ProducerCloseReason) {
        if self.producers.remove(producer_id).is_none() {
            return;
        }
        self.remove_consumers_where(|c| &c.producer_id == producer_id);
        self.emit(EngineEvent::ProducerClosed {
            producer_id: producer_id.clone(),
            reason,
        });
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        let config = SfuConfig::default();
        Self::from_config(&config)
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn create_router(
        &self,
        room_id: &RoomId,
        codecs: &[MediaCodec],
    ) -> Result<RouterHandle, EngineError> {
        self.enter().await?;
        if codecs.is_empty() {
            return Err(EngineError::Rejected("router needs at least one codec".to_string()));
        }

        let rtp_capabilities = build_capabilities(codecs);
        let id = RouterId::generate();
        self.routers.insert(
            id.clone(),
            RouterEntry {
                room_id: room_id.clone(),
                codecs: codec_refs(rtp_capabilities.as_value()),
            },
        );
        debug!(router_id = %id, room_id = %room_id, "Loopback router created");

        Ok(RouterHandle {
            id,
            rtp_capabilities,
        })
    }

    async fn create_transport(
        &self,
        router: &RouterHandle,
        options: &TransportOptions,
    ) -> Result<TransportInfo, EngineError> {
        self.enter().await?;
        if !self.routers.contains_key(&router.id) {
            return Err(EngineError::NotFound(format!("router {}", router.id)));
        }
        if options.listen_ips.is_empty() {
            return Err(EngineError::Rejected("no listen ips".to_string()));
        }
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::Rejected("neither udp nor tcp enabled".to_string()));
        }

        let id = TransportId::generate();
        let mut candidates = Vec::new();
        for (index, listen_ip) in options.listen_ips.iter().enumerate() {
            let base_priority = 1_076_302_079_u32.saturating_sub(u32::try_from(index).unwrap_or(0) * 1000);
            let (udp_priority, tcp_priority) = if options.prefer_udp {
                (base_priority, base_priority - 500)
            } else {
                (base_priority - 500, base_priority)
            };
            if options.enable_udp {
                candidates.push(json!({
                    "foundation": format!("udpcandidate{index}"),
                    "priority": udp_priority,
                    "ip": listen_ip.candidate_ip(),
                    "address": listen_ip.candidate_ip(),
                    "protocol": "udp",
                    "port": self.allocate_port(),
                    "type": "host",
                }));
            }
            if options.enable_tcp {
                candidates.push(json!({
                    "foundation": format!("tcpcandidate{index}"),
                    "priority": tcp_priority,
                    "ip": listen_ip.candidate_ip(),
                    "address": listen_ip.candidate_ip(),
                    "protocol": "tcp",
                    "port": self.allocate_port(),
                    "type": "host",
                    "tcpType": "passive",
                }));
            }
        }

        self.transports.insert(
            id.clone(),
            TransportEntry {
                router_id: router.id.clone(),
                role: options.role,
                connected: false,
            },
        );
        debug!(transport_id = %id, role = %options.role, "Loopback transport created");

        Ok(TransportInfo {
            ice_parameters: IceParameters::new(json!({
                "usernameFragment": id.as_str(),
                "password": format!("{}{}", generate_id(), generate_id()),
                "iceLite": true,
            })),
            ice_candidates: IceCandidates::new(Value::Array(candidates)),
            dtls_parameters: DtlsParameters::new(json!({
                "role": "auto",
                "fingerprints": [{"algorithm": "sha-256", "value": fingerprint(&id)}],
            })),
            sctp_parameters: None,
            id,
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        self.enter().await?;
        let has_fingerprint = dtls_parameters
            .as_value()
            .get("fingerprints")
            .and_then(Value::as_array)
            .is_some_and(|fingerprints| !fingerprints.is_empty());
        if !has_fingerprint {
            return Err(EngineError::Rejected(
                "dtlsParameters carry no fingerprints".to_string(),
            ));
        }

        let mut transport = self
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;
        if transport.connected {
            return Err(EngineError::Rejected(format!(
                "transport {transport_id} already connected"
            )));
        }
        transport.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        options: ProduceOptions,
    ) -> Result<ProducerInfo, EngineError> {
        self.enter().await?;
        let router_id = {
            let transport = self
                .transports
                .get(transport_id)
                .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;
            if transport.role != TransportRole::Send {
                return Err(EngineError::Rejected(format!(
                    "transport {transport_id} cannot produce"
                )));
            }
            transport.router_id.clone()
        };

        let supported = {
            let router = self
                .routers
                .get(&router_id)
                .ok_or_else(|| EngineError::NotFound(format!("router {router_id}")))?;
            codec_refs(options.rtp_parameters.as_value())
                .iter()
                .any(|codec| codec.kind == options.kind && router.codecs.contains(codec))
        };
        if !supported {
            return Err(EngineError::Rejected(format!(
                "no supported {} codec in rtpParameters",
                options.kind
            )));
        }

        let id = ProducerId::generate();
        self.producers.insert(
            id.clone(),
            ProducerEntry {
                transport_id: transport_id.clone(),
                router_id,
                kind: options.kind,
                rtp_parameters: options.rtp_parameters,
            },
        );
        debug!(producer_id = %id, kind = %options.kind, "Loopback producer created");

        Ok(ProducerInfo {
            id,
            kind: options.kind,
        })
    }

    fn can_consume(
        &self,
        router: &RouterHandle,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        let Some(producer) = self.producers.get(producer_id) else {
            return false;
        };
        if producer.router_id != router.id {
            return false;
        }

        let offered = codec_refs(rtp_capabilities.as_value());
        codec_refs(producer.rtp_parameters.as_value())
            .iter()
            .any(|codec| codec.kind == producer.kind && offered.contains(codec))
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        options: ConsumeOptions,
    ) -> Result<ConsumerInfo, EngineError> {
        self.enter().await?;
        if !self.transports.contains_key(transport_id) {
            return Err(EngineError::NotFound(format!("transport {transport_id}")));
        }

        let (kind, codecs) = {
            let producer = self
                .producers
                .get(&options.producer_id)
                .ok_or_else(|| EngineError::NotFound(format!("producer {}", options.producer_id)))?;
            let offered = codec_refs(options.rtp_capabilities.as_value());
            let codecs: Vec<Value> = producer
                .rtp_parameters
                .as_value()
                .get("codecs")
                .and_then(Value::as_array)
                .map(|codecs| {
                    codecs
                        .iter()
                        .filter(|codec| {
                            codec_refs(&json!({ "codecs": [codec] }))
                                .first()
                                .is_some_and(|c| offered.contains(c))
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (producer.kind, codecs)
        };
        if codecs.is_empty() {
            return Err(EngineError::Rejected(
                "consumer capabilities share no codec with the producer".to_string(),
            ));
        }

        let id = ConsumerId::generate();
        let ssrc = self.next_ssrc.fetch_add(1, Ordering::Relaxed);
        let rtp_parameters = RtpParameters::new(json!({
            "mid": id.as_str(),
            "codecs": codecs,
            "encodings": [{"ssrc": ssrc}],
            "rtcp": {"cname": options.producer_id.as_str(), "reducedSize": true},
        }));

        self.consumers.insert(
            id.clone(),
            ConsumerEntry {
                transport_id: transport_id.clone(),
                producer_id: options.producer_id.clone(),
                paused: options.paused,
            },
        );
        debug!(consumer_id = %id, producer_id = %options.producer_id, "Loopback consumer created");

        Ok(ConsumerInfo {
            id,
            producer_id: options.producer_id,
            kind,
            rtp_parameters,
            app_data: AppData::default(),
            paused: options.paused,
        })
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        self.enter().await?;
        let mut consumer = self
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::NotFound(format!("consumer {consumer_id}")))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) {
        if self.transports.remove(transport_id).is_none() {
            return;
        }

        let owned: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|p| &p.transport_id == transport_id)
            .map(|p| p.key().clone())
            .collect();
        for producer_id in owned {
            self.remove_producer(&producer_id, ProducerCloseReason::TransportClosed);
        }
        self.remove_consumers_where(|c| &c.transport_id == transport_id);
        self.emit(EngineEvent::TransportClosed {
            transport_id: transport_id.clone(),
        });
    }

    async fn close_producer(&self, producer_id: &ProducerId) {
        self.remove_producer(producer_id, ProducerCloseReason::Closed);
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) {
        self.consumers.remove(consumer_id);
    }

    async fn close_router(&self, router_id: &RouterId) {
        let Some((_, router)) = self.routers.remove(router_id) else {
            return;
        };

        let owned: Vec<TransportId> = self
            .transports
            .iter()
            .filter(|t| &t.router_id == router_id)
            .map(|t| t.key().clone())
            .collect();
        for transport_id in owned {
            self.close_transport(&transport_id).await;
        }
        debug!(router_id = %router_id, room_id = %router.room_id, "Loopback router closed");
    }
}

/// Colon separated sha-256 shaped fingerprint derived from the transport id
fn fingerprint(id: &TransportId) -> String {
    let seed = id.as_str().as_bytes();
    (0..32)
        .map(|i| {
            let byte = seed
                .get(i % seed.len().max(1))
                .copied()
                .unwrap_or_default()
                .wrapping_mul(31)
                .wrapping_add(u8::try_from(i).unwrap_or(0));
            format!("{byte:02X}")
        })
        .collect::<Vec<_>>()
        .join(":")
}

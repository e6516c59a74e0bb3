//! Per-connection transport coordinator
//!
//! Owns the send/receive transports, producers and consumers of one signaling
//! connection. Every handler returns exactly one result which the signaling
//! layer turns into the reply.
//!
//! Engine calls are awaited without holding the state lock and race against the
//! connection's cancellation token. Whatever an engine call produced after the
//! coordinator was closed is closed again and reported as `StateError(Closed)`.
//!
//! Closes originating in the engine arrive through [`TransportCoordinator::on_engine_event`]
//! and cascade exactly like closes requested by the client.

use parking_lot::Mutex;
use relaycast_proto::{
    AppData, ConsumerParams, DtlsParameters, MediaKind, RtpCapabilities, RtpParameters,
    StateReason, TransportParams,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ProducerSlotPolicy, SfuConfig};
use crate::engine::{
    ConsumeOptions, EngineError, EngineEvent, MediaEngine, ProduceOptions, TransportOptions,
};
use crate::error::{Result, SfuError};
use crate::room::RoutingContext;
use crate::types::{ConnectionId, ConsumerId, ProducerId, TransportId, TransportRole, TransportState};

#[derive(Debug, Clone)]
struct TransportSlot {
    id: TransportId,
    state: TransportState,
}

impl TransportSlot {
    fn is_live(&self) -> bool {
        self.state != TransportState::Closed
    }
}

#[derive(Debug, Clone)]
struct ProducerEntry {
    transport_id: TransportId,
    kind: MediaKind,
}

#[derive(Debug, Clone)]
struct ConsumerEntry {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    send: Option<TransportSlot>,
    recv: Option<TransportSlot>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    closed: bool,
}

impl CoordinatorState {
    fn slot(&self, role: TransportRole) -> Option<&TransportSlot> {
        match role {
            TransportRole::Send => self.send.as_ref(),
            TransportRole::Recv => self.recv.as_ref(),
        }
    }

    fn slot_mut(&mut self, role: TransportRole) -> &mut Option<TransportSlot> {
        match role {
            TransportRole::Send => &mut self.send,
            TransportRole::Recv => &mut self.recv,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(SfuError::closed())
        } else {
            Ok(())
        }
    }

    /// Id of the live, connected transport for `role`
    fn connected_transport(&self, role: TransportRole) -> Result<TransportId> {
        let slot = self.slot(role).filter(|slot| slot.is_live()).ok_or_else(|| {
            SfuError::state(StateReason::NoSuchTransport, format!("no {role} transport"))
        })?;
        if slot.state != TransportState::Connected {
            return Err(SfuError::state(
                StateReason::TransportNotConnected,
                format!("{role} transport {} is not connected", slot.id),
            ));
        }
        Ok(slot.id.clone())
    }

    fn owns_live_transport(&self, role: TransportRole, id: &TransportId) -> bool {
        self.slot(role)
            .is_some_and(|slot| slot.is_live() && &slot.id == id)
    }
}

/// A consumer closed because the producer it referenced went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedConsumer {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
}

pub struct TransportCoordinator {
    connection_id: ConnectionId,
    room: Arc<RoutingContext>,
    engine: Arc<dyn MediaEngine>,
    config: Arc<SfuConfig>,
    state: Mutex<CoordinatorState>,
    cancel: CancellationToken,
}

impl TransportCoordinator {
    pub fn new(
        connection_id: ConnectionId,
        room: Arc<RoutingContext>,
        engine: Arc<dyn MediaEngine>,
        config: Arc<SfuConfig>,
    ) -> Self {
        Self {
            connection_id,
            room,
            engine,
            config,
            state: Mutex::new(CoordinatorState::default()),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    #[must_use]
    pub fn room(&self) -> &Arc<RoutingContext> {
        &self.room
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Token cancelled when the connection is torn down
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Abort in-flight engine operations without releasing anything yet
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn transport_state(&self, role: TransportRole) -> Option<TransportState> {
        self.state.lock().slot(role).map(|slot| slot.state)
    }

    pub fn transport_id(&self, role: TransportRole) -> Option<TransportId> {
        self.state.lock().slot(role).map(|slot| slot.id.clone())
    }

    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.state.lock().producers.keys().cloned().collect()
    }

    pub fn consumer_ids(&self) -> Vec<ConsumerId> {
        self.state.lock().consumers.keys().cloned().collect()
    }

    pub fn producer_count(&self) -> usize {
        self.state.lock().producers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Pause state of an owned consumer
    pub fn is_consumer_paused(&self, consumer_id: &ConsumerId) -> Option<bool> {
        self.state.lock().consumers.get(consumer_id).map(|c| c.paused)
    }

    async fn guarded<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, EngineError>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(SfuError::closed()),
            result = operation => result.map_err(SfuError::from),
        }
    }

    /// Router capabilities of the routing context
    pub fn get_capabilities(&self) -> Result<RtpCapabilities> {
        self.state.lock().ensure_open()?;
        Ok(self.room.capabilities().clone())
    }

    pub async fn create_transport(&self, role: TransportRole) -> Result<TransportParams> {
        {
            let state = self.state.lock();
            state.ensure_open()?;
            if let Some(slot) = state.slot(role).filter(|slot| slot.is_live()) {
                return Err(SfuError::state(
                    StateReason::TransportExists,
                    format!("{role} transport {} already exists", slot.id),
                ));
            }
        }

        let options = TransportOptions {
            role,
            listen_ips: self.config.listen_ips.clone(),
            enable_udp: self.config.enable_udp,
            enable_tcp: self.config.enable_tcp,
            prefer_udp: self.config.prefer_udp,
        };
        let info = self
            .guarded(self.engine.create_transport(self.room.router(), &options))
            .await
            .inspect_err(|e| {
                warn!(connection_id = %self.connection_id, role = %role, error = %e, "Failed to create transport");
            })?;

        let rejected = {
            let mut state = self.state.lock();
            if state.closed {
                Some(SfuError::closed())
            } else if state.slot(role).is_some_and(TransportSlot::is_live) {
                Some(SfuError::state(
                    StateReason::TransportExists,
                    format!("{role} transport already exists"),
                ))
            } else {
                *state.slot_mut(role) = Some(TransportSlot {
                    id: info.id.clone(),
                    state: TransportState::Created,
                });
                None
            }
        };
        if let Some(err) = rejected {
            self.engine.close_transport(&info.id).await;
            return Err(err);
        }

        info!(
            connection_id = %self.connection_id,
            room_id = %self.room.id(),
            transport_id = %info.id,
            role = %role,
            "Transport created"
        );

        Ok(TransportParams {
            id: info.id.to_string(),
            ice_parameters: info.ice_parameters,
            ice_candidates: info.ice_candidates,
            dtls_parameters: info.dtls_parameters,
            sctp_parameters: info.sctp_parameters,
        })
    }

    pub async fn connect_transport(
        &self,
        role: TransportRole,
        dtls_parameters: &DtlsParameters,
    ) -> Result<()> {
        let transport_id = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            let slot = state
                .slot_mut(role)
                .as_mut()
                .filter(|slot| slot.is_live())
                .ok_or_else(|| {
                    SfuError::state(StateReason::NoSuchTransport, format!("no {role} transport"))
                })?;
            if slot.state != TransportState::Created {
                return Err(SfuError::state(
                    StateReason::AlreadyConnected,
                    format!("{role} transport {} is already {:?}", slot.id, slot.state),
                ));
            }
            slot.state = TransportState::Connecting;
            slot.id.clone()
        };

        let result = self
            .guarded(self.engine.connect_transport(&transport_id, dtls_parameters))
            .await;

        let mut state = self.state.lock();
        if state.closed {
            return Err(SfuError::closed());
        }
        let slot = state
            .slot_mut(role)
            .as_mut()
            .filter(|slot| slot.id == transport_id && slot.state == TransportState::Connecting);
        match (result, slot) {
            (Ok(()), Some(slot)) => {
                slot.state = TransportState::Connected;
                info!(
                    connection_id = %self.connection_id,
                    transport_id = %transport_id,
                    role = %role,
                    "Transport connected"
                );
                Ok(())
            }
            (Ok(()), None) => Err(SfuError::state(
                StateReason::NoSuchTransport,
                format!("{role} transport {transport_id} was closed while connecting"),
            )),
            (Err(err), slot) => {
                if let Some(slot) = slot {
                    slot.state = TransportState::Created;
                }
                warn!(
                    connection_id = %self.connection_id,
                    transport_id = %transport_id,
                    error = %err,
                    "Transport connect failed"
                );
                Err(err)
            }
        }
    }

    /// Create a producer on the send transport and publish it to the room
    pub async fn produce(
        &self,
        transport_id: Option<TransportId>,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: AppData,
    ) -> Result<ProducerId> {
        let (send_id, previous) = {
            let state = self.state.lock();
            state.ensure_open()?;
            let send_id = state.connected_transport(TransportRole::Send)?;
            if let Some(requested) = transport_id.as_ref().filter(|id| **id != send_id) {
                return Err(SfuError::state(
                    StateReason::TransportMismatch,
                    format!("transport {requested} is not the send transport {send_id}"),
                ));
            }

            let previous = state
                .producers
                .iter()
                .find(|(_, producer)| producer.kind == kind)
                .map(|(id, _)| id.clone());
            let previous = match (self.config.producer_slot_policy, previous) {
                (ProducerSlotPolicy::Reject, Some(existing)) => {
                    return Err(SfuError::state(
                        StateReason::ProducerExists,
                        format!("{kind} producer {existing} already exists"),
                    ));
                }
                (ProducerSlotPolicy::Replace, previous) => previous,
                _ => None,
            };
            (send_id, previous)
        };

        let options = ProduceOptions {
            kind,
            rtp_parameters,
            app_data,
        };
        let producer = self
            .guarded(self.engine.produce(&send_id, options))
            .await
            .inspect_err(|e| {
                warn!(connection_id = %self.connection_id, kind = %kind, error = %e, "Produce failed");
            })?;

        let rejected = {
            let mut state = self.state.lock();
            if state.closed {
                Some(SfuError::closed())
            } else if !state.owns_live_transport(TransportRole::Send, &send_id) {
                Some(SfuError::state(
                    StateReason::NoSuchTransport,
                    "send transport closed while producing",
                ))
            } else {
                state.producers.insert(
                    producer.id.clone(),
                    ProducerEntry {
                        transport_id: send_id.clone(),
                        kind,
                    },
                );
                None
            }
        };
        if let Some(err) = rejected {
            self.engine.close_producer(&producer.id).await;
            return Err(err);
        }

        if let Some(previous) = previous {
            debug!(
                connection_id = %self.connection_id,
                old_producer_id = %previous,
                new_producer_id = %producer.id,
                "Replacing producer"
            );
            self.release_producer(&previous).await;
        }
        self.room
            .publish(producer.id.clone(), self.connection_id.clone(), kind);

        info!(
            connection_id = %self.connection_id,
            room_id = %self.room.id(),
            producer_id = %producer.id,
            kind = %kind,
            "Producer created"
        );
        Ok(producer.id)
    }

    /// Create a paused consumer on the receive transport
    ///
    /// Without an explicit producer the most recently published producer of the
    /// routing context is consumed.
    pub async fn consume(
        &self,
        rtp_capabilities: RtpCapabilities,
        producer_id: Option<ProducerId>,
    ) -> Result<ConsumerParams> {
        let recv_id = {
            let state = self.state.lock();
            state.ensure_open()?;
            state.connected_transport(TransportRole::Recv)?
        };

        let target = match producer_id {
            Some(id) => self.room.producer(&id).ok_or_else(|| {
                SfuError::state(StateReason::NoSuchProducer, format!("no producer {id}"))
            })?,
            None => self
                .room
                .latest_producer()
                .ok_or_else(|| SfuError::ConsumeDenied("no producer available".to_string()))?,
        };

        if !self
            .engine
            .can_consume(self.room.router(), &target.id, &rtp_capabilities)
        {
            warn!(
                connection_id = %self.connection_id,
                producer_id = %target.id,
                "Consumer capabilities cannot receive producer"
            );
            return Err(SfuError::ConsumeDenied(format!(
                "capabilities cannot consume producer {}",
                target.id
            )));
        }

        let options = ConsumeOptions {
            producer_id: target.id.clone(),
            rtp_capabilities,
            paused: true,
        };
        let consumer = self
            .guarded(self.engine.consume(&recv_id, options))
            .await
            .inspect_err(|e| {
                warn!(connection_id = %self.connection_id, producer_id = %target.id, error = %e, "Consume failed");
            })?;

        let rejected = {
            let mut state = self.state.lock();
            if state.closed {
                Some(SfuError::closed())
            } else if !state.owns_live_transport(TransportRole::Recv, &recv_id) {
                Some(SfuError::state(
                    StateReason::NoSuchTransport,
                    "receive transport closed while consuming",
                ))
            } else if !self.room.contains_producer(&consumer.producer_id) {
                Some(SfuError::state(
                    StateReason::NoSuchProducer,
                    format!("producer {} closed while consuming", consumer.producer_id),
                ))
            } else {
                state.consumers.insert(
                    consumer.id.clone(),
                    ConsumerEntry {
                        transport_id: recv_id.clone(),
                        producer_id: consumer.producer_id.clone(),
                        paused: consumer.paused,
                    },
                );
                None
            }
        };
        if let Some(err) = rejected {
            self.engine.close_consumer(&consumer.id).await;
            return Err(err);
        }

        info!(
            connection_id = %self.connection_id,
            consumer_id = %consumer.id,
            producer_id = %consumer.producer_id,
            kind = %consumer.kind,
            paused = consumer.paused,
            "Consumer created"
        );

        Ok(ConsumerParams {
            id: consumer.id.to_string(),
            producer_id: consumer.producer_id.to_string(),
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters,
            app_data: consumer.app_data,
        })
    }

    /// Resume a paused consumer, or every paused consumer when `consumer_id` is
    /// `None`. Unknown consumers are ignored. Returns how many were resumed.
    pub async fn resume_consumer(&self, consumer_id: Option<&ConsumerId>) -> Result<usize> {
        let targets: Vec<ConsumerId> = {
            let state = self.state.lock();
            state.ensure_open()?;
            match consumer_id {
                Some(id) => state
                    .consumers
                    .get(id)
                    .filter(|consumer| consumer.paused)
                    .map(|_| vec![id.clone()])
                    .unwrap_or_default(),
                None => state
                    .consumers
                    .iter()
                    .filter(|(_, consumer)| consumer.paused)
                    .map(|(id, _)| id.clone())
                    .collect(),
            }
        };

        if targets.is_empty() {
            debug!(connection_id = %self.connection_id, "Nothing to resume");
            return Ok(0);
        }

        let mut resumed = 0;
        for id in targets {
            self.guarded(self.engine.resume_consumer(&id)).await?;
            if let Some(consumer) = self.state.lock().consumers.get_mut(&id) {
                consumer.paused = false;
                resumed += 1;
            }
            debug!(connection_id = %self.connection_id, consumer_id = %id, "Consumer resumed");
        }
        Ok(resumed)
    }

    /// Close one of this connection's producers (the source track ended)
    pub async fn close_producer(&self, producer_id: &ProducerId) -> Result<()> {
        {
            let state = self.state.lock();
            state.ensure_open()?;
            if !state.producers.contains_key(producer_id) {
                return Err(SfuError::state(
                    StateReason::NoSuchProducer,
                    format!("no producer {producer_id}"),
                ));
            }
        }

        self.release_producer(producer_id).await;
        info!(connection_id = %self.connection_id, producer_id = %producer_id, "Producer closed");
        Ok(())
    }

    async fn release_producer(&self, producer_id: &ProducerId) {
        self.state.lock().producers.remove(producer_id);
        self.room.unpublish(producer_id);
        self.engine.close_producer(producer_id).await;
    }

    /// Drop every consumer referencing a producer that was closed by its owner
    pub async fn on_producer_closed(&self, producer_id: &ProducerId) -> Vec<ClosedConsumer> {
        let closed: Vec<ClosedConsumer> = {
            let mut state = self.state.lock();
            let ids: Vec<ConsumerId> = state
                .consumers
                .iter()
                .filter(|(_, consumer)| &consumer.producer_id == producer_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.consumers.remove(&id).map(|_| id))
                .map(|consumer_id| ClosedConsumer {
                    consumer_id,
                    producer_id: producer_id.clone(),
                })
                .collect()
        };

        for consumer in &closed {
            self.engine.close_consumer(&consumer.consumer_id).await;
            debug!(
                connection_id = %self.connection_id,
                consumer_id = %consumer.consumer_id,
                producer_id = %producer_id,
                "Consumer closed with its producer"
            );
        }
        closed
    }

    /// Apply a lifecycle change reported by the engine
    ///
    /// Entities this connection does not own, or already released, are ignored.
    pub async fn on_engine_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::TransportClosed { transport_id } => {
                let role = {
                    let state = self.state.lock();
                    [TransportRole::Send, TransportRole::Recv]
                        .into_iter()
                        .find(|role| state.owns_live_transport(*role, transport_id))
                };
                let Some(role) = role else { return };

                warn!(
                    connection_id = %self.connection_id,
                    transport_id = %transport_id,
                    role = %role,
                    "Transport closed by media engine"
                );
                if let Err(e) = self.close_transport(role).await {
                    debug!(connection_id = %self.connection_id, error = %e, "Transport already released");
                }
            }
            EngineEvent::ProducerClosed { producer_id, reason } => {
                if !self.state.lock().producers.contains_key(producer_id) {
                    return;
                }
                info!(
                    connection_id = %self.connection_id,
                    producer_id = %producer_id,
                    reason = %reason,
                    "Producer closed by media engine"
                );
                self.release_producer(producer_id).await;
            }
            EngineEvent::WorkerDied { reason } => {
                error!(connection_id = %self.connection_id, reason = %reason, "Media worker died");
                self.close().await;
            }
        }
    }

    /// Close one transport and everything it owns
    pub async fn close_transport(&self, role: TransportRole) -> Result<()> {
        let (transport_id, producers, consumers) = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            let slot = state
                .slot_mut(role)
                .as_mut()
                .filter(|slot| slot.is_live())
                .ok_or_else(|| {
                    SfuError::state(StateReason::NoSuchTransport, format!("no {role} transport"))
                })?;
            slot.state = TransportState::Closed;
            let transport_id = slot.id.clone();

            let producers: Vec<ProducerId> = state
                .producers
                .iter()
                .filter(|(_, p)| p.transport_id == transport_id)
                .map(|(id, _)| id.clone())
                .collect();
            let consumers: Vec<ConsumerId> = state
                .consumers
                .iter()
                .filter(|(_, c)| c.transport_id == transport_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &producers {
                state.producers.remove(id);
            }
            for id in &consumers {
                state.consumers.remove(id);
            }
            (transport_id, producers, consumers)
        };

        for id in &producers {
            self.room.unpublish(id);
        }
        for id in &consumers {
            self.engine.close_consumer(id).await;
        }
        for id in &producers {
            self.engine.close_producer(id).await;
        }
        self.engine.close_transport(&transport_id).await;

        info!(
            connection_id = %self.connection_id,
            transport_id = %transport_id,
            role = %role,
            producers = producers.len(),
            consumers = consumers.len(),
            "Transport closed"
        );
        Ok(())
    }

    /// Tear down the connection. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();

        let (transports, producers, consumers) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;

            let transports: Vec<TransportId> = [state.send.take(), state.recv.take()]
                .into_iter()
                .flatten()
                .filter(TransportSlot::is_live)
                .map(|slot| slot.id)
                .collect();
            let producers: Vec<ProducerId> = state.producers.drain().map(|(id, _)| id).collect();
            let consumers: Vec<ConsumerId> = state.consumers.drain().map(|(id, _)| id).collect();
            (transports, producers, consumers)
        };

        for id in &producers {
            self.room.unpublish(id);
        }
        for id in &consumers {
            self.engine.close_consumer(id).await;
        }
        for id in &producers {
            self.engine.close_producer(id).await;
        }
        for id in &transports {
            self.engine.close_transport(id).await;
        }

        info!(
            connection_id = %self.connection_id,
            room_id = %self.room.id(),
            transports = transports.len(),
            producers = producers.len(),
            consumers = consumers.len(),
            "Coordinator closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityRegistry;
    use crate::loopback::LoopbackEngine;
    use crate::room::RoomEvent;
    use crate::types::RoomId;
    use relaycast_proto::ErrorKind;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        engine: Arc<LoopbackEngine>,
        room: Arc<RoutingContext>,
        config: Arc<SfuConfig>,
    }

    impl Fixture {
        async fn new(config: SfuConfig) -> Self {
            Self::with_engine(config, LoopbackEngine::default()).await
        }

        async fn with_engine(config: SfuConfig, engine: LoopbackEngine) -> Self {
            let engine = Arc::new(engine);
            let registry = CapabilityRegistry::new(config.media_codecs.clone());
            let room_id = RoomId::from("room");
            let router = engine
                .create_router(&room_id, registry.codecs())
                .await
                .expect("router");
            let capabilities = registry.register(room_id.clone(), router.rtp_capabilities.clone());
            Self {
                engine,
                room: Arc::new(RoutingContext::new(room_id, router, capabilities)),
                config: Arc::new(config),
            }
        }

        fn coordinator(&self, connection: &str) -> TransportCoordinator {
            let engine: Arc<dyn MediaEngine> = self.engine.clone();
            TransportCoordinator::new(
                ConnectionId::from(connection),
                Arc::clone(&self.room),
                engine,
                Arc::clone(&self.config),
            )
        }
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters::new(json!({
            "role": "client",
            "fingerprints": [{"algorithm": "sha-256", "value": "AA:BB:CC"}],
        }))
    }

    fn vp8() -> RtpParameters {
        RtpParameters::new(json!({
            "codecs": [{"mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000}],
            "encodings": [{"rid": "r0", "maxBitrate": 100_000}],
        }))
    }

    fn opus() -> RtpParameters {
        RtpParameters::new(json!({
            "codecs": [{"mimeType": "audio/opus", "payloadType": 100, "clockRate": 48000, "channels": 2}],
        }))
    }

    async fn connected(coordinator: &TransportCoordinator, role: TransportRole) -> TransportId {
        let params = coordinator.create_transport(role).await.expect("create");
        coordinator
            .connect_transport(role, &dtls())
            .await
            .expect("connect");
        TransportId::from(params.id)
    }

    async fn producing(fixture: &Fixture, connection: &str) -> (TransportCoordinator, ProducerId) {
        let coordinator = fixture.coordinator(connection);
        connected(&coordinator, TransportRole::Send).await;
        let producer = coordinator
            .produce(None, MediaKind::Video, vp8(), AppData::default())
            .await
            .expect("produce");
        (coordinator, producer)
    }

    #[tokio::test]
    async fn test_capabilities_are_idempotent() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let coordinator = fixture.coordinator("a");
        let first = coordinator.get_capabilities().expect("caps");
        let second = coordinator.get_capabilities().expect("caps");
        assert_eq!(first, second);
        assert_eq!(first, fixture.coordinator("b").get_capabilities().expect("caps"));
    }

    #[tokio::test]
    async fn test_connect_without_transport() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let coordinator = fixture.coordinator("a");

        let err = coordinator
            .connect_transport(TransportRole::Send, &dtls())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert_eq!(err.reason(), Some(StateReason::NoSuchTransport));
    }

    #[tokio::test]
    async fn test_connect_twice() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let coordinator = fixture.coordinator("a");
        connected(&coordinator, TransportRole::Send).await;

        let err = coordinator
            .connect_transport(TransportRole::Send, &dtls())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::AlreadyConnected));
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_created() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let coordinator = fixture.coordinator("a");
        coordinator.create_transport(TransportRole::Send).await.expect("create");

        let err = coordinator
            .connect_transport(TransportRole::Send, &DtlsParameters::new(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFailure);
        assert_eq!(
            coordinator.transport_state(TransportRole::Send),
            Some(TransportState::Created)
        );

        coordinator
            .connect_transport(TransportRole::Send, &dtls())
            .await
            .expect("second attempt connects");
    }

    #[tokio::test]
    async fn test_duplicate_transport_rejected() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let coordinator = fixture.coordinator("a");
        coordinator.create_transport(TransportRole::Recv).await.expect("create");

        let err = coordinator.create_transport(TransportRole::Recv).await.unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::TransportExists));
        assert_eq!(fixture.engine.transport_count(), 1);
    }

    #[tokio::test]
    async fn test_produce_requires_connected_transport() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let coordinator = fixture.coordinator("a");

        let err = coordinator
            .produce(None, MediaKind::Video, vp8(), AppData::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::NoSuchTransport));

        coordinator.create_transport(TransportRole::Send).await.expect("create");
        let err = coordinator
            .produce(None, MediaKind::Video, vp8(), AppData::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::TransportNotConnected));
    }

    #[tokio::test]
    async fn test_produce_transport_mismatch() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let coordinator = fixture.coordinator("a");
        connected(&coordinator, TransportRole::Send).await;

        let err = coordinator
            .produce(
                Some(TransportId::from("someone-else")),
                MediaKind::Video,
                vp8(),
                AppData::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::TransportMismatch));
    }

    #[tokio::test]
    async fn test_consume_without_producer_is_denied() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let coordinator = fixture.coordinator("b");
        connected(&coordinator, TransportRole::Recv).await;

        let caps = coordinator.get_capabilities().expect("caps");
        let err = coordinator.consume(caps, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConsumeDenied);
        assert_eq!(coordinator.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_consumer_created_paused_then_resumed() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let (_producer_side, producer_id) = producing(&fixture, "a").await;

        let coordinator = fixture.coordinator("b");
        connected(&coordinator, TransportRole::Recv).await;
        let caps = coordinator.get_capabilities().expect("caps");
        let params = coordinator.consume(caps, None).await.expect("consume");

        assert_eq!(params.producer_id, producer_id.as_str());
        assert_eq!(params.kind, MediaKind::Video);
        let consumer_id = ConsumerId::from(params.id);
        assert_eq!(coordinator.is_consumer_paused(&consumer_id), Some(true));
        assert_eq!(fixture.engine.is_paused(&consumer_id), Some(true));

        let resumed = coordinator.resume_consumer(Some(&consumer_id)).await.expect("resume");
        assert_eq!(resumed, 1);
        assert_eq!(fixture.engine.is_paused(&consumer_id), Some(false));

        let again = coordinator.resume_consumer(Some(&consumer_id)).await.expect("resume");
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_incompatible_capabilities_denied() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let (_producer_side, _) = producing(&fixture, "a").await;

        let coordinator = fixture.coordinator("b");
        connected(&coordinator, TransportRole::Recv).await;
        let audio_only =
            RtpCapabilities::new(json!({"codecs": [{"kind": "audio", "mimeType": "audio/opus"}]}));

        let err = coordinator.consume(audio_only, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConsumeDenied);
        assert_eq!(coordinator.consumer_count(), 0);
        assert_eq!(fixture.engine.consumer_count(), 0);

        let resumed = coordinator
            .resume_consumer(Some(&ConsumerId::from("missing")))
            .await
            .expect("no-op");
        assert_eq!(resumed, 0);
    }

    #[tokio::test]
    async fn test_consume_explicit_unknown_producer() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let coordinator = fixture.coordinator("b");
        connected(&coordinator, TransportRole::Recv).await;
        let caps = coordinator.get_capabilities().expect("caps");

        let err = coordinator
            .consume(caps, Some(ProducerId::from("nope")))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::NoSuchProducer));
    }

    #[tokio::test]
    async fn test_replace_policy_closes_previous_producer() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let (coordinator, first) = producing(&fixture, "a").await;

        let second = coordinator
            .produce(None, MediaKind::Video, vp8(), AppData::default())
            .await
            .expect("replace");
        assert_ne!(first, second);
        assert_eq!(coordinator.producer_ids(), vec![second.clone()]);
        assert!(!fixture.room.contains_producer(&first));
        assert_eq!(fixture.room.latest_producer().map(|p| p.id), Some(second));

        coordinator
            .produce(None, MediaKind::Audio, opus(), AppData::default())
            .await
            .expect("other kind is independent");
        assert_eq!(coordinator.producer_count(), 2);
    }

    #[tokio::test]
    async fn test_reject_policy() {
        let config = SfuConfig {
            producer_slot_policy: ProducerSlotPolicy::Reject,
            ..SfuConfig::default()
        };
        let fixture = Fixture::new(config).await;
        let (coordinator, _) = producing(&fixture, "a").await;

        let err = coordinator
            .produce(None, MediaKind::Video, vp8(), AppData::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::ProducerExists));
        assert_eq!(coordinator.producer_count(), 1);
    }

    #[tokio::test]
    async fn test_allow_policy_keeps_both() {
        let config = SfuConfig {
            producer_slot_policy: ProducerSlotPolicy::Allow,
            ..SfuConfig::default()
        };
        let fixture = Fixture::new(config).await;
        let (coordinator, _) = producing(&fixture, "a").await;

        coordinator
            .produce(None, MediaKind::Video, vp8(), AppData::default())
            .await
            .expect("second video producer");
        assert_eq!(coordinator.producer_count(), 2);
        assert_eq!(fixture.room.producer_count(), 2);
    }

    #[tokio::test]
    async fn test_close_transport_cascades_to_other_connections() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let (producer_side, producer_id) = producing(&fixture, "a").await;

        let consumer_side = fixture.coordinator("b");
        let mut events = fixture.room.subscribe();
        connected(&consumer_side, TransportRole::Recv).await;
        let caps = consumer_side.get_capabilities().expect("caps");
        let params = consumer_side.consume(caps, None).await.expect("consume");

        producer_side
            .close_transport(TransportRole::Send)
            .await
            .expect("close");
        assert_eq!(producer_side.producer_count(), 0);
        assert_eq!(
            producer_side.transport_state(TransportRole::Send),
            Some(TransportState::Closed)
        );

        let RoomEvent::ProducerClosed { producer_id: closed, .. } =
            events.recv().await.expect("event");
        assert_eq!(closed, producer_id);

        let dropped = consumer_side.on_producer_closed(&closed).await;
        assert_eq!(
            dropped,
            vec![ClosedConsumer {
                consumer_id: ConsumerId::from(params.id),
                producer_id: producer_id.clone(),
            }]
        );
        assert_eq!(consumer_side.consumer_count(), 0);
        assert_eq!(fixture.engine.consumer_count(), 0);

        let err = producer_side
            .produce(None, MediaKind::Video, vp8(), AppData::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::NoSuchTransport));
    }

    /// Feed every pending engine event to the coordinators
    async fn pump(
        events: &mut tokio::sync::broadcast::Receiver<EngineEvent>,
        coordinators: &[&TransportCoordinator],
    ) {
        while let Ok(event) = events.try_recv() {
            for coordinator in coordinators {
                coordinator.on_engine_event(&event).await;
            }
        }
    }

    #[tokio::test]
    async fn test_dtls_close_releases_transport_and_producers() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let mut engine_events = fixture.engine.subscribe();
        let (producer_side, producer_id) = producing(&fixture, "a").await;
        let send_id = producer_side
            .transport_id(TransportRole::Send)
            .expect("send transport");

        let consumer_side = fixture.coordinator("b");
        connected(&consumer_side, TransportRole::Recv).await;
        let caps = consumer_side.get_capabilities().expect("caps");
        consumer_side.consume(caps.clone(), None).await.expect("consume");
        let mut room_events = fixture.room.subscribe();

        fixture.engine.simulate_dtls_closed(&send_id).await;
        pump(&mut engine_events, &[&producer_side, &consumer_side]).await;

        assert!(!fixture.room.contains_producer(&producer_id));
        assert_eq!(producer_side.producer_count(), 0);
        assert_eq!(
            producer_side.transport_state(TransportRole::Send),
            Some(TransportState::Closed)
        );
        assert_eq!(
            consumer_side.transport_state(TransportRole::Recv),
            Some(TransportState::Connected)
        );

        let RoomEvent::ProducerClosed { producer_id: closed, .. } =
            room_events.recv().await.expect("room event");
        assert_eq!(closed, producer_id);
        assert_eq!(consumer_side.on_producer_closed(&closed).await.len(), 1);

        let err = consumer_side.consume(caps, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConsumeDenied);
        let err = producer_side
            .produce(None, MediaKind::Video, vp8(), AppData::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::NoSuchTransport));
    }

    #[tokio::test]
    async fn test_track_end_in_engine_unpublishes_producer() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let mut engine_events = fixture.engine.subscribe();
        let (coordinator, producer_id) = producing(&fixture, "a").await;

        fixture.engine.simulate_track_ended(&producer_id);
        pump(&mut engine_events, &[&coordinator]).await;

        assert_eq!(coordinator.producer_count(), 0);
        assert!(!fixture.room.contains_producer(&producer_id));
        assert_eq!(
            coordinator.transport_state(TransportRole::Send),
            Some(TransportState::Connected)
        );
    }

    #[tokio::test]
    async fn test_worker_death_closes_coordinator() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let mut engine_events = fixture.engine.subscribe();
        let (coordinator, producer_id) = producing(&fixture, "a").await;

        fixture.engine.simulate_worker_died("killed");
        pump(&mut engine_events, &[&coordinator]).await;

        assert!(coordinator.is_closed());
        assert!(!fixture.room.contains_producer(&producer_id));
        let err = coordinator.get_capabilities().unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::Closed));
    }

    #[tokio::test]
    async fn test_close_producer_by_owner() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let (coordinator, producer_id) = producing(&fixture, "a").await;

        coordinator.close_producer(&producer_id).await.expect("close");
        assert!(!fixture.room.contains_producer(&producer_id));
        assert_eq!(fixture.engine.producer_count(), 0);

        let err = coordinator.close_producer(&producer_id).await.unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::NoSuchProducer));
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let fixture = Fixture::new(SfuConfig::default()).await;
        let (coordinator, producer_id) = producing(&fixture, "a").await;
        connected(&coordinator, TransportRole::Recv).await;
        let caps = coordinator.get_capabilities().expect("caps");
        coordinator.consume(caps, None).await.expect("consume own producer");

        coordinator.close().await;
        coordinator.close().await;

        assert!(coordinator.is_closed());
        assert!(!fixture.room.contains_producer(&producer_id));
        assert_eq!(fixture.engine.transport_count(), 0);
        assert_eq!(fixture.engine.consumer_count(), 0);

        let err = coordinator.get_capabilities().unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::Closed));
        let err = coordinator.resume_consumer(None).await.unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_in_flight_operation() {
        let engine = LoopbackEngine::default().with_latency(Duration::from_secs(5));
        let fixture = Fixture::with_engine(SfuConfig::default(), engine).await;
        let coordinator = Arc::new(fixture.coordinator("a"));

        let pending = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.create_transport(TransportRole::Send).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        coordinator.cancel();

        let err = pending.await.expect("task").unwrap_err();
        assert_eq!(err.reason(), Some(StateReason::Closed));

        coordinator.close().await;
        assert_eq!(fixture.engine.transport_count(), 0);
        assert_eq!(coordinator.transport_state(TransportRole::Send), None);
    }
}

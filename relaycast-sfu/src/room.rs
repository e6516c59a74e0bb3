//! Routing contexts

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relaycast_proto::{MediaKind, RtpCapabilities};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::engine::RouterHandle;
use crate::types::{ConnectionId, ProducerId, RoomId};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A producer visible to every connection of the routing context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedProducer {
    pub id: ProducerId,
    pub owner: ConnectionId,
    pub kind: MediaKind,
    seq: u64,
}

/// Change broadcast to every coordinator bound to the routing context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    ProducerClosed {
        producer_id: ProducerId,
        owner: ConnectionId,
    },
}

/// One media-routing domain: a router plus the index of live producers
pub struct RoutingContext {
    id: RoomId,
    router: RouterHandle,
    capabilities: Arc<RtpCapabilities>,
    producers: DashMap<ProducerId, PublishedProducer>,
    members: DashMap<ConnectionId, DateTime<Utc>>,
    next_seq: AtomicU64,
    events: broadcast::Sender<RoomEvent>,
    created_at: DateTime<Utc>,
}

impl RoutingContext {
    pub fn new(id: RoomId, router: RouterHandle, capabilities: Arc<RtpCapabilities>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id,
            router,
            capabilities,
            producers: DashMap::new(),
            members: DashMap::new(),
            next_seq: AtomicU64::new(0),
            events,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub const fn router(&self) -> &RouterHandle {
        &self.router
    }

    /// Router capabilities, identical for every caller
    #[must_use]
    pub fn capabilities(&self) -> &RtpCapabilities {
        &self.capabilities
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn join(&self, connection_id: ConnectionId) {
        self.members.insert(connection_id, Utc::now());
    }

    /// Returns `true` if the connection was a member
    pub fn leave(&self, connection_id: &ConnectionId) -> bool {
        self.members.remove(connection_id).is_some()
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn publish(&self, producer_id: ProducerId, owner: ConnectionId, kind: MediaKind) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        debug!(room_id = %self.id, producer_id = %producer_id, owner = %owner, "Producer published");
        self.producers.insert(
            producer_id.clone(),
            PublishedProducer {
                id: producer_id,
                owner,
                kind,
                seq,
            },
        );
    }

    /// Remove a producer from the index and tell every bound coordinator
    pub fn unpublish(&self, producer_id: &ProducerId) -> Option<PublishedProducer> {
        let (_, producer) = self.producers.remove(producer_id)?;
        debug!(room_id = %self.id, producer_id = %producer_id, "Producer unpublished");

        // No receivers just means nobody is consuming
        let _ = self.events.send(RoomEvent::ProducerClosed {
            producer_id: producer.id.clone(),
            owner: producer.owner.clone(),
        });
        Some(producer)
    }

    #[must_use]
    pub fn contains_producer(&self, producer_id: &ProducerId) -> bool {
        self.producers.contains_key(producer_id)
    }

    #[must_use]
    pub fn producer(&self, producer_id: &ProducerId) -> Option<PublishedProducer> {
        self.producers.get(producer_id).map(|entry| entry.value().clone())
    }

    /// Most recently published live producer
    #[must_use]
    pub fn latest_producer(&self) -> Option<PublishedProducer> {
        self.producers
            .iter()
            .max_by_key(|entry| entry.value().seq)
            .map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn stats(&self) -> RoomStats {
        RoomStats {
            room_id: self.id.clone(),
            connections: self.member_count(),
            producers: self.producer_count(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomStats {
    pub room_id: RoomId,
    pub connections: usize,
    pub producers: usize,
    pub created_at: DateTime<Utc>,
}

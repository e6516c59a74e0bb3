//! SFU Manager - process-scoped owner of the media engine and routing contexts
//!
//! This module provides:
//! - Lazy routing context creation, one router per room
//! - One transport coordinator per signaling connection
//! - Room and connection limit enforcement
//! - Automatic cleanup of empty rooms
//! - Aggregated statistics

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::capability::CapabilityRegistry;
use crate::config::SfuConfig;
use crate::coordinator::TransportCoordinator;
use crate::engine::MediaEngine;
use crate::error::{Result, SfuError};
use crate::room::{RoomStats, RoutingContext};
use crate::types::{ConnectionId, RoomId};

/// Global SFU statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    /// Number of live routing contexts
    pub rooms: usize,
    /// Number of live signaling connections
    pub connections: usize,
    /// Published producers across all rooms
    pub producers: usize,
    /// Consumers across all connections
    pub consumers: usize,
}

pub struct SfuManager {
    config: Arc<SfuConfig>,
    engine: Arc<dyn MediaEngine>,
    registry: CapabilityRegistry,
    rooms: DashMap<RoomId, Arc<RoutingContext>>,
    connections: DashMap<ConnectionId, Arc<TransportCoordinator>>,
    /// Serializes room creation, joins and cleanup
    membership: Mutex<()>,
}

impl SfuManager {
    /// Create the manager and start its cleanup task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: SfuConfig, engine: Arc<dyn MediaEngine>) -> Arc<Self> {
        let manager = Arc::new(Self {
            registry: CapabilityRegistry::new(config.media_codecs.clone()),
            config: Arc::new(config),
            engine,
            rooms: DashMap::new(),
            connections: DashMap::new(),
            membership: Mutex::new(()),
        });

        info!(
            codecs = manager.config.media_codecs.len(),
            max_rooms = manager.config.max_rooms,
            max_connections_per_room = manager.config.max_connections_per_room,
            producer_slot_policy = ?manager.config.producer_slot_policy,
            "SFU Manager initialized"
        );

        let period = Duration::from_secs(manager.config.cleanup_interval_secs.max(1));
        tokio::spawn(Self::cleanup_task(Arc::downgrade(&manager), period));

        manager
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    #[must_use]
    pub const fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Get a room, creating its router on first use
    pub async fn get_or_create_room(&self, room_id: &RoomId) -> Result<Arc<RoutingContext>> {
        let _guard = self.membership.lock().await;
        self.room_locked(room_id).await
    }

    async fn room_locked(&self, room_id: &RoomId) -> Result<Arc<RoutingContext>> {
        if let Some(room) = self.rooms.get(room_id) {
            debug!(room_id = %room_id, "Room already exists");
            return Ok(Arc::clone(room.value()));
        }

        // Enforce room limit (0 = unlimited)
        if self.config.max_rooms > 0 && self.rooms.len() >= self.config.max_rooms {
            warn!(
                current_rooms = self.rooms.len(),
                max_rooms = self.config.max_rooms,
                "Room limit reached"
            );
            return Err(SfuError::Capacity("maximum number of rooms reached".to_string()));
        }

        let router = self
            .engine
            .create_router(room_id, self.registry.codecs())
            .await?;
        let capabilities = self
            .registry
            .register(room_id.clone(), router.rtp_capabilities.clone());
        let room = Arc::new(RoutingContext::new(room_id.clone(), router, capabilities));
        self.rooms.insert(room_id.clone(), Arc::clone(&room));

        info!(
            room_id = %room_id,
            router_id = %room.router().id,
            total_rooms = self.rooms.len(),
            "Created new room"
        );

        Ok(room)
    }

    /// Register a new signaling connection in a room
    pub async fn open_connection(&self, room_id: &RoomId) -> Result<Arc<TransportCoordinator>> {
        let _guard = self.membership.lock().await;
        let room = self.room_locked(room_id).await?;

        // Check connection limit (0 = unlimited)
        let members = room.member_count();
        if self.config.max_connections_per_room > 0
            && members >= self.config.max_connections_per_room
        {
            warn!(
                room_id = %room_id,
                current_connections = members,
                max_connections = self.config.max_connections_per_room,
                "Connection limit reached for room"
            );
            return Err(SfuError::Capacity(
                "maximum number of connections reached for this room".to_string(),
            ));
        }

        let connection_id = ConnectionId::generate();
        room.join(connection_id.clone());
        let coordinator = Arc::new(TransportCoordinator::new(
            connection_id.clone(),
            Arc::clone(&room),
            Arc::clone(&self.engine),
            Arc::clone(&self.config),
        ));
        self.connections
            .insert(connection_id.clone(), Arc::clone(&coordinator));

        info!(
            room_id = %room_id,
            connection_id = %connection_id,
            connection_count = members + 1,
            "Connection opened"
        );

        Ok(coordinator)
    }

    /// Tear down a connection and everything it owns
    pub async fn close_connection(&self, connection_id: &ConnectionId) {
        let Some((_, coordinator)) = self.connections.remove(connection_id) else {
            debug!(connection_id = %connection_id, "Connection not found when closing");
            return;
        };

        coordinator.close().await;
        coordinator.room().leave(connection_id);

        // If the room is empty, it will be cleaned up by the cleanup task
        info!(
            room_id = %coordinator.room().id(),
            connection_id = %connection_id,
            "Connection closed"
        );
    }

    #[must_use]
    pub fn connection(&self, connection_id: &ConnectionId) -> Option<Arc<TransportCoordinator>> {
        self.connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn room(&self, room_id: &RoomId) -> Option<Arc<RoutingContext>> {
        self.rooms.get(room_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_stats(&self) -> Vec<RoomStats> {
        self.rooms.iter().map(|entry| entry.value().stats()).collect()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            rooms: self.rooms.len(),
            connections: self.connections.len(),
            producers: self
                .rooms
                .iter()
                .map(|entry| entry.value().producer_count())
                .sum(),
            consumers: self
                .connections
                .iter()
                .map(|entry| entry.value().consumer_count())
                .sum(),
        }
    }

    /// Remove rooms without connections and close their routers
    pub async fn cleanup_empty_rooms(&self) -> usize {
        let _guard = self.membership.lock().await;

        let empty: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|entry| entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed_count = 0;
        for room_id in empty {
            let Some((_, room)) = self.rooms.remove(&room_id) else {
                continue;
            };
            self.registry.remove(&room_id);
            self.engine.close_router(&room.router().id).await;
            removed_count += 1;
            debug!(room_id = %room_id, "Removed empty room");
        }

        if removed_count > 0 {
            info!(
                removed_count,
                remaining_rooms = self.rooms.len(),
                "Cleaned up empty rooms"
            );
        }
        removed_count
    }

    /// Close every connection and room
    pub async fn shutdown(&self) {
        let connection_ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for connection_id in &connection_ids {
            self.close_connection(connection_id).await;
        }
        let rooms = self.cleanup_empty_rooms().await;

        info!(
            connections = connection_ids.len(),
            rooms, "SFU Manager shut down"
        );
    }

    /// Background task for periodic cleanup; ends once the manager is dropped
    async fn cleanup_task(manager: Weak<Self>, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        info!(interval_secs = period.as_secs(), "Starting cleanup task");

        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                debug!("SFU Manager dropped, stopping cleanup task");
                break;
            };
            manager.cleanup_empty_rooms().await;
        }
    }
}

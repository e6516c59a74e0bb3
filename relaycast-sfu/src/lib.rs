//! Relaycast SFU signaling core
//!
//! Server side of the negotiation: routing contexts backed by a media engine
//! router, and one transport coordinator per signaling connection.
//!
//! ## Architecture
//!
//! - **`SfuManager`**: process-scoped owner of the engine, rooms and connections
//! - **`RoutingContext`**: one room; router capabilities plus the index of live producers
//! - **`TransportCoordinator`**: send/receive transports, producers and consumers of one connection
//! - **`CapabilityRegistry`**: router capability documents built from the configured codecs
//! - **`MediaEngine`**: the seam to ICE/DTLS/RTP; `LoopbackEngine` is the in-process reference.
//!   Engine-side closes (DTLS closed, track ended, worker died) come back as `EngineEvent`s
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relaycast_sfu::{LoopbackEngine, SfuConfig, SfuManager, TransportRole};
//!
//! let config = SfuConfig::default();
//! let engine = Arc::new(LoopbackEngine::from_config(&config));
//! let manager = SfuManager::new(config, engine);
//!
//! let coordinator = manager.open_connection(&"default".into()).await?;
//! let caps = coordinator.get_capabilities()?;
//! let params = coordinator.create_transport(TransportRole::Send).await?;
//! ```

pub mod capability;
mod config;
mod coordinator;
pub mod engine;
mod error;
mod loopback;
mod manager;
mod room;
mod types;

pub use capability::CapabilityRegistry;
pub use config::{ListenIp, MediaCodec, ProducerSlotPolicy, SfuConfig};
pub use coordinator::{ClosedConsumer, TransportCoordinator};
pub use engine::{EngineError, EngineEvent, MediaEngine, ProducerCloseReason, RouterHandle};
pub use error::{Result, SfuError};
pub use loopback::LoopbackEngine;
pub use manager::{ManagerStats, SfuManager};
pub use room::{PublishedProducer, RoomEvent, RoomStats, RoutingContext};
pub use types::{
    generate_id, ConnectionId, ConsumerId, ProducerId, RoomId, RouterId, TransportId,
    TransportRole, TransportState,
};

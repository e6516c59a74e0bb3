//! Relaycast client negotiator
//!
//! Walks a participant through capabilities, transports, producing and
//! consuming against a relaycast signaling server:
//!
//! - [`SignalingClient`]: request/reply correlation over any frame pipe
//! - [`ws::connect`]: the websocket pipe
//! - [`SessionNegotiator`]: the send and receive state machine
//! - [`media`]: seams to the local media stack, with [`loopback`] as the
//!   in-process implementation

mod channel;
mod error;
mod listener;
pub mod loopback;
pub mod media;
mod negotiator;
pub mod ws;

pub use channel::SignalingClient;
pub use error::{NegotiationError, Result};
pub use listener::SignalingListener;
pub use loopback::{LoopbackDevice, LoopbackSource, LoopbackTransport, RecordingView};
pub use media::{
    Direction, LocalConsumer, LocalMediaContext, LocalProducer, LocalTrack, LocalTransport,
    MediaConstraints, MediaSource, MediaView, ProduceOptions, RemoteTrack, TransportListener,
};
pub use negotiator::{Phase, SessionNegotiator};

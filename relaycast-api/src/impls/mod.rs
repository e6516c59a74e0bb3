//! Connection handling shared by every transport

pub mod signaling;

pub use signaling::{
    handle_frame, spawn_pipe, ChannelSender, ChannelStream, MessageSender, SignalingHandler,
    StreamMessage,
};

//! Signaling transports

pub mod channel;

pub use channel::{ChannelEvent, SignalingChannel, Subscription};

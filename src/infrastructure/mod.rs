//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Signaling transports (WebSocket and in-process loopback)
//! - The WebRTC negotiation backend

pub mod transport;
pub mod webrtc;

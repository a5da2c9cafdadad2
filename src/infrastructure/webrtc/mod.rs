//! WebRTC negotiation backend

pub mod connector;

pub use connector::{WebRtcConnector, WebRtcPeerConnection};

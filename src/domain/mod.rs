//! Domain layer - Core conferencing model
//!
//! This layer contains:
//! - The signaling protocol shared by relay and clients
//! - Rooms and their membership
//! - The relay that routes messages between room members
//! - The per-remote negotiation state machine (`PeerLink`)

pub mod peer_link;
pub mod relay;
pub mod room;
pub mod shared;
pub mod signaling;

// Re-export commonly used types
pub use shared::{MeshError, Result};

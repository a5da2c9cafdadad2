//! meshcall - mesh video conferencing signaling relay and client
//!
//! The relay keeps room membership and forwards negotiation messages
//! between participants; media flows directly between every pair of
//! clients. The client side keeps one peer link per remote participant and
//! switches its outgoing video between camera and screen share.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use application::session::{Session, SessionHandle};
pub use domain::relay::SignalingRelay;
pub use domain::shared::{MeshError, Result};
pub use infrastructure::transport::SignalingChannel;

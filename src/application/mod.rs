//! Application layer - client-side conferencing
//!
//! - `session`: join state machine and the per-client event loop
//! - `orchestrator`: one peer link per remote participant
//! - `media`: local capture sources and outgoing track switching
//! - `negotiation`: the connection abstraction the orchestrator drives
//! - `view`: snapshot and events published to the UI

pub mod media;
pub mod negotiation;
pub mod orchestrator;
pub mod session;
pub mod view;

pub use media::{LocalTrack, MediaDevices, MediaSource, MediaTrackManager, SourceKind};
pub use negotiation::{LinkEvent, LinkHealth, PeerConnection, PeerConnector, SignalSender};
pub use orchestrator::PeerConnectionOrchestrator;
pub use session::{Session, SessionHandle};
pub use view::{ConferenceView, JoinPhase, SessionEvent};

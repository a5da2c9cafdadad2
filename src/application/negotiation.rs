//! Negotiation layer seen by the orchestrator
//!
//! `PeerConnector` opens one `PeerConnection` per remote participant. The
//! production implementation lives in `infrastructure::webrtc`; tests plug in
//! scripted connections.

use crate::application::media::LocalTrack;
use crate::domain::shared::{ParticipantId, Result};
use crate::domain::signaling::{ClientMessage, IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection health reported by the negotiation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkHealth {
    /// States that end the link
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LinkHealth::Disconnected | LinkHealth::Failed | LinkHealth::Closed
        )
    }
}

/// Callbacks from a connection, delivered to the session loop
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Locally gathered candidate to trickle to the remote side
    LocalCandidate {
        remote: ParticipantId,
        candidate: IceCandidate,
    },
    Health {
        remote: ParticipantId,
        health: LinkHealth,
    },
    RemoteTrack {
        remote: ParticipantId,
        stream_id: String,
        track_id: String,
    },
}

pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// One direct media connection to a remote participant
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Start sending the given tracks
    async fn add_tracks(&self, tracks: Vec<LocalTrack>) -> Result<()>;

    /// Swap the outgoing video track without renegotiating
    async fn replace_video_track(&self, track: LocalTrack) -> Result<()>;

    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer to the applied remote offer and apply it locally
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Factory for peer connections
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        remote: &ParticipantId,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerConnection>>;
}

/// Outgoing half of the signaling channel
#[cfg_attr(test, mockall::automock)]
pub trait SignalSender: Send + Sync {
    /// Queue a message for the relay. Fails once the transport is gone.
    fn send(&self, message: ClientMessage) -> Result<()>;
}

/// Per-remote negotiation state
///
/// A `PeerLink` tracks one direct connection to a remote participant: its
/// offer/answer progress, the ICE candidates that arrived before the remote
/// description, and the media the remote side sends us.
use crate::domain::shared::{MeshError, ParticipantId, Result};
use crate::domain::signaling::IceCandidate;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Link state machine
///
/// ```text
/// Idle -> Offering  -> Connected
/// Idle -> Answering -> Connected
/// any  -> Failed | Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Idle,
    Offering,
    Answering,
    Connected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn can_transition_to(&self, next: LinkState) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Idle, Offering)
                | (Idle, Answering)
                | (Offering, Connected)
                | (Answering, Connected)
                | (Idle | Offering | Answering | Connected, Failed)
                | (Idle | Offering | Answering | Connected | Failed, Closed)
        )
    }

    /// Waiting on the remote side to finish negotiation
    pub fn is_negotiating(&self) -> bool {
        matches!(self, LinkState::Offering | LinkState::Answering)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

/// Media a remote participant sends us
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_ids: Vec<String>,
}

#[derive(Debug)]
pub struct PeerLink<C> {
    pub remote: ParticipantId,
    /// Distinguishes this link from any later link to the same remote
    pub link_id: Uuid,
    state: LinkState,
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    /// A flusher task is draining `pending_candidates`
    flushing: bool,
    /// An answer is being applied
    applying_answer: bool,
    /// Local candidates gathered before our offer or answer went out
    held_local_candidates: VecDeque<IceCandidate>,
    description_sent: bool,
    negotiation_started: Option<Instant>,
    connection: Option<C>,
    remote_stream: Option<RemoteStream>,
    pub created_at: DateTime<Utc>,
}

impl<C: Clone> PeerLink<C> {
    pub fn new(remote: ParticipantId) -> Self {
        Self {
            remote,
            link_id: Uuid::new_v4(),
            state: LinkState::Idle,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            flushing: false,
            applying_answer: false,
            held_local_candidates: VecDeque::new(),
            description_sent: false,
            negotiation_started: None,
            connection: None,
            remote_stream: None,
            created_at: Utc::now(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn transition(&mut self, next: LinkState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(MeshError::InvalidState(format!(
                "link to {}: {:?} -> {:?}",
                self.remote, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Move into Offering or Answering and start the negotiation clock
    pub fn begin_negotiation(&mut self, next: LinkState, now: Instant) -> Result<()> {
        if !next.is_negotiating() {
            return Err(MeshError::InvalidState(format!(
                "{:?} is not a negotiating state",
                next
            )));
        }
        self.transition(next)?;
        self.negotiation_started = Some(now);
        Ok(())
    }

    /// Negotiation has outlived `timeout`
    pub fn is_stalled(&self, now: Instant, timeout: Duration) -> bool {
        match self.negotiation_started {
            Some(started) if self.state.is_negotiating() => now.saturating_duration_since(started) >= timeout,
            _ => false,
        }
    }

    pub fn connection(&self) -> Option<C> {
        self.connection.clone()
    }

    pub fn set_connection(&mut self, connection: C) {
        self.connection = Some(connection);
    }

    pub fn take_connection(&mut self) -> Option<C> {
        self.connection.take()
    }

    /// Queue a remote candidate.
    /// Returns true when the caller must start a flusher.
    pub fn enqueue_candidate(&mut self, candidate: IceCandidate) -> bool {
        self.pending_candidates.push_back(candidate);
        self.claim_flush()
    }

    /// Record that the remote description is applied.
    /// Returns true when the caller must start a flusher.
    pub fn mark_remote_description_applied(&mut self) -> bool {
        self.remote_description_set = true;
        self.claim_flush()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    fn claim_flush(&mut self) -> bool {
        if self.remote_description_set && !self.flushing && !self.pending_candidates.is_empty() {
            self.flushing = true;
            true
        } else {
            false
        }
    }

    /// Next candidate for the active flusher. Ends the flush when the queue is empty.
    pub fn next_candidate(&mut self) -> Option<IceCandidate> {
        let next = self.pending_candidates.pop_front();
        if next.is_none() {
            self.flushing = false;
        }
        next
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Route a locally gathered candidate. Returns it back when it may be
    /// sent right away; otherwise it waits for `mark_description_sent`.
    pub fn hold_local_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.description_sent {
            return Some(candidate);
        }
        self.held_local_candidates.push_back(candidate);
        None
    }

    /// Our offer or answer is on the wire; release held candidates in order
    pub fn mark_description_sent(&mut self) -> Vec<IceCandidate> {
        self.description_sent = true;
        self.held_local_candidates.drain(..).collect()
    }

    pub fn held_local_candidates(&self) -> usize {
        self.held_local_candidates.len()
    }

    /// Claim the right to apply an answer; only one answer per Offering link
    pub fn try_begin_answer(&mut self) -> bool {
        if self.state == LinkState::Offering && !self.applying_answer {
            self.applying_answer = true;
            true
        } else {
            false
        }
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    /// Record a track received from the remote side
    pub fn add_remote_track(&mut self, stream_id: String, track_id: String) -> RemoteStream {
        let stream = self.remote_stream.get_or_insert_with(|| RemoteStream {
            stream_id: stream_id.clone(),
            track_ids: Vec::new(),
        });
        stream.stream_id = stream_id;
        if !stream.track_ids.contains(&track_id) {
            stream.track_ids.push(track_id);
        }
        stream.clone()
    }
}

//! Signaling protocol exchanged between clients and the relay
//!
//! Every frame is a JSON object tagged by `type` (kebab-case). The relay never
//! looks inside offer/answer/candidate payloads; it only stamps the sender.

use crate::domain::shared::{ParticipantId, RoomId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages sent by a client to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join a room; the relay generates a room id when none is given
    Join {
        #[serde(default)]
        room_id: Option<RoomId>,
        display_name: String,
    },
    /// Leave a room
    Leave { room_id: RoomId },
    /// SDP offer for one participant
    Offer {
        room_id: RoomId,
        to: ParticipantId,
        sdp: String,
    },
    /// SDP answer for one participant
    Answer {
        room_id: RoomId,
        to: ParticipantId,
        sdp: String,
    },
    /// ICE candidate for one participant
    IceCandidate {
        room_id: RoomId,
        to: ParticipantId,
        candidate: IceCandidate,
    },
    /// Best-effort chat broadcast to the room
    ChatMessage { room_id: RoomId, text: String },
}

/// Messages sent by the relay to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First frame on every connection: the participant id assigned to it
    Welcome { participant_id: ParticipantId },
    /// Room membership snapshot, sent to every member on each change
    RosterUpdate(Roster),
    /// Sent only to members that were present before the joiner
    ParticipantAppeared {
        room_id: RoomId,
        participant_id: ParticipantId,
        display_name: String,
    },
    /// Sent to the remaining members when someone leaves or drops
    ParticipantLeft {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
    Offer {
        room_id: RoomId,
        from: ParticipantId,
        sdp: String,
    },
    Answer {
        room_id: RoomId,
        from: ParticipantId,
        sdp: String,
    },
    IceCandidate {
        room_id: RoomId,
        from: ParticipantId,
        candidate: IceCandidate,
    },
    ChatMessage(ChatMessage),
    Error { code: String, message: String },
}

/// One roster line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: ParticipantId,
    pub name: String,
}

/// Room membership snapshot in join order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    pub room_id: RoomId,
    pub count: usize,
    pub participants: Vec<RosterEntry>,
}

impl Roster {
    pub fn empty(room_id: RoomId) -> Self {
        Self {
            room_id,
            count: 0,
            participants: Vec::new(),
        }
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.iter().any(|p| &p.id == id)
    }
}

/// Chat line as delivered by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub room_id: RoomId,
    pub sender_id: ParticipantId,
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// ICE candidate as carried over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description produced or consumed by the negotiation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Point-to-point payload forwarded verbatim by the relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidate },
}

impl RelayPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayPayload::Offer { .. } => "offer",
            RelayPayload::Answer { .. } => "answer",
            RelayPayload::IceCandidate { .. } => "ice-candidate",
        }
    }

    /// Wrap the payload for delivery, tagged with its sender
    pub fn into_server_message(self, room_id: RoomId, from: ParticipantId) -> ServerMessage {
        match self {
            RelayPayload::Offer { sdp } => ServerMessage::Offer { room_id, from, sdp },
            RelayPayload::Answer { sdp } => ServerMessage::Answer { room_id, from, sdp },
            RelayPayload::IceCandidate { candidate } => ServerMessage::IceCandidate {
                room_id,
                from,
                candidate,
            },
        }
    }
}

/// Room membership model
use crate::domain::shared::{MeshError, ParticipantId, Result, RoomId};
use crate::domain::signaling::{Roster, RosterEntry, ServerMessage};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Outbound half of a participant's transport channel
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// A connected participant as seen by the relay
#[derive(Debug, Clone)]
pub struct ParticipantHandle {
    pub id: ParticipantId,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    outbound: Outbound,
}

impl ParticipantHandle {
    pub fn new(id: ParticipantId, display_name: String, outbound: Outbound) -> Self {
        Self {
            id,
            display_name,
            joined_at: Utc::now(),
            outbound,
        }
    }

    /// Queue a message on the participant's channel.
    /// Returns false when the channel is already gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.outbound.send(message).is_ok()
    }
}

/// Room with members in join order
#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    pub created_at: DateTime<Utc>,
    /// 0 means unlimited
    capacity: usize,
    members: Vec<ParticipantHandle>,
    /// Set once the room has emptied and been dropped from the registry
    closed: bool,
}

impl Room {
    pub fn new(id: RoomId, capacity: usize) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            capacity,
            members: Vec::new(),
            closed: false,
        }
    }

    /// Add a participant. Adding an existing member is a no-op returning false.
    pub fn add(&mut self, handle: ParticipantHandle) -> Result<bool> {
        if self.contains(&handle.id) {
            return Ok(false);
        }

        if self.capacity > 0 && self.members.len() >= self.capacity {
            return Err(MeshError::RoomFull {
                room_id: self.id.to_string(),
                capacity: self.capacity,
            });
        }

        self.members.push(handle);
        Ok(true)
    }

    /// Remove a participant, returning its handle if it was a member
    pub fn remove(&mut self, id: &ParticipantId) -> Option<ParticipantHandle> {
        let index = self.members.iter().position(|m| &m.id == id)?;
        Some(self.members.remove(index))
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.members.iter().any(|m| &m.id == id)
    }

    pub fn handle(&self, id: &ParticipantId) -> Option<&ParticipantHandle> {
        self.members.iter().find(|m| &m.id == id)
    }

    /// Every member except `id`, in join order
    pub fn others<'a>(&'a self, id: &'a ParticipantId) -> impl Iterator<Item = &'a ParticipantHandle> {
        self.members.iter().filter(move |m| &m.id != id)
    }

    pub fn members(&self) -> &[ParticipantHandle] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn roster(&self) -> Roster {
        Roster {
            room_id: self.id.clone(),
            count: self.members.len(),
            participants: self
                .members
                .iter()
                .map(|m| RosterEntry {
                    id: m.id.clone(),
                    name: m.display_name.clone(),
                })
                .collect(),
        }
    }

    /// Send the current roster to every member
    pub fn broadcast_roster(&self) {
        let roster = self.roster();
        for member in &self.members {
            member.send(ServerMessage::RosterUpdate(roster.clone()));
        }
    }
}

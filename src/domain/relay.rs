/// Signaling relay
///
/// Keeps room membership and forwards point-to-point and broadcast messages
/// between participants. Payloads are never interpreted; a message whose room
/// or target has gone away is dropped silently, since joins, leaves and
/// negotiation all race each other.

use crate::config::RelayConfig;
use crate::domain::room::{Outbound, ParticipantHandle, Room};
use crate::domain::shared::{ParticipantId, Result, RoomId};
use crate::domain::signaling::{ChatMessage, ClientMessage, RelayPayload, Roster, ServerMessage};
use chrono::Utc;
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Outcome of a point-to-point relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Room, sender membership or target missing; not an error
    Dropped,
}

/// Relay state shared by every connection
pub struct SignalingRelay {
    /// Active rooms (room_id -> room). The map lock only locates rooms;
    /// membership changes are serialized by the per-room mutex.
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>,
    /// 0 means unlimited
    max_participants_per_room: usize,
    participants: AtomicUsize,
}

impl SignalingRelay {
    pub fn new(config: &RelayConfig) -> Self {
        Self::with_capacity(config.max_participants_per_room)
    }

    pub fn with_capacity(max_participants_per_room: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            max_participants_per_room,
            participants: AtomicUsize::new(0),
        }
    }

    async fn find_room(&self, room_id: &RoomId) -> Option<Arc<Mutex<Room>>> {
        let rooms = self.rooms.read().await;
        rooms.get(room_id).cloned()
    }

    async fn room_entry(&self, room_id: &RoomId) -> Arc<Mutex<Room>> {
        if let Some(room) = self.find_room(room_id).await {
            return room;
        }

        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                info!("Created room {}", room_id);
                Arc::new(Mutex::new(Room::new(
                    room_id.clone(),
                    self.max_participants_per_room,
                )))
            })
            .clone();
        gauge!("relay_active_rooms").set(rooms.len() as f64);
        room
    }

    /// Add a participant to a room, creating the room on first join.
    ///
    /// Every member (joiner included) receives the new roster; only the
    /// members that were already present receive `participant-appeared`.
    /// That asymmetry decides who sends offers, so two peers never offer
    /// to each other at the same time.
    pub async fn join(&self, room_id: RoomId, handle: ParticipantHandle) -> Result<Roster> {
        loop {
            let room = self.room_entry(&room_id).await;
            let mut room = room.lock().await;

            // Emptied and unregistered while we waited for the lock
            if room.is_closed() {
                continue;
            }

            if !room.add(handle.clone())? {
                debug!("{} already in room {}, resending roster", handle.id, room_id);
                let roster = room.roster();
                handle.send(ServerMessage::RosterUpdate(roster.clone()));
                return Ok(roster);
            }

            room.broadcast_roster();
            for member in room.others(&handle.id) {
                member.send(ServerMessage::ParticipantAppeared {
                    room_id: room_id.clone(),
                    participant_id: handle.id.clone(),
                    display_name: handle.display_name.clone(),
                });
            }

            let total = self.participants.fetch_add(1, Ordering::SeqCst) + 1;
            gauge!("relay_participants").set(total as f64);
            counter!("relay_joins_total").increment(1);

            info!(
                "{} ({}) joined room {} ({} members)",
                handle.id,
                handle.display_name,
                room_id,
                room.len()
            );
            return Ok(room.roster());
        }
    }

    /// Remove a participant. Returns false when room or member was unknown.
    pub async fn leave(&self, room_id: &RoomId, participant_id: &ParticipantId) -> bool {
        let Some(room_arc) = self.find_room(room_id).await else {
            return false;
        };

        let emptied = {
            let mut room = room_arc.lock().await;
            if room.remove(participant_id).is_none() {
                return false;
            }

            for member in room.members() {
                member.send(ServerMessage::ParticipantLeft {
                    room_id: room_id.clone(),
                    participant_id: participant_id.clone(),
                });
            }
            room.broadcast_roster();

            info!(
                "{} left room {} ({} remaining)",
                participant_id,
                room_id,
                room.len()
            );
            room.is_empty()
        };

        let total = self
            .participants
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        gauge!("relay_participants").set(total as f64);
        counter!("relay_leaves_total").increment(1);

        if emptied {
            self.remove_if_empty(room_id, &room_arc).await;
        }
        true
    }

    async fn remove_if_empty(&self, room_id: &RoomId, room_arc: &Arc<Mutex<Room>>) {
        let mut rooms = self.rooms.write().await;
        let mut room = room_arc.lock().await;

        // Someone may have joined between our leave and this point
        if !room.is_empty() || room.is_closed() {
            return;
        }

        if rooms
            .get(room_id)
            .is_some_and(|current| Arc::ptr_eq(current, room_arc))
        {
            rooms.remove(room_id);
        }
        room.close();
        gauge!("relay_active_rooms").set(rooms.len() as f64);
        info!("Destroyed empty room {}", room_id);
    }

    /// Forward a payload from one member to exactly one other member
    pub async fn relay(
        &self,
        room_id: &RoomId,
        from: &ParticipantId,
        to: &ParticipantId,
        payload: RelayPayload,
    ) -> Delivery {
        let kind = payload.kind();
        let target = match self.find_room(room_id).await {
            Some(room) => {
                let room = room.lock().await;
                if room.contains(from) {
                    room.handle(to).cloned()
                } else {
                    None
                }
            }
            None => None,
        };

        let delivered = target
            .map(|h| h.send(payload.into_server_message(room_id.clone(), from.clone())))
            .unwrap_or(false);

        if delivered {
            counter!("relay_messages_total", "kind" => kind, "outcome" => "delivered").increment(1);
            Delivery::Delivered
        } else {
            debug!("Dropped {} from {} to {} in room {}", kind, from, to, room_id);
            counter!("relay_messages_total", "kind" => kind, "outcome" => "dropped").increment(1);
            Delivery::Dropped
        }
    }

    /// Fan a chat line out to every other member. Returns the number of recipients.
    pub async fn broadcast(&self, room_id: &RoomId, from: &ParticipantId, text: String) -> usize {
        let Some(room) = self.find_room(room_id).await else {
            return 0;
        };
        let room = room.lock().await;
        let Some(sender) = room.handle(from) else {
            return 0;
        };

        let message = ChatMessage {
            room_id: room_id.clone(),
            sender_id: from.clone(),
            sender_name: sender.display_name.clone(),
            text,
            timestamp: Utc::now(),
        };

        let delivered = room
            .others(from)
            .filter(|m| m.send(ServerMessage::ChatMessage(message.clone())))
            .count();
        counter!("relay_chat_messages_total").increment(1);
        delivered
    }

    /// Current roster of a room
    pub async fn roster(&self, room_id: &RoomId) -> Option<Roster> {
        let room = self.find_room(room_id).await?;
        let room = room.lock().await;
        Some(room.roster())
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.load(Ordering::SeqCst)
    }
}

impl Default for SignalingRelay {
    fn default() -> Self {
        Self::new(&RelayConfig::default())
    }
}

/// Relay side of one transport connection.
///
/// Owns the participant id assigned to the connection and the rooms joined
/// through it, so that losing the transport leaves every one of them.
pub struct RelayConnection {
    relay: Arc<SignalingRelay>,
    participant_id: ParticipantId,
    outbound: Outbound,
    /// Joined rooms (room_id -> display name used there)
    rooms: HashMap<RoomId, String>,
}

impl RelayConnection {
    /// Register a new connection and greet it with its participant id
    pub fn open(relay: Arc<SignalingRelay>, outbound: Outbound) -> Self {
        let participant_id = ParticipantId::generate();
        let _ = outbound.send(ServerMessage::Welcome {
            participant_id: participant_id.clone(),
        });

        Self {
            relay,
            participant_id,
            outbound,
            rooms: HashMap::new(),
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn joined_rooms(&self) -> impl Iterator<Item = &RoomId> {
        self.rooms.keys()
    }

    /// Send an error frame to this connection only
    pub fn reject(&self, code: &str, message: impl Into<String>) {
        let _ = self.outbound.send(ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        });
    }

    /// Handle one message from the client
    pub async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Join {
                room_id,
                display_name,
            } => {
                let room_id = room_id.unwrap_or_else(RoomId::generate);
                let handle = ParticipantHandle::new(
                    self.participant_id.clone(),
                    display_name.clone(),
                    self.outbound.clone(),
                );

                match self.relay.join(room_id.clone(), handle).await {
                    Ok(_) => {
                        self.rooms.insert(room_id, display_name);
                    }
                    Err(e) => {
                        warn!("{} could not join {}: {}", self.participant_id, room_id, e);
                        self.reject(e.code(), e.to_string());
                    }
                }
            }

            ClientMessage::Leave { room_id } => {
                if self.rooms.remove(&room_id).is_some() {
                    self.relay.leave(&room_id, &self.participant_id).await;
                }
            }

            ClientMessage::Offer { room_id, to, sdp } => {
                self.forward(room_id, to, RelayPayload::Offer { sdp }).await;
            }

            ClientMessage::Answer { room_id, to, sdp } => {
                self.forward(room_id, to, RelayPayload::Answer { sdp }).await;
            }

            ClientMessage::IceCandidate {
                room_id,
                to,
                candidate,
            } => {
                self.forward(room_id, to, RelayPayload::IceCandidate { candidate })
                    .await;
            }

            ClientMessage::ChatMessage { room_id, text } => {
                if self.rooms.contains_key(&room_id) {
                    self.relay
                        .broadcast(&room_id, &self.participant_id, text)
                        .await;
                } else {
                    debug!("Chat from {} for unjoined room {}", self.participant_id, room_id);
                }
            }
        }
    }

    async fn forward(&self, room_id: RoomId, to: ParticipantId, payload: RelayPayload) {
        if !self.rooms.contains_key(&room_id) {
            debug!(
                "Dropped {} from {} for unjoined room {}",
                payload.kind(),
                self.participant_id,
                room_id
            );
            return;
        }
        self.relay
            .relay(&room_id, &self.participant_id, &to, payload)
            .await;
    }

    /// Leave every joined room; called when the transport goes away
    pub async fn close(mut self) {
        for (room_id, _) in self.rooms.drain() {
            self.relay.leave(&room_id, &self.participant_id).await;
        }
        debug!("Closed relay connection {}", self.participant_id);
    }
}

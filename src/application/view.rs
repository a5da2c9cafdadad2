//! Conference view published to the UI
//!
//! The session keeps one `ConferenceView` snapshot current in a `watch`
//! channel and announces discrete changes on a `broadcast` channel.

use crate::application::media::SourceKind;
use crate::domain::peer_link::{LinkState, RemoteStream};
use crate::domain::shared::{ParticipantId, RoomId};
use crate::domain::signaling::{ChatMessage, Roster};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{broadcast, watch};

/// Join progress of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    AcquiringMedia,
    Joining,
    Active,
    Closed,
}

/// What the self-preview shows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub track_id: String,
    pub source: SourceKind,
}

#[derive(Debug, Clone)]
pub struct ConferenceView {
    pub room_id: Option<RoomId>,
    pub local_id: Option<ParticipantId>,
    pub phase: JoinPhase,
    pub roster: Option<Roster>,
    pub streams: HashMap<ParticipantId, RemoteStream>,
    pub links: HashMap<ParticipantId, LinkState>,
    pub messages: VecDeque<ChatMessage>,
    pub preview: Option<Preview>,
}

impl Default for ConferenceView {
    fn default() -> Self {
        Self {
            room_id: None,
            local_id: None,
            phase: JoinPhase::AcquiringMedia,
            roster: None,
            streams: HashMap::new(),
            links: HashMap::new(),
            messages: VecDeque::new(),
            preview: None,
        }
    }
}

impl ConferenceView {
    /// Links that reached Connected
    pub fn connected_links(&self) -> usize {
        self.links
            .values()
            .filter(|s| **s == LinkState::Connected)
            .count()
    }
}

/// Discrete changes, for UIs that prefer notifications to snapshots
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined {
        room_id: RoomId,
        participant_id: ParticipantId,
    },
    RosterChanged(Roster),
    LinkChanged {
        participant_id: ParticipantId,
        state: LinkState,
    },
    StreamAdded {
        participant_id: ParticipantId,
        stream: RemoteStream,
    },
    StreamRemoved {
        participant_id: ParticipantId,
    },
    Chat(ChatMessage),
    SourceChanged(SourceKind),
    Error {
        code: String,
        message: String,
    },
    Ended {
        reason: String,
    },
}

const EVENT_CAPACITY: usize = 256;

/// Write side of the view and event channels
#[derive(Clone)]
pub struct ViewPublisher {
    view: watch::Sender<ConferenceView>,
    events: broadcast::Sender<SessionEvent>,
    chat_history_limit: usize,
}

impl ViewPublisher {
    pub fn new(chat_history_limit: usize) -> Self {
        let (view, _) = watch::channel(ConferenceView::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            view,
            events,
            chat_history_limit,
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut ConferenceView)) {
        self.view.send_modify(f);
    }

    /// Nobody listening is fine
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_phase(&self, phase: JoinPhase) {
        self.update(|view| view.phase = phase);
    }

    pub fn set_link(&self, participant_id: &ParticipantId, state: LinkState) {
        self.update(|view| {
            view.links.insert(participant_id.clone(), state);
        });
        self.emit(SessionEvent::LinkChanged {
            participant_id: participant_id.clone(),
            state,
        });
    }

    /// Drop a link and whatever it was showing
    pub fn remove_link(&self, participant_id: &ParticipantId, state: LinkState) {
        let mut had_stream = false;
        self.update(|view| {
            view.links.remove(participant_id);
            had_stream = view.streams.remove(participant_id).is_some();
        });
        self.emit(SessionEvent::LinkChanged {
            participant_id: participant_id.clone(),
            state,
        });
        if had_stream {
            self.emit(SessionEvent::StreamRemoved {
                participant_id: participant_id.clone(),
            });
        }
    }

    pub fn set_stream(&self, participant_id: &ParticipantId, stream: RemoteStream) {
        self.update(|view| {
            view.streams.insert(participant_id.clone(), stream.clone());
        });
        self.emit(SessionEvent::StreamAdded {
            participant_id: participant_id.clone(),
            stream,
        });
    }

    pub fn set_roster(&self, roster: Roster) {
        self.update(|view| view.roster = Some(roster.clone()));
        self.emit(SessionEvent::RosterChanged(roster));
    }

    pub fn push_chat(&self, message: ChatMessage) {
        let limit = self.chat_history_limit;
        self.update(|view| {
            view.messages.push_back(message.clone());
            while limit > 0 && view.messages.len() > limit {
                view.messages.pop_front();
            }
        });
        self.emit(SessionEvent::Chat(message));
    }

    pub fn set_preview(&self, track_id: &str, source: SourceKind) {
        self.update(|view| {
            view.preview = Some(Preview {
                track_id: track_id.to_string(),
                source,
            })
        });
        self.emit(SessionEvent::SourceChanged(source));
    }

    pub fn snapshot(&self) -> ConferenceView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConferenceView> {
        self.view.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

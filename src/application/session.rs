//! Client session
//!
//! A session joins one room through a signaling channel and owns everything
//! that lives for the duration of that membership: the local media, the
//! peer link table and the channel subscription. A single task processes
//! relay messages and link callbacks in arrival order; the awaiting parts of
//! each handler run concurrently in a `JoinSet` that is aborted on teardown.

use crate::application::media::{MediaDevices, MediaTrackManager, SourceKind, SourceStatus};
use crate::application::negotiation::{LinkEvent, PeerConnector};
use crate::application::orchestrator::{Continuation, LinkContext, PeerConnectionOrchestrator};
use crate::application::view::{ConferenceView, JoinPhase, SessionEvent, ViewPublisher};
use crate::config::SessionConfig;
use crate::domain::shared::{MeshError, ParticipantId, Result, RoomId};
use crate::domain::signaling::{ChatMessage, ClientMessage, Roster, ServerMessage};
use crate::infrastructure::transport::{ChannelEvent, SignalingChannel, Subscription};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

enum Command {
    Leave(oneshot::Sender<()>),
}

/// What woke the session loop
enum Step {
    Relay(ServerMessage),
    TransportLost,
    Link(LinkEvent),
    Leave(Option<oneshot::Sender<()>>),
    ScreenEnded(Uuid),
    Tick,
    Idle,
}

pub struct Session;

impl Session {
    /// Acquire the camera, join `room_id` (or a fresh room) and start the
    /// session loop. Returns once the relay's roster lists us.
    ///
    /// ```no_run
    /// use meshcall::application::media::SampleTrackDevices;
    /// use meshcall::config::Config;
    /// use meshcall::domain::shared::RoomId;
    /// use meshcall::infrastructure::webrtc::WebRtcConnector;
    /// use meshcall::{Session, SignalingChannel};
    /// use std::sync::Arc;
    ///
    /// # async fn call() -> meshcall::Result<()> {
    /// let config = Config::load(None)?;
    /// let channel = SignalingChannel::connect("ws://127.0.0.1:8080/signaling").await?;
    /// let session = Session::start(
    ///     &config.session,
    ///     channel,
    ///     Arc::new(WebRtcConnector::from_config(&config.session)?),
    ///     Arc::new(SampleTrackDevices::new("ada")),
    ///     Some(RoomId::from("standup")),
    ///     "Ada",
    /// )
    /// .await?;
    /// session.send_chat("hello")?;
    /// session.leave().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn start(
        config: &SessionConfig,
        channel: SignalingChannel,
        connector: Arc<dyn PeerConnector>,
        devices: Arc<dyn MediaDevices>,
        room_id: Option<RoomId>,
        display_name: impl Into<String>,
    ) -> Result<SessionHandle> {
        let display_name = display_name.into();
        let publisher = ViewPublisher::new(config.chat_history_limit);

        // Subscribe first so nothing sent after the join is missed
        let mut subscription = channel.subscribe();
        let local_id = channel.participant_id().await?;
        publisher.update(|view| view.local_id = Some(local_id.clone()));

        let media = Arc::new(MediaTrackManager::new(devices));
        media.start_camera().await?;
        if let Some(track) = media.preview_track().await {
            publisher.set_preview(track.id(), SourceKind::Camera);
        }

        publisher.set_phase(JoinPhase::Joining);
        if let Err(e) = channel.send(ClientMessage::Join {
            room_id: room_id.clone(),
            display_name: display_name.clone(),
        }) {
            media.shutdown().await;
            return Err(e);
        }

        let joined = time::timeout(
            config.negotiation_timeout(),
            await_roster(&mut subscription, &local_id, room_id.as_ref()),
        )
        .await
        .unwrap_or_else(|_| Err(MeshError::Transport("timed out joining room".to_string())));
        let (roster, backlog) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                abandon_join(
                    &channel,
                    subscription,
                    &local_id,
                    room_id,
                    &e,
                    config.negotiation_timeout(),
                );
                media.shutdown().await;
                publisher.set_phase(JoinPhase::Closed);
                return Err(e);
            }
        };

        let room_id = roster.room_id.clone();
        info!(
            "Joined room {} as {} ({} members)",
            room_id, local_id, roster.count
        );
        publisher.update(|view| {
            view.room_id = Some(room_id.clone());
            view.phase = JoinPhase::Active;
        });
        publisher.set_roster(roster);
        publisher.emit(SessionEvent::Joined {
            room_id: room_id.clone(),
            participant_id: local_id.clone(),
        });

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let orchestrator = PeerConnectionOrchestrator::new(
            LinkContext {
                local_id: local_id.clone(),
                room_id: room_id.clone(),
                negotiation_timeout: config.negotiation_timeout(),
            },
            connector,
            media.clone(),
            Arc::new(channel.clone()),
            link_tx,
            publisher.clone(),
        );

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let mut ticker = time::interval(config.timeout_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut session = SessionLoop {
            room_id: room_id.clone(),
            orchestrator,
            media: media.clone(),
            channel: channel.clone(),
            subscription,
            link_events: link_rx,
            commands: command_rx,
            ended_screens: ended_rx,
            ticker,
            tasks: JoinSet::new(),
            publisher: publisher.clone(),
        };
        // Messages that arrived while we were waiting for the roster
        for message in backlog {
            session.on_relay_message(message);
        }
        let task = tokio::spawn(session.run());

        Ok(SessionHandle {
            local_id,
            room_id,
            display_name,
            channel,
            media,
            publisher,
            commands: command_tx,
            ended_screens: ended_tx,
            task: Mutex::new(Some(task)),
        })
    }
}

/// Wait for the roster that lists `local_id`, keeping everything else in
/// order for replay once the session is active.
async fn await_roster(
    subscription: &mut Subscription,
    local_id: &ParticipantId,
    room_id: Option<&RoomId>,
) -> Result<(Roster, Vec<ServerMessage>)> {
    let mut backlog = Vec::new();
    loop {
        match subscription.recv().await {
            Some(ChannelEvent::Message(ServerMessage::RosterUpdate(roster)))
                if roster.contains(local_id)
                    && room_id.map_or(true, |id| id == &roster.room_id) =>
            {
                return Ok((roster, backlog));
            }
            Some(ChannelEvent::Message(ServerMessage::Error { code, message })) => {
                return Err(MeshError::JoinRejected { code, message });
            }
            Some(ChannelEvent::Message(ServerMessage::Welcome { .. })) => {}
            Some(ChannelEvent::Message(message)) => backlog.push(message),
            Some(ChannelEvent::Disconnected) | None => {
                return Err(MeshError::TransportDisconnected);
            }
        }
    }
}

/// Undo a join the relay may still act on after we stopped waiting for it
fn abandon_join(
    channel: &SignalingChannel,
    mut subscription: Subscription,
    local_id: &ParticipantId,
    room_id: Option<RoomId>,
    error: &MeshError,
    grace: Duration,
) {
    if !channel.is_connected() {
        return;
    }
    match room_id {
        // Queued behind our join, so the relay sees them in that order
        Some(room_id) => {
            if let Err(e) = channel.send(ClientMessage::Leave { room_id }) {
                debug!("Could not send leave: {}", e);
            }
        }
        None if matches!(error, MeshError::JoinRejected { .. }) => {}
        // The relay names the room, so wait for a roster that lists us
        None => {
            let channel = channel.clone();
            let local_id = local_id.clone();
            tokio::spawn(async move {
                let late = time::timeout(grace, async {
                    loop {
                        match subscription.recv().await {
                            Some(ChannelEvent::Message(ServerMessage::RosterUpdate(roster)))
                                if roster.contains(&local_id) =>
                            {
                                return Some(roster.room_id);
                            }
                            Some(ChannelEvent::Message(_)) => {}
                            Some(ChannelEvent::Disconnected) | None => return None,
                        }
                    }
                })
                .await;
                if let Ok(Some(room_id)) = late {
                    info!("Leaving room {} joined after giving up", room_id);
                    if let Err(e) = channel.send(ClientMessage::Leave { room_id }) {
                        debug!("Could not send leave: {}", e);
                    }
                }
            });
        }
    }
}

struct SessionLoop {
    room_id: RoomId,
    orchestrator: PeerConnectionOrchestrator,
    media: Arc<MediaTrackManager>,
    channel: SignalingChannel,
    subscription: Subscription,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    ended_screens: mpsc::UnboundedReceiver<Uuid>,
    ticker: time::Interval,
    tasks: JoinSet<()>,
    publisher: ViewPublisher,
}

impl SessionLoop {
    async fn run(mut self) {
        let mut reply = None;
        let reason = loop {
            let step = tokio::select! {
                event = self.subscription.recv() => match event {
                    Some(ChannelEvent::Message(message)) => Step::Relay(message),
                    Some(ChannelEvent::Disconnected) | None => Step::TransportLost,
                },
                Some(event) = self.link_events.recv() => Step::Link(event),
                command = self.commands.recv() => match command {
                    Some(Command::Leave(reply)) => Step::Leave(Some(reply)),
                    None => Step::Leave(None),
                },
                Some(source_id) = self.ended_screens.recv() => Step::ScreenEnded(source_id),
                _ = self.ticker.tick() => Step::Tick,
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            warn!("Negotiation task panicked: {}", e);
                        }
                    }
                    Step::Idle
                }
            };

            match step {
                Step::Relay(message) => self.on_relay_message(message),
                Step::TransportLost => break "transport lost",
                Step::Link(event) => {
                    let continuation = self.orchestrator.on_link_event(event);
                    self.spawn(continuation);
                }
                Step::Leave(sender) => {
                    reply = sender;
                    break "left";
                }
                Step::ScreenEnded(source_id) => self.on_screen_ended(source_id),
                Step::Tick => {
                    let continuation = self.orchestrator.expire_stalled(Instant::now());
                    self.spawn(continuation);
                }
                Step::Idle => {}
            }
        };

        self.teardown(reason).await;
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    fn spawn(&mut self, continuation: Option<Continuation>) {
        if let Some(continuation) = continuation {
            self.tasks.spawn(continuation);
        }
    }

    fn on_relay_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::RosterUpdate(roster) => {
                if roster.room_id == self.room_id {
                    debug!("Roster for {}: {} members", roster.room_id, roster.count);
                    self.publisher.set_roster(roster);
                }
            }
            ServerMessage::ParticipantAppeared {
                room_id,
                participant_id,
                display_name,
            } if room_id == self.room_id => {
                debug!("{} ({}) appeared", participant_id, display_name);
                let continuation = self.orchestrator.on_participant_appeared(&participant_id);
                self.spawn(continuation);
            }
            ServerMessage::ParticipantLeft {
                room_id,
                participant_id,
            } if room_id == self.room_id => {
                let continuation = self.orchestrator.on_participant_left(&participant_id);
                self.spawn(continuation);
            }
            ServerMessage::Offer { room_id, from, sdp } if room_id == self.room_id => {
                let continuation = self.orchestrator.on_offer(&from, sdp);
                self.spawn(continuation);
            }
            ServerMessage::Answer { room_id, from, sdp } if room_id == self.room_id => {
                let continuation = self.orchestrator.on_answer(&from, sdp);
                self.spawn(continuation);
            }
            ServerMessage::IceCandidate {
                room_id,
                from,
                candidate,
            } if room_id == self.room_id => {
                let continuation = self.orchestrator.on_remote_candidate(&from, candidate);
                self.spawn(continuation);
            }
            ServerMessage::ChatMessage(chat) if chat.room_id == self.room_id => {
                self.publisher.push_chat(chat);
            }
            ServerMessage::Error { code, message } => {
                warn!("Relay error {}: {}", code, message);
                self.publisher.emit(SessionEvent::Error { code, message });
            }
            ServerMessage::Welcome { .. } => {}
            other => debug!("Ignoring message for another room: {:?}", other),
        }
    }

    /// Screen capture ended on its own: go back to the camera
    fn on_screen_ended(&mut self, source_id: Uuid) {
        let media = self.media.clone();
        let publisher = self.publisher.clone();
        self.tasks.spawn(async move {
            match media.revert_to_camera(source_id).await {
                Ok(true) => {
                    info!("Screen share ended, back to camera");
                    if let Some(track) = media.preview_track().await {
                        publisher.set_preview(track.id(), SourceKind::Camera);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Could not revert to camera: {}", e),
            }
        });
    }

    async fn teardown(mut self, reason: &str) {
        info!("Leaving room {}: {}", self.room_id, reason);
        self.tasks.shutdown().await;

        if self.channel.is_connected() {
            if let Err(e) = self.channel.send(ClientMessage::Leave {
                room_id: self.room_id.clone(),
            }) {
                debug!("Could not send leave: {}", e);
            }
        }

        self.orchestrator.close_all().await;
        self.media.shutdown().await;
        drop(self.subscription);

        self.publisher.update(|view| {
            view.phase = JoinPhase::Closed;
            view.preview = None;
        });
        self.publisher.emit(SessionEvent::Ended {
            reason: reason.to_string(),
        });
    }
}

/// Control surface of a running session
pub struct SessionHandle {
    local_id: ParticipantId,
    room_id: RoomId,
    display_name: String,
    channel: SignalingChannel,
    media: Arc<MediaTrackManager>,
    publisher: ViewPublisher,
    commands: mpsc::UnboundedSender<Command>,
    ended_screens: mpsc::UnboundedSender<Uuid>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn participant_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn view(&self) -> watch::Receiver<ConferenceView> {
        self.publisher.subscribe()
    }

    pub fn snapshot(&self) -> ConferenceView {
        self.publisher.snapshot()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.publisher.events()
    }

    pub fn is_active(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Switch outgoing video between camera and screen share
    pub async fn toggle_screen_share(&self) -> Result<SourceKind> {
        if !self.is_active() {
            return Err(MeshError::InvalidState("session has ended".to_string()));
        }

        let source = self.media.toggle_screen_share().await?;
        if let Some(track) = self.media.preview_track().await {
            self.publisher.set_preview(track.id(), source);
        }

        if source == SourceKind::ScreenShare {
            if let Some((source_id, mut status)) = self.media.screen_status().await {
                let ended = self.ended_screens.clone();
                tokio::spawn(async move {
                    let ended_by_capture = match status.wait_for(|s| *s != SourceStatus::Live).await {
                        Ok(s) => *s == SourceStatus::Ended,
                        Err(_) => false,
                    };
                    if ended_by_capture {
                        let _ = ended.send(source_id);
                    }
                });
            }
        }
        Ok(source)
    }

    /// Broadcast a chat line. Shown locally right away; the relay does not
    /// echo it back.
    pub fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        if !self.is_active() {
            return Err(MeshError::TransportDisconnected);
        }
        self.channel.send(ClientMessage::ChatMessage {
            room_id: self.room_id.clone(),
            text: text.clone(),
        })?;

        self.publisher.push_chat(ChatMessage {
            room_id: self.room_id.clone(),
            sender_id: self.local_id.clone(),
            sender_name: self.display_name.clone(),
            text,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Leave the room and wait for teardown to finish. Safe to call twice.
    pub async fn leave(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Leave(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }

        if let Some(task) = self.task.lock().await.take() {
            task.await
                .map_err(|e| MeshError::Internal(format!("session task: {}", e)))?;
        }
        Ok(())
    }

    /// Wait until the session ends by itself (transport loss)
    pub async fn closed(&self) {
        let mut view = self.view();
        let _ = view.wait_for(|v| v.phase == JoinPhase::Closed).await;
    }
}

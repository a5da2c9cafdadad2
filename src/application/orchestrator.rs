/// Peer Connection Orchestrator
///
/// Holds one `PeerLink` per remote participant and drives offer/answer and
/// ICE exchange over the signaling channel.
///
/// Every handler runs in two phases. The synchronous phase checks and
/// mutates the link table under its lock and is called by the session loop
/// in event order. Whatever must await (connecting, creating descriptions,
/// applying candidates) is returned as a `Continuation` for the caller to
/// spawn; continuations look the link up again by link id after every
/// await and give up quietly when it is gone.
use crate::application::media::MediaTrackManager;
use crate::application::negotiation::{
    LinkEvent, LinkEventSender, LinkHealth, PeerConnection, PeerConnector, SignalSender,
};
use crate::application::view::ViewPublisher;
use crate::domain::peer_link::{LinkState, PeerLink, RemoteStream};
use crate::domain::shared::{MeshError, ParticipantId, Result, RoomId};
use crate::domain::signaling::{ClientMessage, IceCandidate, SessionDescription};
use futures::future::{join_all, BoxFuture};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Deferred part of a handler
pub type Continuation = BoxFuture<'static, ()>;

type Connection = Arc<dyn PeerConnection>;

/// Identity of the local side of every link
#[derive(Debug, Clone)]
pub struct LinkContext {
    pub local_id: ParticipantId,
    pub room_id: RoomId,
    pub negotiation_timeout: Duration,
}

#[derive(Default)]
struct LinkTable {
    links: HashMap<ParticipantId, PeerLink<Connection>>,
    /// Remotes whose link failed or who left; never linked again
    retired: HashSet<ParticipantId>,
    closed: bool,
}

struct Inner {
    context: LinkContext,
    connector: Arc<dyn PeerConnector>,
    media: Arc<MediaTrackManager>,
    signals: Arc<dyn SignalSender>,
    link_events: LinkEventSender,
    table: Mutex<LinkTable>,
    publisher: ViewPublisher,
}

#[derive(Clone)]
pub struct PeerConnectionOrchestrator {
    inner: Arc<Inner>,
}

impl PeerConnectionOrchestrator {
    pub fn new(
        context: LinkContext,
        connector: Arc<dyn PeerConnector>,
        media: Arc<MediaTrackManager>,
        signals: Arc<dyn SignalSender>,
        link_events: LinkEventSender,
        publisher: ViewPublisher,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                context,
                connector,
                media,
                signals,
                link_events,
                table: Mutex::new(LinkTable::default()),
                publisher,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkTable> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn room_id(&self) -> RoomId {
        self.inner.context.room_id.clone()
    }

    fn accepts(&self, table: &LinkTable, remote: &ParticipantId) -> bool {
        !table.closed && remote != &self.inner.context.local_id && !table.retired.contains(remote)
    }

    /// Run `f` on the link if it is still the one identified by `link_id`
    fn with_link<R>(
        &self,
        remote: &ParticipantId,
        link_id: Uuid,
        f: impl FnOnce(&mut PeerLink<Connection>) -> R,
    ) -> Option<R> {
        let mut table = self.lock();
        if table.closed {
            return None;
        }
        let link = table
            .links
            .get_mut(remote)
            .filter(|link| link.link_id == link_id)?;
        Some(f(link))
    }

    /// Someone joined after us. Only pre-existing members see this notice,
    /// so the offering side is always unambiguous.
    pub fn on_participant_appeared(&self, remote: &ParticipantId) -> Option<Continuation> {
        let link_id = {
            let mut table = self.lock();
            if !self.accepts(&table, remote) {
                debug!("Ignoring appearance of {}", remote);
                return None;
            }
            if table.links.contains_key(remote) {
                debug!("Link to {} already exists", remote);
                return None;
            }

            let mut link = PeerLink::new(remote.clone());
            if let Err(e) = link.begin_negotiation(LinkState::Offering, Instant::now()) {
                warn!("Cannot start offer to {}: {}", remote, e);
                return None;
            }
            let link_id = link.link_id;
            table.links.insert(remote.clone(), link);
            self.inner.publisher.set_link(remote, LinkState::Offering);
            link_id
        };

        info!("Offering to {}", remote);
        let this = self.clone();
        let remote = remote.clone();
        Some(Box::pin(async move {
            if let Err(e) = this.offer(&remote, link_id).await {
                this.fail(&remote, link_id, e).await;
            }
        }))
    }

    async fn offer(&self, remote: &ParticipantId, link_id: Uuid) -> Result<()> {
        let Some(connection) = self.open_connection(remote, link_id).await? else {
            return Ok(());
        };

        let offer = connection.create_offer().await?;
        let message = ClientMessage::Offer {
            room_id: self.room_id(),
            to: remote.clone(),
            sdp: offer.sdp,
        };
        match self.send_description(remote, link_id, message) {
            Some(sent) => sent?,
            None => {
                debug!("Link to {} went away while creating the offer", remote);
                return Ok(());
            }
        }
        debug!("Sent offer to {}", remote);
        Ok(())
    }

    /// Send our offer or answer, then the local candidates gathered while it
    /// was being created. None when the link is gone.
    fn send_description(
        &self,
        remote: &ParticipantId,
        link_id: Uuid,
        message: ClientMessage,
    ) -> Option<Result<()>> {
        self.with_link(remote, link_id, |link| {
            self.inner.signals.send(message)?;
            for candidate in link.mark_description_sent() {
                self.send_candidate(remote, candidate);
            }
            Ok(())
        })
    }

    fn send_candidate(&self, remote: &ParticipantId, candidate: IceCandidate) {
        if let Err(e) = self.inner.signals.send(ClientMessage::IceCandidate {
            room_id: self.room_id(),
            to: remote.clone(),
            candidate,
        }) {
            debug!("Could not send candidate to {}: {}", remote, e);
        }
    }

    pub fn on_offer(&self, remote: &ParticipantId, sdp: String) -> Option<Continuation> {
        let link_id = {
            let mut table = self.lock();
            if !self.accepts(&table, remote) {
                debug!("Ignoring offer from {}", remote);
                return None;
            }

            let link = table
                .links
                .entry(remote.clone())
                .or_insert_with(|| PeerLink::new(remote.clone()));
            if link.state() != LinkState::Idle {
                warn!(
                    "Unexpected offer from {} in state {:?}, dropping",
                    remote,
                    link.state()
                );
                return None;
            }
            if let Err(e) = link.begin_negotiation(LinkState::Answering, Instant::now()) {
                warn!("Cannot answer {}: {}", remote, e);
                return None;
            }
            let link_id = link.link_id;
            self.inner.publisher.set_link(remote, LinkState::Answering);
            link_id
        };

        info!("Answering offer from {}", remote);
        let this = self.clone();
        let remote = remote.clone();
        Some(Box::pin(async move {
            if let Err(e) = this.answer(&remote, link_id, sdp).await {
                this.fail(&remote, link_id, e).await;
            }
        }))
    }

    async fn answer(&self, remote: &ParticipantId, link_id: Uuid, sdp: String) -> Result<()> {
        let Some(connection) = self.open_connection(remote, link_id).await? else {
            return Ok(());
        };

        connection
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        let Some(flush) = self.with_link(remote, link_id, |link| {
            link.mark_remote_description_applied()
        }) else {
            return Ok(());
        };
        if flush {
            self.flush_candidates(remote, link_id).await;
        }

        let answer = connection.create_answer().await?;
        let message = ClientMessage::Answer {
            room_id: self.room_id(),
            to: remote.clone(),
            sdp: answer.sdp,
        };
        match self.send_description(remote, link_id, message) {
            Some(sent) => sent?,
            None => {
                debug!("Link to {} went away while creating the answer", remote);
                return Ok(());
            }
        }
        debug!("Sent answer to {}", remote);
        Ok(())
    }

    /// Connect and attach local tracks.
    /// None when the link went away in the meantime.
    async fn open_connection(
        &self,
        remote: &ParticipantId,
        link_id: Uuid,
    ) -> Result<Option<Connection>> {
        let connection = self
            .inner
            .connector
            .connect(remote, self.inner.link_events.clone())
            .await?;

        let installed = self
            .with_link(remote, link_id, |link| link.set_connection(connection.clone()))
            .is_some();
        if !installed {
            if let Err(e) = connection.close().await {
                debug!("Closing orphaned connection to {}: {}", remote, e);
            }
            return Ok(None);
        }

        self.inner.media.attach(remote, connection.clone()).await?;
        if self.with_link(remote, link_id, |_| ()).is_none() {
            // Removal may have run its detach before we attached
            self.inner.media.detach(remote).await;
            return Ok(None);
        }
        Ok(Some(connection))
    }

    pub fn on_answer(&self, remote: &ParticipantId, sdp: String) -> Option<Continuation> {
        let (link_id, connection) = {
            let mut table = self.lock();
            if table.closed {
                return None;
            }
            let Some(link) = table.links.get_mut(remote) else {
                debug!("Answer from {} without a link, dropping", remote);
                return None;
            };
            let Some(connection) = link.connection() else {
                debug!("Answer from {} before our offer, dropping", remote);
                return None;
            };
            if !link.try_begin_answer() {
                debug!(
                    "Stale answer from {} in state {:?}, dropping",
                    remote,
                    link.state()
                );
                return None;
            }
            (link.link_id, connection)
        };

        let this = self.clone();
        let remote = remote.clone();
        Some(Box::pin(async move {
            if let Err(e) = this.apply_answer(&remote, link_id, connection, sdp).await {
                this.fail(&remote, link_id, e).await;
            }
        }))
    }

    async fn apply_answer(
        &self,
        remote: &ParticipantId,
        link_id: Uuid,
        connection: Connection,
        sdp: String,
    ) -> Result<()> {
        connection
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;

        let flush = self.with_link(remote, link_id, |link| {
            if link.state() == LinkState::Offering && link.transition(LinkState::Connected).is_ok() {
                self.inner.publisher.set_link(remote, LinkState::Connected);
                info!("Link to {} connected", remote);
            }
            link.mark_remote_description_applied()
        });
        if flush == Some(true) {
            self.flush_candidates(remote, link_id).await;
        }
        Ok(())
    }

    pub fn on_remote_candidate(
        &self,
        remote: &ParticipantId,
        candidate: IceCandidate,
    ) -> Option<Continuation> {
        let link_id = {
            let mut table = self.lock();
            if table.closed {
                return None;
            }
            let Some(link) = table.links.get_mut(remote) else {
                debug!("ICE candidate from {} without a link, dropping", remote);
                return None;
            };
            if !link.enqueue_candidate(candidate) {
                return None;
            }
            link.link_id
        };

        let this = self.clone();
        let remote = remote.clone();
        Some(Box::pin(async move {
            this.flush_candidates(&remote, link_id).await;
        }))
    }

    /// Apply queued candidates in arrival order. Only one flusher runs per
    /// link; candidates queued meanwhile are picked up by the same loop.
    async fn flush_candidates(&self, remote: &ParticipantId, link_id: Uuid) {
        loop {
            let next = self
                .with_link(remote, link_id, |link| {
                    let connection = link.connection()?;
                    link.next_candidate().map(|candidate| (candidate, connection))
                })
                .flatten();
            let Some((candidate, connection)) = next else {
                break;
            };

            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!("Rejected ICE candidate from {}: {}", remote, e);
            }
        }
    }

    pub fn on_link_event(&self, event: LinkEvent) -> Option<Continuation> {
        match event {
            LinkEvent::LocalCandidate { remote, candidate } => {
                // Sent under the table lock so nothing overtakes our description
                let mut table = self.lock();
                let Some(link) = table.links.get_mut(&remote) else {
                    debug!("Local candidate for closed link to {}", remote);
                    return None;
                };
                if let Some(candidate) = link.hold_local_candidate(candidate) {
                    self.send_candidate(&remote, candidate);
                }
                None
            }
            LinkEvent::Health { remote, health } => self.on_health(&remote, health),
            LinkEvent::RemoteTrack {
                remote,
                stream_id,
                track_id,
            } => {
                let mut table = self.lock();
                match table.links.get_mut(&remote) {
                    Some(link) => {
                        let stream = link.add_remote_track(stream_id, track_id);
                        self.inner.publisher.set_stream(&remote, stream);
                    }
                    None => debug!("Track from {} without a link", remote),
                }
                None
            }
        }
    }

    fn on_health(&self, remote: &ParticipantId, health: LinkHealth) -> Option<Continuation> {
        if health.is_terminal() {
            let link_id = self.lock().links.get(remote).map(|link| link.link_id)?;
            warn!("Link to {} reported {:?}", remote, health);
            return self.remove_link(remote, Some(link_id), LinkState::Failed);
        }

        if health == LinkHealth::Connected {
            let mut table = self.lock();
            if let Some(link) = table.links.get_mut(remote) {
                if link.state().is_negotiating() && link.transition(LinkState::Connected).is_ok() {
                    self.inner.publisher.set_link(remote, LinkState::Connected);
                    info!("Link to {} connected", remote);
                }
            }
        }
        None
    }

    pub fn on_participant_left(&self, remote: &ParticipantId) -> Option<Continuation> {
        info!("{} left, closing link", remote);
        self.remove_link(remote, None, LinkState::Closed)
    }

    /// Fail links stuck in Offering or Answering past the negotiation timeout
    pub fn expire_stalled(&self, now: Instant) -> Option<Continuation> {
        let timeout = self.inner.context.negotiation_timeout;
        let stalled: Vec<(ParticipantId, Uuid)> = self
            .lock()
            .links
            .values()
            .filter(|link| link.is_stalled(now, timeout))
            .map(|link| (link.remote.clone(), link.link_id))
            .collect();

        let continuations: Vec<Continuation> = stalled
            .into_iter()
            .filter_map(|(remote, link_id)| {
                warn!("Negotiation with {} timed out", remote);
                self.remove_link(&remote, Some(link_id), LinkState::Failed)
            })
            .collect();

        if continuations.is_empty() {
            return None;
        }
        Some(Box::pin(async move {
            join_all(continuations).await;
        }))
    }

    /// Remove a link (only the given one when `link_id` is set) and retire
    /// the remote. Closing the connection and releasing tracks is deferred.
    fn remove_link(
        &self,
        remote: &ParticipantId,
        link_id: Option<Uuid>,
        final_state: LinkState,
    ) -> Option<Continuation> {
        let connection = {
            let mut table = self.lock();
            let matches = table
                .links
                .get(remote)
                .map(|link| link_id.map_or(true, |id| link.link_id == id))
                .unwrap_or(false);
            if link_id.is_none() || matches {
                table.retired.insert(remote.clone());
            }
            if !matches {
                return None;
            }

            let mut link = table.links.remove(remote)?;
            if let Err(e) = link.transition(final_state) {
                debug!("{}", e);
            }
            self.inner.publisher.remove_link(remote, final_state);
            link.take_connection()
        };

        let this = self.clone();
        let remote = remote.clone();
        Some(Box::pin(async move {
            this.release(&remote, connection).await;
        }))
    }

    async fn fail(&self, remote: &ParticipantId, link_id: Uuid, error: MeshError) {
        warn!("Negotiation with {} failed: {}", remote, error);
        if let Some(cleanup) = self.remove_link(remote, Some(link_id), LinkState::Failed) {
            cleanup.await;
        }
    }

    async fn release(&self, remote: &ParticipantId, connection: Option<Connection>) {
        self.inner.media.detach(remote).await;
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                debug!("Closing connection to {}: {}", remote, e);
            }
        }
    }

    /// Close every link; no new link is accepted afterwards
    pub async fn close_all(&self) {
        let links: Vec<(ParticipantId, Option<Connection>)> = {
            let mut table = self.lock();
            table.closed = true;
            table
                .links
                .drain()
                .map(|(remote, mut link)| {
                    if let Err(e) = link.transition(LinkState::Closed) {
                        debug!("{}", e);
                    }
                    self.inner.publisher.remove_link(&remote, LinkState::Closed);
                    (remote, link.take_connection())
                })
                .collect()
        };

        let count = links.len();
        for (remote, connection) in links {
            self.release(&remote, connection).await;
        }
        info!("Closed {} peer links", count);
    }

    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    pub fn link_state(&self, remote: &ParticipantId) -> Option<LinkState> {
        self.lock().links.get(remote).map(|link| link.state())
    }

    pub fn links(&self) -> Vec<(ParticipantId, LinkState)> {
        self.lock()
            .links
            .iter()
            .map(|(remote, link)| (remote.clone(), link.state()))
            .collect()
    }

    pub fn remote_streams(&self) -> HashMap<ParticipantId, RemoteStream> {
        self.lock()
            .links
            .iter()
            .filter_map(|(remote, link)| {
                link.remote_stream()
                    .map(|stream| (remote.clone(), stream.clone()))
            })
            .collect()
    }

    pub fn pending_candidates(&self, remote: &ParticipantId) -> usize {
        self.lock()
            .links
            .get(remote)
            .map(|link| link.pending_candidates())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::media::{LocalTrack, SampleTrackDevices};
    use crate::application::negotiation::{MockPeerConnector, MockSignalSender};
    use crate::domain::signaling::SdpKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeConnection {
        ops: Mutex<Vec<String>>,
        remote_set: AtomicBool,
        closed: AtomicBool,
        fail_offer: bool,
    }

    impl FakeConnection {
        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }

        fn record(&self, op: impl Into<String>) {
            self.ops.lock().unwrap().push(op.into());
        }
    }

    #[async_trait]
    impl PeerConnection for FakeConnection {
        async fn add_tracks(&self, tracks: Vec<LocalTrack>) -> Result<()> {
            self.record(format!("tracks:{}", tracks.len()));
            Ok(())
        }

        async fn replace_video_track(&self, _track: LocalTrack) -> Result<()> {
            self.record("replace");
            Ok(())
        }

        async fn create_offer(&self) -> Result<SessionDescription> {
            if self.fail_offer {
                return Err(MeshError::Negotiation("no codecs".to_string()));
            }
            self.record("offer");
            Ok(SessionDescription::offer("v=0 offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            self.record("answer");
            Ok(SessionDescription::answer("v=0 answer"))
        }

        async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
            let kind = match description.kind {
                SdpKind::Offer => "offer",
                SdpKind::Answer => "answer",
            };
            self.record(format!("remote:{}", kind));
            self.remote_set.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            assert!(self.remote_set.load(Ordering::SeqCst));
            self.record(format!("candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        fail_offer: bool,
        opened: Mutex<HashMap<ParticipantId, Arc<FakeConnection>>>,
    }

    impl FakeConnector {
        fn connection(&self, remote: &str) -> Arc<FakeConnection> {
            self.opened.lock().unwrap()[&ParticipantId::from(remote)].clone()
        }
    }

    #[async_trait]
    impl PeerConnector for FakeConnector {
        async fn connect(
            &self,
            remote: &ParticipantId,
            _events: LinkEventSender,
        ) -> Result<Arc<dyn PeerConnection>> {
            let connection = Arc::new(FakeConnection {
                fail_offer: self.fail_offer,
                ..Default::default()
            });
            self.opened
                .lock()
                .unwrap()
                .insert(remote.clone(), connection.clone());
            Ok(connection)
        }
    }

    #[derive(Default)]
    struct RecordingSignals {
        sent: Mutex<Vec<ClientMessage>>,
    }

    impl SignalSender for RecordingSignals {
        fn send(&self, message: ClientMessage) -> Result<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }
    }

    impl RecordingSignals {
        fn kinds(&self) -> Vec<&'static str> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|m| match m {
                    ClientMessage::Offer { .. } => "offer",
                    ClientMessage::Answer { .. } => "answer",
                    ClientMessage::IceCandidate { .. } => "ice-candidate",
                    _ => "other",
                })
                .collect()
        }
    }

    struct Fixture {
        orchestrator: PeerConnectionOrchestrator,
        connector: Arc<FakeConnector>,
        signals: Arc<RecordingSignals>,
        media: Arc<MediaTrackManager>,
        publisher: ViewPublisher,
        _events: mpsc::UnboundedReceiver<LinkEvent>,
    }

    async fn fixture_with(connector: FakeConnector) -> Fixture {
        let connector = Arc::new(connector);
        let signals = Arc::new(RecordingSignals::default());
        let media = Arc::new(MediaTrackManager::new(Arc::new(SampleTrackDevices::new("local"))));
        media.start_camera().await.unwrap();
        let publisher = ViewPublisher::new(10);
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = PeerConnectionOrchestrator::new(
            LinkContext {
                local_id: ParticipantId::from("local"),
                room_id: RoomId::from("room"),
                negotiation_timeout: Duration::from_secs(30),
            },
            connector.clone(),
            media.clone(),
            signals.clone(),
            tx,
            publisher.clone(),
        );
        Fixture {
            orchestrator,
            connector,
            signals,
            media,
            publisher,
            _events: rx,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(FakeConnector::default()).await
    }

    fn id(s: &str) -> ParticipantId {
        ParticipantId::from(s)
    }

    #[tokio::test]
    async fn test_appearance_sends_one_offer() {
        let f = fixture().await;
        f.orchestrator.on_participant_appeared(&id("b")).unwrap().await;
        assert!(f.orchestrator.on_participant_appeared(&id("b")).is_none());
        assert!(f.orchestrator.on_participant_appeared(&id("local")).is_none());

        assert_eq!(f.signals.kinds(), vec!["offer"]);
        assert_eq!(f.orchestrator.link_state(&id("b")), Some(LinkState::Offering));
        assert_eq!(f.connector.connection("b").ops(), vec!["tracks:2", "offer"]);
        assert_eq!(f.media.consumer_count().await, 1);
        assert_eq!(
            f.publisher.snapshot().links.get(&id("b")),
            Some(&LinkState::Offering)
        );
    }

    #[tokio::test]
    async fn test_answer_connects_once() {
        let f = fixture().await;
        f.orchestrator.on_participant_appeared(&id("b")).unwrap().await;

        f.orchestrator
            .on_answer(&id("b"), "sdp".to_string())
            .unwrap()
            .await;
        assert_eq!(f.orchestrator.link_state(&id("b")), Some(LinkState::Connected));

        assert!(f.orchestrator.on_answer(&id("b"), "again".to_string()).is_none());
        assert!(f.orchestrator.on_answer(&id("x"), "sdp".to_string()).is_none());
        assert_eq!(
            f.connector.connection("b").ops(),
            vec!["tracks:2", "offer", "remote:answer"]
        );
    }

    #[tokio::test]
    async fn test_candidates_queue_until_answer() {
        let f = fixture().await;
        f.orchestrator.on_participant_appeared(&id("b")).unwrap().await;

        for c in ["c1", "c2", "c3"] {
            assert!(f
                .orchestrator
                .on_remote_candidate(&id("b"), IceCandidate::new(c))
                .is_none());
        }
        assert_eq!(f.orchestrator.pending_candidates(&id("b")), 3);
        assert!(f
            .orchestrator
            .on_remote_candidate(&id("nobody"), IceCandidate::new("c0"))
            .is_none());

        f.orchestrator
            .on_answer(&id("b"), "sdp".to_string())
            .unwrap()
            .await;
        assert_eq!(f.orchestrator.pending_candidates(&id("b")), 0);

        f.orchestrator
            .on_remote_candidate(&id("b"), IceCandidate::new("c4"))
            .unwrap()
            .await;

        let ops = f.connector.connection("b").ops();
        assert_eq!(
            ops[2..],
            [
                "remote:answer",
                "candidate:c1",
                "candidate:c2",
                "candidate:c3",
                "candidate:c4"
            ]
        );
    }

    #[tokio::test]
    async fn test_offer_is_answered() {
        let f = fixture().await;
        assert!(f
            .orchestrator
            .on_remote_candidate(&id("a"), IceCandidate::new("early"))
            .is_none());

        let answer = f.orchestrator.on_offer(&id("a"), "sdp".to_string()).unwrap();
        // Candidates that race the continuation are queued
        assert!(f
            .orchestrator
            .on_remote_candidate(&id("a"), IceCandidate::new("c1"))
            .is_none());
        answer.await;

        assert_eq!(f.signals.kinds(), vec!["answer"]);
        assert_eq!(f.orchestrator.link_state(&id("a")), Some(LinkState::Answering));
        assert_eq!(
            f.connector.connection("a").ops(),
            vec!["tracks:2", "remote:offer", "candidate:c1", "answer"]
        );

        // A second offer for a negotiating link is unexpected
        assert!(f.orchestrator.on_offer(&id("a"), "sdp".to_string()).is_none());

        assert!(f
            .orchestrator
            .on_link_event(LinkEvent::Health {
                remote: id("a"),
                health: LinkHealth::Connected,
            })
            .is_none());
        assert_eq!(f.orchestrator.link_state(&id("a")), Some(LinkState::Connected));
    }

    #[tokio::test]
    async fn test_failure_removes_and_retires() {
        let f = fixture().await;
        f.orchestrator.on_participant_appeared(&id("b")).unwrap().await;
        f.orchestrator
            .on_link_event(LinkEvent::Health {
                remote: id("b"),
                health: LinkHealth::Failed,
            })
            .unwrap()
            .await;

        assert_eq!(f.orchestrator.link_count(), 0);
        assert!(f.connector.connection("b").closed.load(Ordering::SeqCst));
        assert_eq!(f.media.consumer_count().await, 0);
        assert!(f.orchestrator.on_participant_appeared(&id("b")).is_none());
        assert!(f.orchestrator.on_offer(&id("b"), "sdp".to_string()).is_none());
    }

    #[tokio::test]
    async fn test_offer_error_fails_link() {
        let f = fixture_with(FakeConnector {
            fail_offer: true,
            ..Default::default()
        })
        .await;
        f.orchestrator.on_participant_appeared(&id("b")).unwrap().await;

        assert_eq!(f.orchestrator.link_count(), 0);
        assert!(f.signals.kinds().is_empty());
        assert_eq!(f.media.consumer_count().await, 0);
    }

    #[tokio::test]
    async fn test_leave_during_negotiation() {
        let f = fixture().await;
        let offer = f.orchestrator.on_participant_appeared(&id("b")).unwrap();
        f.orchestrator.on_participant_left(&id("b")).unwrap().await;
        offer.await;

        assert_eq!(f.orchestrator.link_count(), 0);
        assert!(f.signals.kinds().is_empty());
        assert!(f.connector.connection("b").closed.load(Ordering::SeqCst));
        assert_eq!(f.media.consumer_count().await, 0);
    }

    #[tokio::test]
    async fn test_remote_tracks_reach_view() {
        let f = fixture().await;
        f.orchestrator.on_participant_appeared(&id("b")).unwrap().await;
        for track in ["audio", "video"] {
            f.orchestrator.on_link_event(LinkEvent::RemoteTrack {
                remote: id("b"),
                stream_id: "stream-b".to_string(),
                track_id: track.to_string(),
            });
        }

        let streams = f.orchestrator.remote_streams();
        assert_eq!(streams[&id("b")].track_ids, vec!["audio", "video"]);
        assert_eq!(f.publisher.snapshot().streams.len(), 1);

        f.orchestrator.on_participant_left(&id("b")).unwrap().await;
        assert!(f.publisher.snapshot().streams.is_empty());
    }

    #[tokio::test]
    async fn test_local_candidates_are_relayed() {
        let f = fixture().await;
        f.orchestrator.on_participant_appeared(&id("b")).unwrap().await;
        f.orchestrator.on_link_event(LinkEvent::LocalCandidate {
            remote: id("b"),
            candidate: IceCandidate::new("local-1"),
        });
        f.orchestrator.on_link_event(LinkEvent::LocalCandidate {
            remote: id("gone"),
            candidate: IceCandidate::new("local-2"),
        });
        assert_eq!(f.signals.kinds(), vec!["offer", "ice-candidate"]);
    }

    fn candidate(remote: &str, c: &str) -> LinkEvent {
        LinkEvent::LocalCandidate {
            remote: id(remote),
            candidate: IceCandidate::new(c),
        }
    }

    #[tokio::test]
    async fn test_local_candidates_follow_the_offer() {
        let f = fixture().await;
        let offer = f.orchestrator.on_participant_appeared(&id("b")).unwrap();
        // Gathering starts before the offer leaves
        assert!(f.orchestrator.on_link_event(candidate("b", "l1")).is_none());
        assert!(f.orchestrator.on_link_event(candidate("b", "l2")).is_none());
        assert!(f.signals.kinds().is_empty());

        offer.await;
        f.orchestrator.on_link_event(candidate("b", "l3"));

        assert_eq!(
            f.signals.kinds(),
            vec!["offer", "ice-candidate", "ice-candidate", "ice-candidate"]
        );
        let sent: Vec<String> = f
            .signals
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                ClientMessage::IceCandidate { candidate, .. } => Some(candidate.candidate.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec!["l1", "l2", "l3"]);
    }

    #[tokio::test]
    async fn test_local_candidates_follow_the_answer() {
        let f = fixture().await;
        let answer = f.orchestrator.on_offer(&id("a"), "sdp".to_string()).unwrap();
        f.orchestrator.on_link_event(candidate("a", "l1"));
        assert!(f.signals.kinds().is_empty());

        answer.await;
        assert_eq!(f.signals.kinds(), vec!["answer", "ice-candidate"]);
    }

    #[tokio::test]
    async fn test_held_candidates_dropped_with_link() {
        let f = fixture().await;
        let offer = f.orchestrator.on_participant_appeared(&id("b")).unwrap();
        f.orchestrator.on_link_event(candidate("b", "l1"));
        f.orchestrator.on_participant_left(&id("b")).unwrap().await;
        offer.await;

        assert!(f.signals.kinds().is_empty());
    }

    async fn orchestrator_with(
        connector: Arc<dyn PeerConnector>,
        signals: Arc<dyn SignalSender>,
    ) -> (PeerConnectionOrchestrator, Arc<MediaTrackManager>) {
        let media = Arc::new(MediaTrackManager::new(Arc::new(SampleTrackDevices::new("local"))));
        media.start_camera().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let orchestrator = PeerConnectionOrchestrator::new(
            LinkContext {
                local_id: id("local"),
                room_id: RoomId::from("room"),
                negotiation_timeout: Duration::from_secs(30),
            },
            connector,
            media.clone(),
            signals,
            tx,
            ViewPublisher::new(10),
        );
        (orchestrator, media)
    }

    #[tokio::test]
    async fn test_unsendable_offer_fails_link() {
        let connection = Arc::new(FakeConnection::default());
        let mut connector = MockPeerConnector::new();
        let opened = connection.clone();
        connector
            .expect_connect()
            .times(1)
            .returning(move |_, _| Ok(opened.clone() as Arc<dyn PeerConnection>));
        let mut signals = MockSignalSender::new();
        signals
            .expect_send()
            .withf(|m| matches!(m, ClientMessage::Offer { .. }))
            .times(1)
            .returning(|_| Err(MeshError::TransportDisconnected));

        let (orchestrator, media) =
            orchestrator_with(Arc::new(connector), Arc::new(signals)).await;
        orchestrator.on_participant_appeared(&id("b")).unwrap().await;

        assert_eq!(orchestrator.link_count(), 0);
        assert!(connection.closed.load(Ordering::SeqCst));
        assert_eq!(media.consumer_count().await, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_fails_link() {
        let mut connector = MockPeerConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_, _| Err(MeshError::Negotiation("no transport".to_string())));
        let mut signals = MockSignalSender::new();
        signals.expect_send().never();

        let (orchestrator, media) =
            orchestrator_with(Arc::new(connector), Arc::new(signals)).await;
        orchestrator.on_offer(&id("a"), "sdp".to_string()).unwrap().await;

        assert_eq!(orchestrator.link_count(), 0);
        assert_eq!(media.consumer_count().await, 0);
        // Retired: a second offer is ignored
        assert!(orchestrator.on_offer(&id("a"), "sdp".to_string()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_negotiation_expires() {
        let f = fixture().await;
        f.orchestrator.on_participant_appeared(&id("b")).unwrap().await;
        f.orchestrator.on_participant_appeared(&id("c")).unwrap().await;
        f.orchestrator
            .on_answer(&id("c"), "sdp".to_string())
            .unwrap()
            .await;

        assert!(f.orchestrator.expire_stalled(Instant::now()).is_none());
        tokio::time::advance(Duration::from_secs(31)).await;
        f.orchestrator.expire_stalled(Instant::now()).unwrap().await;

        assert_eq!(f.orchestrator.link_state(&id("b")), None);
        assert_eq!(f.orchestrator.link_state(&id("c")), Some(LinkState::Connected));
    }

    #[tokio::test]
    async fn test_close_all() {
        let f = fixture().await;
        f.orchestrator.on_participant_appeared(&id("b")).unwrap().await;
        f.orchestrator.on_offer(&id("c"), "sdp".to_string()).unwrap().await;

        f.orchestrator.close_all().await;
        assert_eq!(f.orchestrator.link_count(), 0);
        assert!(f.connector.connection("b").closed.load(Ordering::SeqCst));
        assert!(f.connector.connection("c").closed.load(Ordering::SeqCst));
        assert_eq!(f.media.consumer_count().await, 0);
        assert!(f.orchestrator.on_participant_appeared(&id("d")).is_none());
        assert!(f.publisher.snapshot().links.is_empty());
    }
}

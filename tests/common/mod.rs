//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use meshcall::application::media::{
    EndHandle, LocalTrack, MediaDevices, MediaSource, SampleTrackDevices, TrackKind,
};
use meshcall::application::negotiation::{
    LinkEvent, LinkEventSender, LinkHealth, PeerConnection, PeerConnector,
};
use meshcall::application::view::ConferenceView;
use meshcall::domain::shared::{MeshError, ParticipantId, Result};
use meshcall::domain::signaling::{IceCandidate, SdpKind, SessionDescription};
use meshcall::SessionHandle;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

/// Book-keeping shared by every fake connection in a test
#[derive(Default)]
pub struct FakeNetwork {
    offers: AtomicUsize,
    answers: AtomicUsize,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answers(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.connections.lock().unwrap().clone()
    }

    /// Connections opened by `owner` (the connector label)
    pub fn owned_by(&self, owner: &str) -> Vec<Arc<FakeConnection>> {
        self.connections()
            .into_iter()
            .filter(|c| c.owner == owner)
            .collect()
    }

    pub fn early_candidates(&self) -> usize {
        self.connections()
            .iter()
            .map(|c| c.early_candidates.load(Ordering::SeqCst))
            .sum()
    }

    pub fn applied_candidates(&self) -> usize {
        self.connections()
            .iter()
            .map(|c| c.candidates().len())
            .sum()
    }
}

/// Connector that opens scripted connections for one participant
pub struct FakeConnector {
    owner: String,
    network: Arc<FakeNetwork>,
}

impl FakeConnector {
    pub fn new(owner: &str, network: Arc<FakeNetwork>) -> Arc<Self> {
        Arc::new(Self {
            owner: owner.to_string(),
            network,
        })
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        remote: &ParticipantId,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerConnection>> {
        let connection = Arc::new(FakeConnection {
            owner: self.owner.clone(),
            remote: remote.clone(),
            events,
            network: Arc::downgrade(&self.network),
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            early_candidates: AtomicUsize::new(0),
            candidates: Mutex::new(Vec::new()),
            video: Mutex::new(None),
        });
        self.network
            .connections
            .lock()
            .unwrap()
            .push(connection.clone());
        Ok(connection)
    }
}

/// Connection that "connects" once both descriptions are applied.
///
/// Gathers two candidates as soon as it creates its local description and
/// reports one remote audio/video stream when the remote description lands.
pub struct FakeConnection {
    pub owner: String,
    pub remote: ParticipantId,
    events: LinkEventSender,
    network: std::sync::Weak<FakeNetwork>,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
    early_candidates: AtomicUsize,
    candidates: Mutex<Vec<String>>,
    video: Mutex<Option<String>>,
}

impl FakeConnection {
    pub fn candidates(&self) -> Vec<String> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn video_track(&self) -> Option<String> {
        self.video.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn maybe_connect(&self) {
        if self.local_set.load(Ordering::SeqCst)
            && self.remote_set.load(Ordering::SeqCst)
            && !self.connected.swap(true, Ordering::SeqCst)
        {
            let _ = self.events.send(LinkEvent::Health {
                remote: self.remote.clone(),
                health: LinkHealth::Connected,
            });
        }
    }

    /// Report two local candidates immediately, as a real agent may do the
    /// moment the local description is set
    fn gather(&self) {
        let prefix = format!("{}->{}", self.owner, self.remote);
        for n in 1..=2 {
            let _ = self.events.send(LinkEvent::LocalCandidate {
                remote: self.remote.clone(),
                candidate: IceCandidate::new(format!("{}#{}", prefix, n)),
            });
        }
    }

    fn description(&self, kind: SdpKind) -> SessionDescription {
        let sdp = format!("v=0\r\ns={}->{}\r\n", self.owner, self.remote);
        match kind {
            SdpKind::Offer => SessionDescription::offer(sdp),
            SdpKind::Answer => SessionDescription::answer(sdp),
        }
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn add_tracks(&self, tracks: Vec<LocalTrack>) -> Result<()> {
        if let Some(video) = tracks.iter().find(|t| t.kind() == TrackKind::Video) {
            *self.video.lock().unwrap() = Some(video.id().to_string());
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: LocalTrack) -> Result<()> {
        *self.video.lock().unwrap() = Some(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        if let Some(network) = self.network.upgrade() {
            network.offers.fetch_add(1, Ordering::SeqCst);
        }
        self.local_set.store(true, Ordering::SeqCst);
        self.gather();
        // Let the session loop see the candidates before the offer is sent
        tokio::task::yield_now().await;
        Ok(self.description(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(MeshError::Negotiation("answer without offer".to_string()));
        }
        if let Some(network) = self.network.upgrade() {
            network.answers.fetch_add(1, Ordering::SeqCst);
        }
        self.local_set.store(true, Ordering::SeqCst);
        self.gather();
        self.maybe_connect();
        tokio::task::yield_now().await;
        Ok(self.description(SdpKind::Answer))
    }

    async fn set_remote_description(&self, _description: SessionDescription) -> Result<()> {
        self.remote_set.store(true, Ordering::SeqCst);
        let stream_id = format!("{}-stream", self.remote);
        for kind in ["audio", "video"] {
            let _ = self.events.send(LinkEvent::RemoteTrack {
                remote: self.remote.clone(),
                stream_id: stream_id.clone(),
                track_id: format!("{}-{}", self.remote, kind),
            });
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !self.remote_set.load(Ordering::SeqCst) {
            self.early_candidates.fetch_add(1, Ordering::SeqCst);
        }
        self.candidates.lock().unwrap().push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Devices whose camera is always denied
pub struct DeniedDevices;

#[async_trait]
impl MediaDevices for DeniedDevices {
    async fn acquire_camera(&self) -> Result<MediaSource> {
        Err(MeshError::DeviceAcquisition("camera permission denied".to_string()))
    }

    async fn acquire_display(&self) -> Result<MediaSource> {
        Err(MeshError::DeviceAcquisition("display permission denied".to_string()))
    }
}

/// Sample devices that let a test stop the latest screen capture, as a
/// user would from the browser's sharing bar
pub struct ScreenDevices {
    inner: SampleTrackDevices,
    screen: Mutex<Option<EndHandle>>,
}

impl ScreenDevices {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: SampleTrackDevices::new(label),
            screen: Mutex::new(None),
        })
    }

    pub fn end_screen(&self) {
        let handle = self.screen.lock().unwrap().take();
        handle.expect("no screen capture to end").end();
    }
}

#[async_trait]
impl MediaDevices for ScreenDevices {
    async fn acquire_camera(&self) -> Result<MediaSource> {
        self.inner.acquire_camera().await
    }

    async fn acquire_display(&self) -> Result<MediaSource> {
        let source = self.inner.acquire_display().await?;
        *self.screen.lock().unwrap() = Some(source.end_handle());
        Ok(source)
    }
}

/// Wait until the session's view satisfies `predicate`
pub async fn wait_for_view(
    handle: &SessionHandle,
    what: &str,
    predicate: impl FnMut(&ConferenceView) -> bool,
) -> ConferenceView {
    let mut view = handle.view();
    let result = match timeout(WAIT, view.wait_for(predicate)).await {
        Ok(Ok(view)) => (*view).clone(),
        _ => panic!("timed out waiting for {}: {:?}", what, handle.snapshot()),
    };
    result
}

/// Poll `condition` until it holds
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let polled = timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

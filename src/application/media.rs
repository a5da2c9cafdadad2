/// Media Track Manager
///
/// Owns the local capture sources and the outgoing video of every peer link.
/// Exactly one source feeds outgoing video at any time (camera or screen
/// share); switching replaces the track on every link and on the local
/// preview as one operation, or not at all.

use crate::application::negotiation::PeerConnection;
use crate::domain::shared::{MeshError, ParticipantId, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Which capture feeds outgoing video
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Camera,
    ScreenShare,
}

/// Lifecycle of a capture source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceStatus {
    Live,
    /// Stopped by us once nothing references it
    Stopped,
    /// Ended by the capture side (device unplugged, share dialog closed)
    Ended,
}

/// A local track; the capture pipeline writes samples into `inner()`
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn video(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            kind: TrackKind::Video,
            track: Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    ..Default::default()
                },
                id.into(),
                stream_id.into(),
            )),
        }
    }

    pub fn audio(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            kind: TrackKind::Audio,
            track: Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    ..Default::default()
                },
                id.into(),
                stream_id.into(),
            )),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn stream_id(&self) -> &str {
        self.track.stream_id()
    }

    pub fn inner(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id())
            .finish()
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.track, &other.track)
    }
}

/// A capture source, shared by every link that sends it.
///
/// Reference counted: tracks stop when the last holder releases it.
pub struct MediaSource {
    id: Uuid,
    kind: SourceKind,
    audio: Option<LocalTrack>,
    video: LocalTrack,
    refs: AtomicUsize,
    status: Arc<watch::Sender<SourceStatus>>,
}

impl MediaSource {
    pub fn new(kind: SourceKind, audio: Option<LocalTrack>, video: LocalTrack) -> Self {
        let (status, _) = watch::channel(SourceStatus::Live);
        Self {
            id: Uuid::new_v4(),
            kind,
            audio,
            video,
            refs: AtomicUsize::new(0),
            status: Arc::new(status),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn audio(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> &LocalTrack {
        &self.video
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn retain(&self) -> usize {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop one reference, stopping the source when none remain
    pub fn release(&self) -> usize {
        let previous = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        let remaining = previous.saturating_sub(1);
        if remaining == 0 {
            self.stop();
        }
        remaining
    }

    /// Release the capture hardware
    pub fn stop(&self) {
        let changed = self.status.send_if_modified(|status| {
            if *status == SourceStatus::Live {
                *status = SourceStatus::Stopped;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("Stopped {:?} source {}", self.kind, self.id);
        }
    }

    /// Report that the capture side ended the source on its own
    pub fn end(&self) {
        self.end_handle().end();
    }

    /// Handle the capture backend keeps to report the end of capture
    pub fn end_handle(&self) -> EndHandle {
        EndHandle {
            status: self.status.clone(),
        }
    }

    pub fn status(&self) -> SourceStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SourceStatus> {
        self.status.subscribe()
    }
}

/// Ends a `MediaSource` from outside, e.g. when the user stops sharing
/// from the system dialog
#[derive(Clone)]
pub struct EndHandle {
    status: Arc<watch::Sender<SourceStatus>>,
}

impl EndHandle {
    pub fn end(&self) {
        self.status.send_if_modified(|status| {
            if *status == SourceStatus::Live {
                *status = SourceStatus::Ended;
                true
            } else {
                false
            }
        });
    }
}

impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSource")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("refs", &self.ref_count())
            .field("status", &self.status())
            .finish()
    }
}

/// Local capture devices
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Camera plus microphone
    async fn acquire_camera(&self) -> Result<MediaSource>;

    /// Display capture (video only)
    async fn acquire_display(&self) -> Result<MediaSource>;
}

/// Devices that hand out sample-fed tracks.
///
/// Acquisition never touches hardware; whatever captures frames writes them
/// into the returned tracks.
#[derive(Debug, Default)]
pub struct SampleTrackDevices {
    label: String,
}

impl SampleTrackDevices {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl MediaDevices for SampleTrackDevices {
    async fn acquire_camera(&self) -> Result<MediaSource> {
        let stream_id = format!("{}-camera-{}", self.label, Uuid::new_v4());
        Ok(MediaSource::new(
            SourceKind::Camera,
            Some(LocalTrack::audio(format!("{}-mic", stream_id), stream_id.clone())),
            LocalTrack::video(format!("{}-video", stream_id), stream_id),
        ))
    }

    async fn acquire_display(&self) -> Result<MediaSource> {
        let stream_id = format!("{}-screen-{}", self.label, Uuid::new_v4());
        Ok(MediaSource::new(
            SourceKind::ScreenShare,
            None,
            LocalTrack::video(format!("{}-video", stream_id), stream_id),
        ))
    }
}

/// A link that receives our tracks
struct Consumer {
    connection: Arc<dyn PeerConnection>,
    /// Source whose video the link is currently sending
    video_source: Arc<MediaSource>,
}

#[derive(Default)]
struct MediaState {
    camera: Option<Arc<MediaSource>>,
    screen: Option<Arc<MediaSource>>,
    consumers: HashMap<ParticipantId, Consumer>,
}

impl MediaState {
    fn outgoing(&self) -> Option<Arc<MediaSource>> {
        self.screen.clone().or_else(|| self.camera.clone())
    }
}

/// Outgoing media for one client
pub struct MediaTrackManager {
    devices: Arc<dyn MediaDevices>,
    /// Held across track replacement so swaps and attaches never interleave
    state: Mutex<MediaState>,
}

impl MediaTrackManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            state: Mutex::new(MediaState::default()),
        }
    }

    /// Acquire camera and microphone. Nothing changes on failure.
    pub async fn start_camera(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.camera.is_some() {
            return Ok(());
        }

        let camera = Arc::new(self.devices.acquire_camera().await?);
        // One reference for the session, one for the preview
        camera.retain();
        camera.retain();
        info!("Camera source {} acquired", camera.id());
        state.camera = Some(camera);
        Ok(())
    }

    /// Start sending the current tracks on a new link
    pub async fn attach(&self, remote: &ParticipantId, connection: Arc<dyn PeerConnection>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.consumers.contains_key(remote) {
            return Ok(());
        }

        let camera = state
            .camera
            .clone()
            .ok_or_else(|| MeshError::InvalidState("no local media".to_string()))?;
        let video_source = state.outgoing().unwrap_or_else(|| camera.clone());

        let mut tracks = Vec::with_capacity(2);
        if let Some(audio) = camera.audio() {
            tracks.push(audio.clone());
        }
        tracks.push(video_source.video().clone());
        connection.add_tracks(tracks).await?;

        camera.retain();
        video_source.retain();
        state.consumers.insert(
            remote.clone(),
            Consumer {
                connection,
                video_source,
            },
        );
        debug!("Attached local tracks to link {}", remote);
        Ok(())
    }

    /// Forget a link and drop its references
    pub async fn detach(&self, remote: &ParticipantId) {
        let mut state = self.state.lock().await;
        if let Some(consumer) = state.consumers.remove(remote) {
            consumer.video_source.release();
            if let Some(camera) = &state.camera {
                camera.release();
            }
            debug!("Detached local tracks from link {}", remote);
        }
    }

    /// Switch between camera and screen share on every link at once
    pub async fn toggle_screen_share(&self) -> Result<SourceKind> {
        let mut state = self.state.lock().await;
        if state.screen.is_some() {
            self.swap_to_camera(&mut state).await?;
            return Ok(SourceKind::Camera);
        }

        if state.camera.is_none() {
            return Err(MeshError::InvalidState("no local media".to_string()));
        }

        let display = Arc::new(self.devices.acquire_display().await?);
        if let Err(e) = Self::swap(&mut state, &display).await {
            display.stop();
            return Err(e);
        }
        state.screen = Some(display.clone());
        let display_id = display.id();
        info!(
            "Screen share {} active on {} links",
            display_id,
            state.consumers.len()
        );
        Ok(SourceKind::ScreenShare)
    }

    /// Return to the camera if `source_id` is still the active screen share
    pub async fn revert_to_camera(&self, source_id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        match &state.screen {
            Some(screen) if screen.id() == source_id => {
                self.swap_to_camera(&mut state).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn swap_to_camera(&self, state: &mut MediaState) -> Result<()> {
        let camera = state
            .camera
            .clone()
            .ok_or_else(|| MeshError::InvalidState("no local media".to_string()))?;
        Self::swap(state, &camera).await?;
        state.screen = None;
        info!("Reverted to camera on {} links", state.consumers.len());
        Ok(())
    }

    /// Replace the outgoing video on every link with `target`.
    /// On any failure the links already switched are put back.
    async fn swap(state: &mut MediaState, target: &Arc<MediaSource>) -> Result<()> {
        let previous = state
            .outgoing()
            .ok_or_else(|| MeshError::InvalidState("no local media".to_string()))?;

        let mut switched: Vec<&Consumer> = Vec::new();
        for (remote, consumer) in state.consumers.iter() {
            if let Err(e) = consumer
                .connection
                .replace_video_track(target.video().clone())
                .await
            {
                warn!("Track replacement failed on {}: {}, rolling back", remote, e);
                for done in switched {
                    if let Err(e) = done
                        .connection
                        .replace_video_track(done.video_source.video().clone())
                        .await
                    {
                        warn!("Rollback of track replacement failed: {}", e);
                    }
                }
                return Err(e);
            }
            switched.push(consumer);
        }

        // Commit: references follow the tracks
        for consumer in state.consumers.values_mut() {
            target.retain();
            let old = std::mem::replace(&mut consumer.video_source, target.clone());
            old.release();
        }
        target.retain();
        previous.release();
        Ok(())
    }

    /// Detach everything and stop all local sources
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let outgoing = state.outgoing();
        let camera = state.camera.take();
        let screen = state.screen.take();

        for (_, consumer) in state.consumers.drain() {
            consumer.video_source.release();
            if let Some(camera) = &camera {
                camera.release();
            }
        }
        if let Some(preview) = outgoing {
            preview.release();
        }
        if let Some(camera) = &camera {
            camera.release();
            camera.stop();
        }
        if let Some(screen) = &screen {
            screen.stop();
        }
        info!("Local media stopped");
    }

    /// Source currently feeding outgoing video
    pub async fn active_source(&self) -> Option<SourceKind> {
        self.state.lock().await.outgoing().map(|s| s.kind())
    }

    /// Track shown in the local self-preview
    pub async fn preview_track(&self) -> Option<LocalTrack> {
        self.state
            .lock()
            .await
            .outgoing()
            .map(|s| s.video().clone())
    }

    /// Video track currently sent to one link
    pub async fn outgoing_track(&self, remote: &ParticipantId) -> Option<LocalTrack> {
        self.state
            .lock()
            .await
            .consumers
            .get(remote)
            .map(|c| c.video_source.video().clone())
    }

    pub async fn consumer_count(&self) -> usize {
        self.state.lock().await.consumers.len()
    }

    /// Status feed of the active screen share, if any
    pub async fn screen_status(&self) -> Option<(Uuid, watch::Receiver<SourceStatus>)> {
        self.state
            .lock()
            .await
            .screen
            .as_ref()
            .map(|s| (s.id(), s.subscribe_status()))
    }

    pub async fn camera(&self) -> Option<Arc<MediaSource>> {
        self.state.lock().await.camera.clone()
    }
}

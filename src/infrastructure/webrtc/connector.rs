/// WebRTC-backed peer connections
use crate::application::media::{LocalTrack, TrackKind};
use crate::application::negotiation::{
    LinkEvent, LinkEventSender, LinkHealth, PeerConnection, PeerConnector,
};
use crate::config::SessionConfig;
use crate::domain::shared::{MeshError, ParticipantId, Result};
use crate::domain::signaling::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Opens `RTCPeerConnection`s with the default codecs and interceptors
pub struct WebRtcConnector {
    api: API,
    config: RTCConfiguration,
}

impl WebRtcConnector {
    pub fn new(ice_servers: &[String]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api,
            config: RTCConfiguration {
                ice_servers,
                ..Default::default()
            },
        })
    }

    pub fn from_config(config: &SessionConfig) -> Result<Self> {
        Self::new(&config.ice_servers)
    }
}

fn health(state: RTCPeerConnectionState) -> Option<LinkHealth> {
    match state {
        RTCPeerConnectionState::Connecting => Some(LinkHealth::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkHealth::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkHealth::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkHealth::Failed),
        RTCPeerConnectionState::Closed => Some(LinkHealth::Closed),
        _ => None,
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        remote: &ParticipantId,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerConnection>> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        let tx = events.clone();
        let peer = remote.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            let peer = peer.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(LinkEvent::LocalCandidate {
                            remote: peer,
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_m_line_index: init.sdp_mline_index,
                            },
                        });
                    }
                    Err(e) => warn!("Cannot serialize local candidate for {}: {}", peer, e),
                }
            })
        }));

        let tx = events.clone();
        let peer = remote.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("Connection to {} is {}", peer, state);
            if let Some(health) = health(state) {
                let _ = tx.send(LinkEvent::Health {
                    remote: peer.clone(),
                    health,
                });
            }
            Box::pin(async {})
        }));

        let tx = events;
        let peer = remote.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let _ = tx.send(LinkEvent::RemoteTrack {
                remote: peer.clone(),
                stream_id: track.stream_id(),
                track_id: track.id(),
            });
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcPeerConnection {
            remote: remote.clone(),
            pc,
            video_sender: Mutex::new(None),
        }))
    }
}

pub struct WebRtcPeerConnection {
    remote: ParticipantId,
    pc: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn add_tracks(&self, tracks: Vec<LocalTrack>) -> Result<()> {
        for track in tracks {
            let sender = self
                .pc
                .add_track(track.inner() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;

            // RTCP has to be read for interceptors (NACK, reports) to work
            let reader = sender.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while reader.read(&mut buf).await.is_ok() {}
            });

            if track.kind() == TrackKind::Video {
                *self.video_sender.lock().await = Some(sender);
            }
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: LocalTrack) -> Result<()> {
        let sender = self
            .video_sender
            .lock()
            .await
            .clone()
            .ok_or_else(|| MeshError::InvalidState(format!("no video sender to {}", self.remote)))?;
        sender
            .replace_track(Some(track.inner() as Arc<dyn TrackLocal + Send + Sync>))
            .await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        };
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

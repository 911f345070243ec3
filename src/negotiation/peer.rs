//! Peer connection abstraction
//!
//! [`PeerLink`] is the slice of an RTC peer connection the negotiation
//! engine drives. [`RtcPeer`] implements it on top of webrtc-rs; tests use a
//! scripted fake. Connection callbacks are turned into [`PeerEvent`]s on an
//! mpsc channel instead of nested closures.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use super::config::RtcConfig;
use super::media::{LocalMedia, RemoteTrack, TrackKind};
use crate::error::{AppError, Result};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Coarse call quality shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Failed,
}

impl From<ConnectionState> for ConnectionQuality {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::New => ConnectionQuality::Fair,
            ConnectionState::Connecting => ConnectionQuality::Good,
            ConnectionState::Connected => ConnectionQuality::Excellent,
            ConnectionState::Disconnected => ConnectionQuality::Poor,
            ConnectionState::Failed | ConnectionState::Closed => ConnectionQuality::Failed,
        }
    }
}

impl std::fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionQuality::Excellent => write!(f, "excellent"),
            ConnectionQuality::Good => write!(f, "good"),
            ConnectionQuality::Fair => write!(f, "fair"),
            ConnectionQuality::Poor => write!(f, "poor"),
            ConnectionQuality::Failed => write!(f, "failed"),
        }
    }
}

/// Events published by a peer connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered
    LocalCandidate(IceCandidate),
    /// The partner's media arrived
    RemoteTrack(RemoteTrack),
    ConnectionState(ConnectionState),
}

/// Operations the negotiation engine performs on one peer connection
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Bind the local tracks so they are offered to the partner
    async fn attach_local_media(&self, media: &LocalMedia) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Creates peer connections
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Create a connection whose callbacks are published on `events`
    async fn create(
        &self,
        label: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>>;
}

/// Peer factory backed by webrtc-rs
pub struct RtcPeerFactory {
    config: RtcConfig,
}

impl RtcPeerFactory {
    pub fn new(config: RtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        label: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let peer = RtcPeer::new(&self.config, label, events).await?;
        Ok(Arc::new(peer))
    }
}

/// webrtc-rs peer connection
pub struct RtcPeer {
    label: String,
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    /// Create a new peer connection
    pub async fn new(
        config: &RtcConfig,
        label: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers(),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;

        let peer = Self {
            label: label.to_string(),
            pc: Arc::new(pc),
        };
        peer.setup_event_handlers(events);

        info!("Peer connection {} created", peer.label);
        Ok(peer)
    }

    fn setup_event_handlers(&self, events: mpsc::UnboundedSender<PeerEvent>) {
        let state_tx = events.clone();
        let label = self.label.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let new_state = match s {
                    RTCPeerConnectionState::New => Some(ConnectionState::New),
                    RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                    RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                    RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                    _ => None,
                };
                if let Some(new_state) = new_state {
                    info!("Peer {} connection state: {}", label, new_state);
                    let _ = state_tx.send(PeerEvent::ConnectionState(new_state));
                }
                Box::pin(async {})
            }));

        let candidate_tx = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // `None` marks the end of gathering
                if let Some(init) = candidate.and_then(|c| c.to_json().ok()) {
                    debug!("Local ICE candidate: {}", init.candidate);
                    let _ = candidate_tx.send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Box::pin(async {})
            }));

        let track_tx = events;
        let label = self.label.clone();
        self.pc
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    info!("Peer {} received remote {} track", label, kind);
                    let _ = track_tx.send(PeerEvent::RemoteTrack(RemoteTrack {
                        id: track.id().to_string(),
                        kind,
                        stream_id: track.stream_id().to_string(),
                        rtp: Some(track),
                    }));
                }
                Box::pin(async {})
            }));
    }

    fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
        let result = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        };
        result.map_err(|e| AppError::Negotiation(format!("Invalid SDP: {}", e)))
    }
}

#[async_trait]
impl PeerLink for RtcPeer {
    async fn attach_local_media(&self, media: &LocalMedia) -> Result<()> {
        for track in media.tracks() {
            let Some(rtp) = track.rtp() else {
                continue;
            };
            let rtp: Arc<dyn TrackLocal + Send + Sync> = rtp;
            self.pc.add_track(rtp).await.map_err(|e| {
                AppError::WebRtcError(format!("Failed to add {} track: {}", track.kind(), e))
            })?;
            debug!("Peer {} bound local {} track", self.label, track.kind());
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create offer: {}", e)))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let description = Self::to_rtc_description(description)?;
        self.pc.set_local_description(description).await.map_err(|e| {
            AppError::Negotiation(format!("Failed to set local description: {}", e))
        })
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let description = Self::to_rtc_description(description)?;
        self.pc.set_remote_description(description).await.map_err(|e| {
            AppError::Negotiation(format!("Failed to set remote description: {}", e))
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))?;
        info!("Peer connection {} closed", self.label);
        Ok(())
    }
}

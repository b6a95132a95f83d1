// libs/consultation-call-cell/src/services/webrtc_peer.rs
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::NegotiationError;
use crate::models::{ConnectionState, IceCandidate, MediaKind, RemoteTrackInfo, SdpType, SessionDescription};
use crate::services::media::LocalTrack;
use crate::services::negotiator::{PeerConnection, PeerConnector, PeerEvent};

/// Public STUN servers used when no others are configured.
pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Builds webrtc-rs peer connections with default codecs and interceptors.
#[derive(Debug, Clone)]
pub struct WebRtcConnector {
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        let ice_servers = if ice_servers.is_empty() {
            DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            ice_servers
        };
        Self { ice_servers }
    }

    pub fn ice_servers(&self) -> &[String] {
        &self.ice_servers
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

impl Default for WebRtcConnector {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(self.rtc_config()).await?);

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(PeerEvent::LocalCandidate(init.into()));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            } else {
                debug!("ICE candidate gathering completed");
            }
            Box::pin(async {})
        }));

        let track_tx = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                let _ = track_tx.send(PeerEvent::RemoteTrack(RemoteTrackInfo {
                    track_id: track.id(),
                    stream_id: track.stream_id(),
                    kind,
                }));
                Box::pin(async {})
            },
        ));

        let state_tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!("Peer connection state changed to: {}", state);
            if let Some(state) = normalize_state(state) {
                let _ = state_tx.send(PeerEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        info!("Created webrtc peer connection ({} ICE servers)", self.ice_servers.len());
        Ok(Arc::new(WebRtcPeer { pc }))
    }
}

/// `None` for states with no counterpart (unspecified).
pub fn normalize_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcPeer {
    async fn local_description(&self, sdp_type: SdpType) -> Result<SessionDescription, NegotiationError> {
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| NegotiationError::DescriptionRejected {
                message: "no local description after negotiation step".to_string(),
            })?;

        Ok(SessionDescription {
            sdp_type,
            sdp: local.sdp,
        })
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn attach_track(&self, track: LocalTrack) -> Result<(), NegotiationError> {
        let sender = self
            .pc
            .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be read for interceptors (NACK, reports) to run.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
        });

        debug!("Attached local {:?} track {}", track.kind(), track.id());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| NegotiationError::DescriptionRejected {
                message: e.to_string(),
            })?;

        self.local_description(SdpType::Offer).await
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| NegotiationError::DescriptionRejected {
                message: e.to_string(),
            })?;

        self.local_description(SdpType::Answer).await
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), NegotiationError> {
        let parsed = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| NegotiationError::InvalidDescription {
            message: e.to_string(),
        })?;

        self.pc
            .set_remote_description(parsed)
            .await
            .map_err(|e| NegotiationError::DescriptionRejected {
                message: e.to_string(),
            })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| NegotiationError::CandidateRejected {
                message: e.to_string(),
            })
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await?;
        Ok(())
    }
}

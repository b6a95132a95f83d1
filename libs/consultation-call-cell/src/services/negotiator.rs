// libs/consultation-call-cell/src/services/negotiator.rs
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{CallError, NegotiationError};
use crate::models::{
    ConnectionState, IceCandidate, RemoteTrackInfo, SdpType, SessionDescription, SignalEnvelope,
};
use crate::services::media::{LocalMediaHandle, LocalTrack};
use crate::services::signaling::SignalSender;

/// Raw observations reported by a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrackInfo),
    StateChanged(ConnectionState),
}

/// What the negotiator reports upward after normalising peer events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiatorEvent {
    RemoteJoined(RemoteTrackInfo),
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// The underlying connection. Offer/answer creation also sets the local
/// description.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn attach_track(&self, track: LocalTrack) -> Result<(), NegotiationError>;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Builds connections; observers report through `events`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

/// Owns exactly one peer connection per call attempt and drives it through
/// offer/answer negotiation.
pub struct Negotiator {
    local_id: Uuid,
    connection: Arc<dyn PeerConnection>,
    signals: SignalSender,
    pending_candidates: VecDeque<IceCandidate>,
    remote_description_set: bool,
    offer_sent: bool,
    state: ConnectionState,
    connected_fired: bool,
    disconnected_fired: bool,
    remote_tracks: Vec<RemoteTrackInfo>,
    closed: bool,
}

impl Negotiator {
    /// Opens a connection through `connector` and attaches every local track.
    pub async fn create(
        connector: &dyn PeerConnector,
        local_media: &LocalMediaHandle,
        signals: SignalSender,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), NegotiationError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = connector.connect(events_tx).await?;

        for track in local_media.tracks() {
            if let Err(e) = connection.attach_track(track.clone()).await {
                let _ = connection.close().await;
                return Err(e);
            }
        }
        info!(
            "Peer connection created for {} with {} local tracks",
            signals.local_id(),
            local_media.tracks().len()
        );

        Ok((Self::with_connection(connection, signals), events_rx))
    }

    pub fn with_connection(connection: Arc<dyn PeerConnection>, signals: SignalSender) -> Self {
        Self {
            local_id: signals.local_id(),
            connection,
            signals,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
            offer_sent: false,
            state: ConnectionState::New,
            connected_fired: false,
            disconnected_fired: false,
            remote_tracks: Vec::new(),
            closed: false,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn offer_sent(&self) -> bool {
        self.offer_sent
    }

    pub fn remote_tracks(&self) -> &[RemoteTrackInfo] {
        &self.remote_tracks
    }

    /// Builds and broadcasts the single offer of this attempt. A second call
    /// is a no-op.
    #[instrument(skip(self), fields(local_id = %self.local_id))]
    pub async fn make_offer(&mut self) -> Result<(), CallError> {
        self.ensure_open()?;
        if self.offer_sent {
            debug!("Offer already sent for this attempt");
            return Ok(());
        }

        let offer = self.connection.create_offer().await?;
        self.offer_sent = true;
        self.signals
            .send(&SignalEnvelope::Offer {
                sender_id: self.local_id,
                sdp: offer,
            })
            .await?;

        info!("Offer sent");
        Ok(())
    }

    /// Applies a remote offer and replies with an answer.
    #[instrument(skip(self, description), fields(local_id = %self.local_id))]
    pub async fn handle_offer(
        &mut self,
        sender_id: Uuid,
        description: SessionDescription,
    ) -> Result<(), CallError> {
        if sender_id == self.local_id {
            debug!("Ignoring own offer");
            return Ok(());
        }
        self.ensure_open()?;
        if description.sdp_type != SdpType::Offer {
            return Err(NegotiationError::InvalidDescription {
                message: "expected an offer".to_string(),
            }
            .into());
        }
        if self.remote_description_set {
            warn!("Repeated offer from {} ignored", sender_id);
            return Ok(());
        }

        self.apply_remote_description(description).await?;

        let answer = self.connection.create_answer().await?;
        self.signals
            .send(&SignalEnvelope::Answer {
                sender_id: self.local_id,
                sdp: answer,
            })
            .await?;

        info!("Answer sent to {}", sender_id);
        Ok(())
    }

    /// Applies the remote answer. Nothing is sent back.
    #[instrument(skip(self, description), fields(local_id = %self.local_id))]
    pub async fn handle_answer(
        &mut self,
        sender_id: Uuid,
        description: SessionDescription,
    ) -> Result<(), CallError> {
        if sender_id == self.local_id {
            debug!("Ignoring own answer");
            return Ok(());
        }
        self.ensure_open()?;
        if description.sdp_type != SdpType::Answer {
            return Err(NegotiationError::InvalidDescription {
                message: "expected an answer".to_string(),
            }
            .into());
        }
        if !self.offer_sent {
            warn!("Answer from {} without a pending offer ignored", sender_id);
            return Ok(());
        }
        if self.remote_description_set {
            warn!("Duplicate answer from {} ignored", sender_id);
            return Ok(());
        }

        self.apply_remote_description(description).await?;
        info!("Answer from {} applied", sender_id);
        Ok(())
    }

    /// Applies the candidate now if a remote description exists, otherwise
    /// queues it. Individual candidate failures are logged, never fatal.
    pub async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.closed {
            debug!("Connection closed, dropping remote candidate");
            return;
        }

        if !self.remote_description_set {
            debug!(
                "Remote description not set yet, queuing candidate ({} pending)",
                self.pending_candidates.len() + 1
            );
            self.pending_candidates.push_back(candidate);
            return;
        }

        self.apply_candidate(candidate).await;
    }

    /// Broadcasts local candidates, collects remote tracks and normalises
    /// state changes.
    pub async fn handle_peer_event(&mut self, event: PeerEvent) -> Result<Vec<NegotiatorEvent>, CallError> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if self.closed {
                    return Ok(Vec::new());
                }
                self.signals
                    .send(&SignalEnvelope::IceCandidate {
                        sender_id: self.local_id,
                        candidate,
                    })
                    .await?;
                Ok(Vec::new())
            }
            PeerEvent::RemoteTrack(track) => {
                if self.remote_tracks.iter().any(|t| t.track_id == track.track_id) {
                    return Ok(Vec::new());
                }
                info!("Remote {:?} track {} arrived", track.kind, track.track_id);
                self.remote_tracks.push(track.clone());
                Ok(vec![NegotiatorEvent::RemoteJoined(track)])
            }
            PeerEvent::StateChanged(next) => Ok(self.transition(next)),
        }
    }

    /// Closes the connection and drops anything still queued. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending_candidates.clear();

        if let Err(e) = self.connection.close().await {
            warn!("Error while closing peer connection: {}", e);
        }
        if !self.state.is_terminal() {
            self.state = ConnectionState::Closed;
        }
        info!("Peer connection for {} closed", self.local_id);
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed {
            Err(NegotiationError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    async fn apply_remote_description(&mut self, description: SessionDescription) -> Result<(), NegotiationError> {
        self.connection.set_remote_description(description).await?;
        self.remote_description_set = true;

        let pending = self.pending_candidates.len();
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(candidate).await;
        }
        if pending > 0 {
            debug!("Drained {} buffered candidates", pending);
        }
        Ok(())
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            warn!("Failed to apply remote candidate: {}", e);
        }
    }

    fn transition(&mut self, next: ConnectionState) -> Vec<NegotiatorEvent> {
        if self.state.is_terminal() || next == self.state {
            return Vec::new();
        }
        debug!("Connection state {:?} -> {:?}", self.state, next);
        self.state = next;

        let mut events = Vec::new();
        match next {
            ConnectionState::Connected => {
                if !self.connected_fired {
                    self.connected_fired = true;
                    events.push(NegotiatorEvent::Connected);
                }
            }
            ConnectionState::Disconnected => {
                if !self.disconnected_fired {
                    self.disconnected_fired = true;
                    events.push(NegotiatorEvent::Disconnected);
                }
            }
            ConnectionState::Failed => {
                if !self.disconnected_fired {
                    self.disconnected_fired = true;
                    events.push(NegotiatorEvent::Disconnected);
                }
                events.push(NegotiatorEvent::Failed);
            }
            ConnectionState::Closed => events.push(NegotiatorEvent::Closed),
            ConnectionState::New | ConnectionState::Connecting => {}
        }
        events
    }
}

// libs/consultation-call-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::CallFailure;

// ==============================================================================
// CONSULTATION SESSION
// ==============================================================================

/// One participant's view of a consultation. Both parties share `session_id`;
/// the role assignment is made by the caller and must be unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsultationSession {
    pub session_id: Uuid,
    pub participant_id: Uuid,
    pub role: ParticipantRole,
}

impl ConsultationSession {
    pub fn new(session_id: Uuid, participant_id: Uuid, role: ParticipantRole) -> Self {
        Self {
            session_id,
            participant_id,
            role,
        }
    }

    /// Relay topic for this consultation, e.g. `consultation:{session_id}`.
    pub fn topic(&self, prefix: &str) -> String {
        format!("{}:{}", prefix, self.session_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Initiator,
    Responder,
}

// ==============================================================================
// SIGNALING WIRE FORMAT
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network-path candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    #[default]
    Joined,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Presence,
    Offer,
    Answer,
    IceCandidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalKind::Presence => "presence",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        };
        f.write_str(name)
    }
}

/// A message on the consultation topic. Transient, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalEnvelope {
    Presence {
        #[serde(rename = "senderId")]
        sender_id: Uuid,
        #[serde(default)]
        state: PresenceState,
    },
    Offer {
        #[serde(rename = "senderId")]
        sender_id: Uuid,
        sdp: SessionDescription,
    },
    Answer {
        #[serde(rename = "senderId")]
        sender_id: Uuid,
        sdp: SessionDescription,
    },
    IceCandidate {
        #[serde(rename = "senderId")]
        sender_id: Uuid,
        candidate: IceCandidate,
    },
}

impl SignalEnvelope {
    pub fn joined(sender_id: Uuid) -> Self {
        SignalEnvelope::Presence {
            sender_id,
            state: PresenceState::Joined,
        }
    }

    pub fn left(sender_id: Uuid) -> Self {
        SignalEnvelope::Presence {
            sender_id,
            state: PresenceState::Left,
        }
    }

    pub fn sender_id(&self) -> Uuid {
        match self {
            SignalEnvelope::Presence { sender_id, .. }
            | SignalEnvelope::Offer { sender_id, .. }
            | SignalEnvelope::Answer { sender_id, .. }
            | SignalEnvelope::IceCandidate { sender_id, .. } => *sender_id,
        }
    }

    pub fn kind(&self) -> SignalKind {
        match self {
            SignalEnvelope::Presence { .. } => SignalKind::Presence,
            SignalEnvelope::Offer { .. } => SignalKind::Offer,
            SignalEnvelope::Answer { .. } => SignalKind::Answer,
            SignalEnvelope::IceCandidate { .. } => SignalKind::IceCandidate,
        }
    }
}

// ==============================================================================
// CONNECTION AND CALL STATE
// ==============================================================================

/// Normalised peer connection state.
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

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// A track received from the remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub track_id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    AcquiringMedia,
    WaitingRoom,
    Connecting,
    InCall,
    Ended,
    Error(CallFailure),
}

impl CallState {
    pub fn name(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::AcquiringMedia => "acquiring-media",
            CallState::WaitingRoom => "waiting-room",
            CallState::Connecting => "connecting",
            CallState::InCall => "in-call",
            CallState::Ended => "ended",
            CallState::Error(_) => "error",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Events published to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    StateChanged(CallState),
    RemoteJoined(RemoteTrackInfo),
    Connected,
    Disconnected,
    RemoteLeft,
    Ended(CallSummary),
}

// ==============================================================================
// SESSION RECORDS
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndStatus {
    /// The call was connected at least once.
    Completed,
    /// Left before the peers ever connected.
    Cancelled,
    /// The connection failed.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantJoined {
    pub session_id: Uuid,
    pub participant_id: Uuid,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnded {
    pub session_id: Uuid,
    pub participant_id: Uuid,
    pub status: EndStatus,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    pub status: EndStatus,
    pub duration_seconds: i64,
}

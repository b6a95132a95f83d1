// libs/consultation-call-cell/src/error.rs
use serde::{Deserialize, Serialize};
use thiserror::Error;

use shared_models::error::AppError;

/// Local device failures. These never cross the signaling channel.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaError {
    #[error("Camera or microphone access was denied")]
    PermissionDenied,

    #[error("No camera or microphone was found")]
    DeviceNotFound,

    #[error("Capture device is unavailable: {message}")]
    DeviceUnavailable { message: String },
}

impl MediaError {
    pub fn kind(&self) -> &'static str {
        match self {
            MediaError::PermissionDenied => "permission_denied",
            MediaError::DeviceNotFound => "device_not_found",
            MediaError::DeviceUnavailable { .. } => "device_unavailable",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Failed to subscribe to {topic}: {message}")]
    SubscribeFailed { topic: String, message: String },

    #[error("Failed to publish signaling envelope: {message}")]
    SendFailed { message: String },

    #[error("Signaling channel is closed")]
    ChannelClosed,
}

impl From<redis::RedisError> for SignalingError {
    fn from(err: redis::RedisError) -> Self {
        SignalingError::SendFailed {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        SignalingError::SendFailed {
            message: format!("Envelope serialization failed: {}", err),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Malformed or unsupported session description: {message}")]
    InvalidDescription { message: String },

    #[error("Session description was rejected: {message}")]
    DescriptionRejected { message: String },

    #[error("ICE candidate was rejected: {message}")]
    CandidateRejected { message: String },

    #[error("Peer connection is already closed")]
    ConnectionClosed,

    #[error("Peer transport error: {message}")]
    Transport { message: String },
}

impl From<webrtc::Error> for NegotiationError {
    fn from(err: webrtc::Error) -> Self {
        match err {
            webrtc::Error::ErrConnectionClosed => NegotiationError::ConnectionClosed,
            other => NegotiationError::Transport {
                message: other.to_string(),
            },
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordSinkError {
    #[error("Session record write failed: {message}")]
    DatabaseError { message: String },

    #[error("Session record sink not configured")]
    NotConfigured,
}

impl From<anyhow::Error> for RecordSinkError {
    fn from(err: anyhow::Error) -> Self {
        RecordSinkError::DatabaseError {
            message: err.to_string(),
        }
    }
}

/// Failure carried by `CallState::Error`. Cloneable so it can live in the
/// observable state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    #[error(transparent)]
    Media(MediaError),

    #[error(transparent)]
    Signaling(SignalingError),

    #[error(transparent)]
    Negotiation(NegotiationError),

    #[error("Peer connection failed")]
    ConnectionFailed,
}

/// Errors returned by the call intents.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Peer connection failed")]
    ConnectionFailed,

    #[error("Cannot {intent} while {state}")]
    InvalidTransition { intent: &'static str, state: String },

    #[error("Media acquisition was cancelled")]
    Cancelled,

    #[error("Call session has shut down")]
    SessionClosed,
}

impl From<CallFailure> for CallError {
    fn from(failure: CallFailure) -> Self {
        match failure {
            CallFailure::Media(e) => CallError::Media(e),
            CallFailure::Signaling(e) => CallError::Signaling(e),
            CallFailure::Negotiation(e) => CallError::Negotiation(e),
            CallFailure::ConnectionFailed => CallError::ConnectionFailed,
        }
    }
}

impl From<CallError> for AppError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::InvalidTransition { .. } => AppError::Conflict(err.to_string()),
            CallError::Media(_) => AppError::BadRequest(err.to_string()),
            CallError::Signaling(_) => AppError::ExternalService(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

// libs/consultation-call-cell/src/services/record_sink.rs
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

use crate::error::RecordSinkError;
use crate::models::{ParticipantJoined, SessionEnded};

/// Durable store for session status. Written at exactly two points: when a
/// participant joins and when the call ends.
#[async_trait]
pub trait SessionRecordSink: Send + Sync {
    async fn participant_joined(&self, record: ParticipantJoined) -> Result<(), RecordSinkError>;

    async fn session_ended(&self, record: SessionEnded) -> Result<(), RecordSinkError>;
}

/// Writes session records to the hosted Supabase tables.
pub struct SupabaseRecordSink {
    supabase: Arc<SupabaseClient>,
    auth_token: String,
}

impl SupabaseRecordSink {
    pub fn new(config: &AppConfig, auth_token: impl Into<String>) -> Result<Self, RecordSinkError> {
        if !config.is_configured() {
            return Err(RecordSinkError::NotConfigured);
        }

        Ok(Self {
            supabase: Arc::new(SupabaseClient::new(config)),
            auth_token: auth_token.into(),
        })
    }
}

#[async_trait]
impl SessionRecordSink for SupabaseRecordSink {
    async fn participant_joined(&self, record: ParticipantJoined) -> Result<(), RecordSinkError> {
        let path = "/rest/v1/video_session_participants";
        let body = json!({
            "session_id": record.session_id,
            "user_id": record.participant_id,
            "role": record.role,
            "joined_at": record.joined_at,
        });

        let _: Vec<Value> = self
            .supabase
            .request(Method::POST, path, Some(&self.auth_token), Some(body))
            .await
            .map_err(|e| RecordSinkError::DatabaseError {
                message: format!("Failed to record participant join: {}", e),
            })?;

        debug!(
            "Recorded participant {} joining session {}",
            record.participant_id, record.session_id
        );
        Ok(())
    }

    async fn session_ended(&self, record: SessionEnded) -> Result<(), RecordSinkError> {
        let path = format!("/rest/v1/video_sessions?id=eq.{}", record.session_id);
        let body = json!({
            "status": record.status,
            "actual_end_time": record.ended_at,
            "session_duration_seconds": record.duration_seconds,
            "updated_at": Utc::now(),
        });

        let _: Vec<Value> = self
            .supabase
            .request(Method::PATCH, &path, Some(&self.auth_token), Some(body))
            .await
            .map_err(|e| RecordSinkError::DatabaseError {
                message: format!("Failed to record session end: {}", e),
            })?;

        info!(
            "Recorded end of session {} ({:?}, {}s)",
            record.session_id, record.status, record.duration_seconds
        );
        Ok(())
    }
}

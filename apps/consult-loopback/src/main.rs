use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dotenv::dotenv;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use webrtc::media::Sample;

use consultation_call_cell::{
    CallDependencies, CallEvent, CallSession, CallSettings, CallState, ConsultationSession,
    InMemoryRelay, MediaKind, ParticipantJoined, ParticipantRole, RecordSinkError, RedisRelay,
    SampleTrackDevices, SessionEnded, SessionRecordSink, SignalingRelay, SupabaseRecordSink,
    WebRtcConnector,
};
use shared_config::AppConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CALL_LENGTH: Duration = Duration::from_secs(5);
const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Used when Supabase is not configured.
struct LogRecordSink;

#[async_trait]
impl SessionRecordSink for LogRecordSink {
    async fn participant_joined(&self, record: ParticipantJoined) -> Result<(), RecordSinkError> {
        info!(
            "[record] {:?} {} joined session {} at {}",
            record.role, record.participant_id, record.session_id, record.joined_at
        );
        Ok(())
    }

    async fn session_ended(&self, record: SessionEnded) -> Result<(), RecordSinkError> {
        info!(
            "[record] session {} ended by {} ({:?}, {}s)",
            record.session_id, record.participant_id, record.status, record.duration_seconds
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,webrtc=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting consultation loopback");

    let config = AppConfig::from_env();

    let relay: Arc<dyn SignalingRelay> = if config.is_signaling_relay_configured() {
        Arc::new(RedisRelay::new(&config).await?)
    } else {
        info!("REDIS_URL not set, signaling through the in-memory relay");
        Arc::new(InMemoryRelay::new())
    };

    let sink: Arc<dyn SessionRecordSink> = match SupabaseRecordSink::new(&config, config.supabase_anon_key.clone()) {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            warn!("{}, logging session records instead", e);
            Arc::new(LogRecordSink)
        }
    };

    let deps = CallDependencies {
        media: Arc::new(SampleTrackDevices::new()),
        relay,
        connector: Arc::new(WebRtcConnector::new(config.ice_server_urls.clone())),
        sink,
    };
    let settings = CallSettings::from_config(&config);

    let session_id = Uuid::new_v4();
    let doctor = CallSession::spawn(
        ConsultationSession::new(session_id, Uuid::new_v4(), ParticipantRole::Initiator),
        settings.clone(),
        deps.clone(),
    );
    let patient = CallSession::spawn(
        ConsultationSession::new(session_id, Uuid::new_v4(), ParticipantRole::Responder),
        settings,
        deps,
    );

    tokio::spawn(log_events("doctor", doctor.clone()));
    tokio::spawn(log_events("patient", patient.clone()));

    doctor.preview().await?;
    patient.preview().await?;
    feed_samples(&doctor);
    feed_samples(&patient);

    doctor.join().await?;
    patient.join().await?;

    timeout(CONNECT_TIMEOUT, async {
        tokio::try_join!(wait_in_call(&doctor), wait_in_call(&patient))
    })
    .await
    .map_err(|_| anyhow!("participants did not connect within {:?}", CONNECT_TIMEOUT))??;

    info!("Both participants in call, holding for {:?}", CALL_LENGTH);
    tokio::time::sleep(CALL_LENGTH).await;

    info!("Patient muting microphone: audio enabled = {}", patient.toggle_audio().await?);
    tokio::time::sleep(Duration::from_secs(1)).await;

    doctor.leave().await?;
    let mut patient_state = patient.watch_state();
    let _ = timeout(Duration::from_secs(5), patient_state.wait_for(|s| *s == CallState::Ended)).await;
    patient.leave().await?;

    info!(
        "Loopback finished: doctor {}, patient {}",
        doctor.current_state(),
        patient.current_state()
    );
    Ok(())
}

async fn wait_in_call(call: &CallSession) -> Result<()> {
    let mut state = call.watch_state();
    let reached = state
        .wait_for(|s| matches!(s, CallState::InCall | CallState::Ended | CallState::Error(_)))
        .await?
        .clone();
    match reached {
        CallState::InCall => Ok(()),
        other => Err(anyhow!("call stopped in state {}", other)),
    }
}

async fn log_events(label: &'static str, call: CallSession) {
    let mut events = call.subscribe();
    while let Ok(event) = events.recv().await {
        match event {
            CallEvent::RemoteJoined(track) => info!("[{}] remote {:?} track {}", label, track.kind, track.track_id),
            CallEvent::Ended(summary) => {
                info!("[{}] call ended: {:?} after {}s", label, summary.status, summary.duration_seconds);
                break;
            }
            other => info!("[{}] {:?}", label, other),
        }
    }
}

/// Writes silent frames to the local tracks until the media is released.
fn feed_samples(call: &CallSession) {
    let Some(media) = call.local_media() else {
        return;
    };

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME_INTERVAL);
        while !media.is_released() {
            ticker.tick().await;
            for track in media.tracks() {
                let data = match track.kind() {
                    MediaKind::Audio => Bytes::from_static(&[0xf8, 0xff, 0xfe]),
                    MediaKind::Video => Bytes::from_static(&[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a]),
                };
                let sample = Sample {
                    data,
                    duration: FRAME_INTERVAL,
                    ..Default::default()
                };
                if track.write_sample(&sample).await.is_err() {
                    return;
                }
            }
        }
    });
}

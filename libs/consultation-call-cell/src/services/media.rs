// libs/consultation-call-cell/src/services/media.rs
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::MediaError;
use crate::models::MediaKind;

/// Capture hints passed to the device layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            width: 1280,
            height: 720,
            frame_rate: 30,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Request-for-access capability of the host runtime.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaHandle, MediaError>;
}

struct TrackInner {
    kind: MediaKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtc_track: Arc<TrackLocalStaticSample>,
}

/// One captured track. Clones share the same flags.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, rtc_track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                kind,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                rtc_track,
            }),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn id(&self) -> &str {
        self.inner.rtc_track.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.rtc_track.clone()
    }

    /// Pushes one encoded sample. Returns `false` when the track is muted and
    /// the sample was dropped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, MediaError> {
        if self.is_stopped() {
            return Err(MediaError::DeviceUnavailable {
                message: format!("track {} has been released", self.id()),
            });
        }
        if !self.is_enabled() {
            return Ok(false);
        }

        self.inner
            .rtc_track
            .write_sample(sample)
            .await
            .map_err(|e| MediaError::DeviceUnavailable {
                message: e.to_string(),
            })?;
        Ok(true)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// The captured camera/microphone stream. Media acquisition owns its
/// lifecycle; the negotiator only attaches its tracks.
#[derive(Debug, Clone)]
pub struct LocalMediaHandle {
    stream_id: String,
    constraints: MediaConstraints,
    tracks: Vec<LocalTrack>,
    released: Arc<AtomicBool>,
}

impl LocalMediaHandle {
    pub fn new(stream_id: impl Into<String>, constraints: MediaConstraints, tracks: Vec<LocalTrack>) -> Self {
        Self {
            stream_id: stream_id.into(),
            constraints,
            tracks,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn constraints(&self) -> &MediaConstraints {
        &self.constraints
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn audio_enabled(&self) -> bool {
        self.kind_enabled(MediaKind::Audio)
    }

    pub fn video_enabled(&self) -> bool {
        self.kind_enabled(MediaKind::Video)
    }

    /// Flips the microphone flag and returns the new value.
    pub fn toggle_audio(&self) -> bool {
        self.toggle(MediaKind::Audio)
    }

    /// Flips the camera flag and returns the new value.
    pub fn toggle_video(&self) -> bool {
        self.toggle(MediaKind::Video)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Stops every track. Safe to call more than once.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for track in &self.tracks {
            track.stop();
        }
        info!("Released local media stream {}", self.stream_id);
    }

    fn kind_enabled(&self, kind: MediaKind) -> bool {
        self.tracks
            .iter()
            .filter(|t| t.kind() == kind)
            .any(|t| t.is_enabled())
    }

    fn toggle(&self, kind: MediaKind) -> bool {
        let enabled = !self.kind_enabled(kind);
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
        debug!("{:?} tracks of {} now enabled={}", kind, self.stream_id, enabled);
        enabled
    }
}

/// Device layer backed by webrtc-rs sample tracks; the host feeds encoded
/// frames through `LocalTrack::write_sample`.
#[derive(Debug, Clone)]
pub struct SampleTrackDevices {
    has_microphone: bool,
    has_camera: bool,
}

impl SampleTrackDevices {
    pub fn new() -> Self {
        Self {
            has_microphone: true,
            has_camera: true,
        }
    }

    pub fn without_camera(mut self) -> Self {
        self.has_camera = false;
        self
    }

    pub fn without_microphone(mut self) -> Self {
        self.has_microphone = false;
        self
    }

    fn audio_track(stream_id: &str) -> LocalTrack {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            format!("audio-{}", stream_id),
            stream_id.to_string(),
        );
        LocalTrack::new(MediaKind::Audio, Arc::new(track))
    }

    fn video_track(stream_id: &str) -> LocalTrack {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("video-{}", stream_id),
            stream_id.to_string(),
        );
        LocalTrack::new(MediaKind::Video, Arc::new(track))
    }
}

impl Default for SampleTrackDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SampleTrackDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaHandle, MediaError> {
        if (constraints.audio && !self.has_microphone) || (constraints.video && !self.has_camera) {
            return Err(MediaError::DeviceNotFound);
        }
        if !constraints.audio && !constraints.video {
            return Err(MediaError::DeviceUnavailable {
                message: "neither audio nor video was requested".to_string(),
            });
        }

        let stream_id = format!("local-{}", Uuid::new_v4());
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Self::audio_track(&stream_id));
        }
        if constraints.video {
            tracks.push(Self::video_track(&stream_id));
        }

        info!(
            "Acquired local media {} ({} tracks, {}x{}@{})",
            stream_id,
            tracks.len(),
            constraints.width,
            constraints.height,
            constraints.frame_rate
        );

        Ok(LocalMediaHandle::new(stream_id, constraints.clone(), tracks))
    }
}

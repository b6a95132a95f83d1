// libs/consultation-call-cell/tests/common/mod.rs
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use consultation_call_cell::{
    CallDependencies, CallSession, CallSettings, CallState, ConnectionState, ConsultationSession,
    IceCandidate, InMemoryRelay, LocalMediaHandle, LocalTrack, MediaConstraints, MediaDevices,
    MediaError, MediaKind, NegotiationError, ParticipantJoined, ParticipantRole, PeerConnection,
    PeerConnector, PeerEvent, RecordSinkError, RemoteTrackInfo, SampleTrackDevices, SdpType,
    SessionDescription, SessionEnded, SessionRecordSink,
};
use shared_utils::test_utils::{TestConfig, TestConsultation};

pub const WAIT: Duration = Duration::from_secs(5);

// ==============================================================================
// PEER CONNECTION
// ==============================================================================

#[derive(Default)]
struct FakePeerState {
    local_set: bool,
    remote_set: bool,
    attached: Vec<MediaKind>,
    applied_candidates: Vec<String>,
    early_candidates: usize,
    offers_created: usize,
    answers_created: usize,
    negotiated: bool,
    closed: bool,
}

/// Stands in for a real peer connection. Candidates added before a remote
/// description are rejected and counted, and the connection comes up once
/// both descriptions are in place.
pub struct FakePeer {
    label: String,
    auto_connect: bool,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<FakePeerState>,
}

impl FakePeer {
    /// Feeds a raw connection state change, as the network would.
    pub fn inject(&self, state: ConnectionState) {
        let _ = self.events.send(PeerEvent::StateChanged(state));
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().unwrap().offers_created
    }

    pub fn answers_created(&self) -> usize {
        self.state.lock().unwrap().answers_created
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().unwrap().applied_candidates.clone()
    }

    pub fn early_candidates(&self) -> usize {
        self.state.lock().unwrap().early_candidates
    }

    pub fn attached(&self) -> Vec<MediaKind> {
        self.state.lock().unwrap().attached.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn local_candidate(&self) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:{} 1 udp 2130706431 127.0.0.1 50000 typ host",
            self.label
        ))
    }

    fn maybe_connect(&self, state: &mut FakePeerState) {
        if state.negotiated || !state.local_set || !state.remote_set {
            return;
        }
        state.negotiated = true;

        for kind in [MediaKind::Audio, MediaKind::Video] {
            let _ = self.events.send(PeerEvent::RemoteTrack(RemoteTrackInfo {
                track_id: format!("{:?}-from-{}", kind, self.label).to_lowercase(),
                stream_id: format!("stream-{}", self.label),
                kind,
            }));
        }
        let _ = self.events.send(PeerEvent::StateChanged(ConnectionState::Connecting));
        if self.auto_connect {
            let _ = self.events.send(PeerEvent::StateChanged(ConnectionState::Connected));
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn attach_track(&self, track: LocalTrack) -> Result<(), NegotiationError> {
        self.state.lock().unwrap().attached.push(track.kind());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let mut state = self.state.lock().unwrap();
        state.offers_created += 1;
        state.local_set = true;
        let _ = self.events.send(PeerEvent::LocalCandidate(self.local_candidate()));
        self.maybe_connect(&mut state);
        Ok(SessionDescription::offer(format!("v=0 offer from {}", self.label)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let mut state = self.state.lock().unwrap();
        if !state.remote_set {
            return Err(NegotiationError::DescriptionRejected {
                message: "answer without remote offer".to_string(),
            });
        }
        state.answers_created += 1;
        state.local_set = true;
        let _ = self.events.send(PeerEvent::LocalCandidate(self.local_candidate()));
        self.maybe_connect(&mut state);
        Ok(SessionDescription::answer(format!("v=0 answer from {}", self.label)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), NegotiationError> {
        if description.sdp.contains("malformed") {
            return Err(NegotiationError::InvalidDescription {
                message: "unparseable sdp".to_string(),
            });
        }
        let mut state = self.state.lock().unwrap();
        if description.sdp_type == SdpType::Answer && !state.local_set {
            return Err(NegotiationError::DescriptionRejected {
                message: "answer without local offer".to_string(),
            });
        }
        state.remote_set = true;
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut state = self.state.lock().unwrap();
        if !state.remote_set {
            state.early_candidates += 1;
            return Err(NegotiationError::CandidateRejected {
                message: "remote description not set".to_string(),
            });
        }
        state.applied_candidates.push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

/// Hands out `FakePeer`s and keeps them for inspection.
pub struct FakeConnector {
    label: String,
    auto_connect: bool,
    fail: AtomicBool,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakeConnector {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            auto_connect: true,
            fail: AtomicBool::new(false),
            peers: Mutex::new(Vec::new()),
        })
    }

    /// Peers stop at `connecting` until a state is injected.
    pub fn manual(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            auto_connect: false,
            fail: AtomicBool::new(false),
            peers: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_connects(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn last_peer(&self) -> Arc<FakePeer> {
        self.peers().last().cloned().expect("no peer connection created")
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(NegotiationError::Transport {
                message: "no network".to_string(),
            });
        }
        let peer = Arc::new(FakePeer {
            label: self.label.clone(),
            auto_connect: self.auto_connect,
            events,
            state: Mutex::new(FakePeerState::default()),
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

// ==============================================================================
// MEDIA
// ==============================================================================

/// Device layer with scripted failures and delays. Keeps every handle it
/// issued so tests can check they were released.
pub struct ScriptedDevices {
    failure: Option<MediaError>,
    delay: Duration,
    issued: Mutex<Vec<LocalMediaHandle>>,
    calls: AtomicUsize,
}

impl ScriptedDevices {
    pub fn working() -> Arc<Self> {
        Arc::new(Self {
            failure: None,
            delay: Duration::ZERO,
            issued: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing(error: MediaError) -> Arc<Self> {
        Arc::new(Self {
            failure: Some(error),
            delay: Duration::ZERO,
            issued: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            failure: None,
            delay,
            issued: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn issued(&self) -> Vec<LocalMediaHandle> {
        self.issued.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for ScriptedDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaHandle, MediaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let media = SampleTrackDevices::new().acquire(constraints).await?;
        self.issued.lock().unwrap().push(media.clone());
        Ok(media)
    }
}

// ==============================================================================
// RECORD SINK
// ==============================================================================

#[derive(Default)]
pub struct RecordingSink {
    joined: Mutex<Vec<ParticipantJoined>>,
    ended: Mutex<Vec<SessionEnded>>,
    fail: AtomicBool,
    stall: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unreachable() -> Arc<Self> {
        let sink = Self::default();
        sink.fail.store(true, Ordering::SeqCst);
        Arc::new(sink)
    }

    /// Records every write, then never answers.
    pub fn stalled() -> Arc<Self> {
        let sink = Self::default();
        sink.stall.store(true, Ordering::SeqCst);
        Arc::new(sink)
    }

    async fn respond(&self) -> Result<(), RecordSinkError> {
        if self.stall.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(RecordSinkError::DatabaseError {
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    pub fn joined(&self) -> Vec<ParticipantJoined> {
        self.joined.lock().unwrap().clone()
    }

    pub fn ended(&self) -> Vec<SessionEnded> {
        self.ended.lock().unwrap().clone()
    }

    pub fn ended_for(&self, participant_id: Uuid) -> Vec<SessionEnded> {
        self.ended()
            .into_iter()
            .filter(|r| r.participant_id == participant_id)
            .collect()
    }
}

#[async_trait]
impl SessionRecordSink for RecordingSink {
    async fn participant_joined(&self, record: ParticipantJoined) -> Result<(), RecordSinkError> {
        self.joined.lock().unwrap().push(record);
        self.respond().await
    }

    async fn session_ended(&self, record: SessionEnded) -> Result<(), RecordSinkError> {
        self.ended.lock().unwrap().push(record);
        self.respond().await
    }
}

// ==============================================================================
// HARNESS
// ==============================================================================

pub struct Participant {
    pub call: CallSession,
    pub connector: Arc<FakeConnector>,
    pub devices: Arc<ScriptedDevices>,
}

impl Participant {
    pub fn id(&self) -> Uuid {
        self.call.session().participant_id
    }

    pub fn peer(&self) -> Arc<FakePeer> {
        self.connector.last_peer()
    }
}

pub fn settings() -> CallSettings {
    CallSettings::from_config(&TestConfig::default().to_app_config())
}

pub fn spawn_participant(
    session_id: Uuid,
    participant_id: Uuid,
    role: ParticipantRole,
    relay: &InMemoryRelay,
    sink: Arc<RecordingSink>,
    connector: Arc<FakeConnector>,
    devices: Arc<ScriptedDevices>,
) -> Participant {
    let deps = CallDependencies {
        media: devices.clone(),
        relay: Arc::new(relay.clone()),
        connector: connector.clone(),
        sink,
    };
    let call = CallSession::spawn(ConsultationSession::new(session_id, participant_id, role), settings(), deps);
    Participant {
        call,
        connector,
        devices,
    }
}

/// Doctor (initiator) and patient (responder) sharing one relay and sink.
pub fn spawn_pair(relay: &InMemoryRelay, sink: Arc<RecordingSink>) -> (Participant, Participant) {
    let consultation = TestConsultation::default();
    let doctor = spawn_participant(
        consultation.session_id,
        consultation.doctor.id,
        ParticipantRole::Initiator,
        relay,
        sink.clone(),
        FakeConnector::new("doctor"),
        ScriptedDevices::working(),
    );
    let patient = spawn_participant(
        consultation.session_id,
        consultation.patient.id,
        ParticipantRole::Responder,
        relay,
        sink,
        FakeConnector::new("patient"),
        ScriptedDevices::working(),
    );
    (doctor, patient)
}

pub async fn wait_for_state(call: &CallSession, expected: CallState) {
    let mut state = call.watch_state();
    let reached = matches!(timeout(WAIT, state.wait_for(|s| *s == expected)).await, Ok(Ok(_)));
    assert!(
        reached,
        "timed out waiting for {}, still {}",
        expected,
        call.current_state()
    );
}

/// Polls until `check` holds or the wait budget runs out.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Aborted readers drop their subscription on the next scheduler pass, so
/// counts are polled rather than read once.
pub async fn wait_for_subscribers(relay: &InMemoryRelay, topic: &str, expected: usize) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if relay.subscriber_count(topic).await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    relay.subscriber_count(topic).await == expected
}

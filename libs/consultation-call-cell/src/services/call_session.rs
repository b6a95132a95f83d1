// libs/consultation-call-cell/src/services/call_session.rs
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use shared_config::AppConfig;

use crate::error::{CallError, CallFailure, MediaError};
use crate::models::{
    CallEvent, CallState, CallSummary, ConsultationSession, EndStatus, ParticipantJoined,
    ParticipantRole, PresenceState, SessionEnded, SignalEnvelope, SignalKind,
};
use crate::services::media::{LocalMediaHandle, MediaConstraints, MediaDevices};
use crate::services::negotiator::{Negotiator, NegotiatorEvent, PeerConnector, PeerEvent};
use crate::services::record_sink::SessionRecordSink;
use crate::services::relay::SignalingRelay;
use crate::services::signaling::{SignalDispatcher, SignalingChannel};

const EVENT_CAPACITY: usize = 64;

/// Collaborators of one call session.
#[derive(Clone)]
pub struct CallDependencies {
    pub media: Arc<dyn MediaDevices>,
    pub relay: Arc<dyn SignalingRelay>,
    pub connector: Arc<dyn PeerConnector>,
    pub sink: Arc<dyn SessionRecordSink>,
}

#[derive(Debug, Clone)]
pub struct CallSettings {
    pub topic_prefix: String,
    pub constraints: MediaConstraints,
}

impl CallSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            topic_prefix: config.signaling_topic_prefix.clone(),
            constraints: MediaConstraints::default(),
        }
    }
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            topic_prefix: "consultation".to_string(),
            constraints: MediaConstraints::default(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum SessionCommand {
    Preview(Reply<()>),
    Join(Reply<()>),
    ToggleAudio(Reply<bool>),
    ToggleVideo(Reply<bool>),
    Leave(Reply<()>),
}

enum SessionInput {
    MediaAcquired {
        attempt: u64,
        result: Result<LocalMediaHandle, MediaError>,
    },
    Signal {
        attempt: u64,
        envelope: SignalEnvelope,
    },
    Peer {
        attempt: u64,
        event: PeerEvent,
    },
}

/// Handle to one participant's call. The lifecycle runs on its own task;
/// intents are serialised through it, so every method is safe to call from
/// any task. Dropping every clone of the handle tears the call down.
#[derive(Clone)]
pub struct CallSession {
    session: ConsultationSession,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<CallState>,
    media: watch::Receiver<Option<LocalMediaHandle>>,
    events: broadcast::Sender<CallEvent>,
}

impl CallSession {
    pub fn spawn(session: ConsultationSession, settings: CallSettings, deps: CallDependencies) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (media_tx, media_rx) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let span = info_span!(
            "call_session",
            session_id = %session.session_id,
            participant_id = %session.participant_id,
            role = ?session.role
        );

        let driver = CallDriver {
            session: session.clone(),
            settings,
            deps,
            state_tx,
            media_tx,
            events: events_tx.clone(),
            inputs_tx,
            attempt: 0,
            local_media: None,
            pending_preview: None,
            call: None,
        };
        tokio::spawn(driver.run(commands_rx, inputs_rx).instrument(span));

        Self {
            session,
            commands: commands_tx,
            state: state_rx,
            media: media_rx,
            events: events_tx,
        }
    }

    pub fn session(&self) -> &ConsultationSession {
        &self.session
    }

    pub fn current_state(&self) -> CallState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// The local preview stream, while one is held.
    pub fn local_media(&self) -> Option<LocalMediaHandle> {
        self.media.borrow().clone()
    }

    /// Enters the waiting room: acquires camera and microphone without
    /// negotiating. Resolves once acquisition finished.
    pub async fn preview(&self) -> Result<(), CallError> {
        self.request(SessionCommand::Preview).await
    }

    /// Opens signaling and starts negotiating. A no-op while already
    /// connecting or in the call.
    pub async fn join(&self) -> Result<(), CallError> {
        self.request(SessionCommand::Join).await
    }

    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.request(SessionCommand::ToggleAudio).await
    }

    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(SessionCommand::ToggleVideo).await
    }

    /// Leaves from any state. Idempotent.
    pub async fn leave(&self) -> Result<(), CallError> {
        self.request(SessionCommand::Leave).await
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }
}

/// Everything owned by one joined attempt.
struct ActiveCall {
    attempt: u64,
    channel: SignalingChannel,
    negotiator: Negotiator,
    peer_pump: JoinHandle<()>,
    remote_seen: bool,
    connected_at: Option<DateTime<Utc>>,
}

struct CallDriver {
    session: ConsultationSession,
    settings: CallSettings,
    deps: CallDependencies,
    state_tx: watch::Sender<CallState>,
    media_tx: watch::Sender<Option<LocalMediaHandle>>,
    events: broadcast::Sender<CallEvent>,
    inputs_tx: mpsc::UnboundedSender<SessionInput>,
    attempt: u64,
    local_media: Option<LocalMediaHandle>,
    pending_preview: Option<Reply<()>>,
    call: Option<ActiveCall>,
}

impl CallDriver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut inputs: mpsc::UnboundedReceiver<SessionInput>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(input) = inputs.recv() => self.handle_input(input).await,
            }
        }
        debug!("Call session task finished");
    }

    fn state(&self) -> CallState {
        self.state_tx.borrow().clone()
    }

    fn set_state(&self, next: CallState) {
        if *self.state_tx.borrow() == next {
            return;
        }
        info!("Call state -> {}", next);
        self.state_tx.send_replace(next.clone());
        self.emit(CallEvent::StateChanged(next));
    }

    fn emit(&self, event: CallEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Preview(reply) => self.preview(reply),
            SessionCommand::Join(reply) => {
                let result = self.join().await;
                let _ = reply.send(result);
            }
            SessionCommand::ToggleAudio(reply) => {
                let _ = reply.send(self.toggle("toggle audio", |m| m.toggle_audio()));
            }
            SessionCommand::ToggleVideo(reply) => {
                let _ = reply.send(self.toggle("toggle video", |m| m.toggle_video()));
            }
            SessionCommand::Leave(reply) => self.leave(reply).await,
        }
    }

    async fn handle_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::MediaAcquired { attempt, result } => self.on_media_acquired(attempt, result),
            SessionInput::Signal { attempt, envelope } => {
                if self.is_current(attempt) {
                    self.on_signal(envelope).await;
                } else {
                    debug!("Dropping {} from stale attempt {}", envelope.kind(), attempt);
                }
            }
            SessionInput::Peer { attempt, event } => {
                if self.is_current(attempt) {
                    self.on_peer_event(event).await;
                } else {
                    debug!("Dropping peer event from stale attempt {}", attempt);
                }
            }
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.call.as_ref().map(|c| c.attempt == attempt).unwrap_or(false)
    }

    // ==========================================================================
    // INTENTS
    // ==========================================================================

    fn preview(&mut self, reply: Reply<()>) {
        let state = self.state();
        if !matches!(state, CallState::Idle | CallState::Ended | CallState::Error(_)) {
            let _ = reply.send(Err(CallError::InvalidTransition {
                intent: "preview",
                state: state.to_string(),
            }));
            return;
        }

        self.release_media();
        self.attempt += 1;
        let attempt = self.attempt;
        self.pending_preview = Some(reply);
        self.set_state(CallState::AcquiringMedia);

        let media = self.deps.media.clone();
        let constraints = self.settings.constraints.clone();
        let inputs = self.inputs_tx.clone();
        tokio::spawn(
            async move {
                let result = media.acquire(&constraints).await;
                let _ = inputs.send(SessionInput::MediaAcquired { attempt, result });
            }
            .in_current_span(),
        );
    }

    fn on_media_acquired(&mut self, attempt: u64, result: Result<LocalMediaHandle, MediaError>) {
        if attempt != self.attempt || self.state() != CallState::AcquiringMedia {
            debug!("Discarding media from superseded attempt {}", attempt);
            if let Ok(media) = result {
                media.release();
            }
            return;
        }

        let reply = self.pending_preview.take();
        match result {
            Ok(media) => {
                self.local_media = Some(media.clone());
                self.media_tx.send_replace(Some(media));
                self.set_state(CallState::WaitingRoom);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            Err(e) => {
                warn!("Media acquisition failed: {}", e);
                self.set_state(CallState::Error(CallFailure::Media(e.clone())));
                if let Some(reply) = reply {
                    let _ = reply.send(Err(CallError::Media(e)));
                }
            }
        }
    }

    async fn join(&mut self) -> Result<(), CallError> {
        let state = self.state();
        match state {
            CallState::Connecting | CallState::InCall => {
                debug!("Join ignored, already {}", state);
                return Ok(());
            }
            CallState::WaitingRoom | CallState::Error(_) => {}
            _ => {
                return Err(CallError::InvalidTransition {
                    intent: "join",
                    state: state.to_string(),
                })
            }
        }

        let media = match &self.local_media {
            Some(media) if !media.is_released() => media.clone(),
            _ => {
                return Err(CallError::InvalidTransition {
                    intent: "join",
                    state: state.to_string(),
                })
            }
        };

        self.attempt += 1;
        let attempt = self.attempt;
        self.set_state(CallState::Connecting);

        let dispatcher = self.dispatcher(attempt);
        let channel = match SignalingChannel::open(
            self.deps.relay.clone(),
            &self.session,
            &self.settings.topic_prefix,
            dispatcher,
        )
        .await
        {
            Ok(channel) => channel,
            Err(e) => {
                error!("Failed to open signaling channel: {}", e);
                self.set_state(CallState::Error(CallFailure::Signaling(e.clone())));
                return Err(e.into());
            }
        };

        let (negotiator, mut peer_events) =
            match Negotiator::create(self.deps.connector.as_ref(), &media, channel.sender()).await {
                Ok(created) => created,
                Err(e) => {
                    error!("Failed to create peer connection: {}", e);
                    let mut channel = channel;
                    channel.close().await;
                    self.set_state(CallState::Error(CallFailure::Negotiation(e.clone())));
                    return Err(e.into());
                }
            };

        let inputs = self.inputs_tx.clone();
        let peer_pump = tokio::spawn(async move {
            while let Some(event) = peer_events.recv().await {
                if inputs.send(SessionInput::Peer { attempt, event }).is_err() {
                    break;
                }
            }
        });

        self.call = Some(ActiveCall {
            attempt,
            channel,
            negotiator,
            peer_pump,
            remote_seen: false,
            connected_at: None,
        });
        info!("Joined consultation, attempt {}", attempt);

        let record = ParticipantJoined {
            session_id: self.session.session_id,
            participant_id: self.session.participant_id,
            role: self.session.role,
            joined_at: Utc::now(),
        };
        let sink = self.deps.sink.clone();
        tokio::spawn(
            async move {
                if let Err(e) = sink.participant_joined(record).await {
                    warn!("Failed to record participant join: {}", e);
                }
            }
            .in_current_span(),
        );

        Ok(())
    }

    fn toggle(&self, intent: &'static str, flip: impl FnOnce(&LocalMediaHandle) -> bool) -> Result<bool, CallError> {
        match &self.local_media {
            Some(media) if !media.is_released() => Ok(flip(media)),
            _ => Err(CallError::InvalidTransition {
                intent,
                state: self.state().to_string(),
            }),
        }
    }

    async fn leave(&mut self, reply: Reply<()>) {
        if self.call.is_some() {
            let status = self.completion_status();
            self.end_attempt(status, CallState::Ended, Some(reply)).await;
            return;
        }

        if let Some(pending) = self.pending_preview.take() {
            let _ = pending.send(Err(CallError::Cancelled));
        }
        // Invalidates any acquisition still in flight.
        self.attempt += 1;
        self.release_media();
        if self.state() != CallState::Idle {
            self.set_state(CallState::Ended);
        }
        let _ = reply.send(Ok(()));
    }

    // ==========================================================================
    // SIGNALING
    // ==========================================================================

    fn dispatcher(&self, attempt: u64) -> SignalDispatcher {
        let mut dispatcher = SignalDispatcher::new();
        for kind in [
            SignalKind::Presence,
            SignalKind::Offer,
            SignalKind::Answer,
            SignalKind::IceCandidate,
        ] {
            let inputs = self.inputs_tx.clone();
            dispatcher.on_message(kind, move |envelope| {
                let _ = inputs.send(SessionInput::Signal { attempt, envelope });
            });
        }
        dispatcher
    }

    async fn on_signal(&mut self, envelope: SignalEnvelope) {
        let role = self.session.role;
        let Some(call) = self.call.as_mut() else {
            return;
        };

        let result = match envelope {
            SignalEnvelope::Presence {
                sender_id,
                state: PresenceState::Joined,
            } => {
                if call.remote_seen {
                    Ok(())
                } else {
                    call.remote_seen = true;
                    info!("Participant {} is present", sender_id);
                    // Announce back so a participant that subscribed later
                    // learns about us.
                    let announce = call
                        .channel
                        .sender()
                        .send(&SignalEnvelope::joined(self.session.participant_id))
                        .await
                        .map_err(CallError::from);
                    match (announce, role) {
                        (Err(e), _) => Err(e),
                        (Ok(()), ParticipantRole::Initiator) => call.negotiator.make_offer().await,
                        (Ok(()), ParticipantRole::Responder) => Ok(()),
                    }
                }
            }
            SignalEnvelope::Presence {
                sender_id,
                state: PresenceState::Left,
            } => {
                info!("Participant {} left the consultation", sender_id);
                self.emit(CallEvent::RemoteLeft);
                let status = self.completion_status();
                self.end_attempt(status, CallState::Ended, None).await;
                return;
            }
            SignalEnvelope::Offer { sender_id, sdp } => {
                if role == ParticipantRole::Initiator {
                    warn!("Initiator ignoring offer from {}", sender_id);
                    Ok(())
                } else {
                    call.negotiator.handle_offer(sender_id, sdp).await
                }
            }
            SignalEnvelope::Answer { sender_id, sdp } => {
                if role == ParticipantRole::Responder {
                    warn!("Responder ignoring answer from {}", sender_id);
                    Ok(())
                } else {
                    call.negotiator.handle_answer(sender_id, sdp).await
                }
            }
            SignalEnvelope::IceCandidate { candidate, .. } => {
                call.negotiator.handle_remote_candidate(candidate).await;
                Ok(())
            }
        };

        if let Err(e) = result {
            error!("Negotiation step failed: {}", e);
            self.abort_attempt(e).await;
        }
    }

    // ==========================================================================
    // PEER CONNECTION
    // ==========================================================================

    async fn on_peer_event(&mut self, event: PeerEvent) {
        let Some(call) = self.call.as_mut() else {
            return;
        };

        let events = match call.negotiator.handle_peer_event(event).await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to relay peer event: {}", e);
                self.abort_attempt(e).await;
                return;
            }
        };

        for event in events {
            match event {
                NegotiatorEvent::RemoteJoined(track) => self.emit(CallEvent::RemoteJoined(track)),
                NegotiatorEvent::Connected => {
                    if let Some(call) = self.call.as_mut() {
                        call.connected_at.get_or_insert_with(Utc::now);
                    }
                    if self.state() == CallState::Connecting {
                        self.set_state(CallState::InCall);
                    }
                    self.emit(CallEvent::Connected);
                }
                NegotiatorEvent::Disconnected => {
                    warn!("Peer connection lost");
                    self.emit(CallEvent::Disconnected);
                }
                NegotiatorEvent::Failed => {
                    self.abort_attempt(CallError::ConnectionFailed).await;
                    return;
                }
                NegotiatorEvent::Closed => {
                    let status = self.completion_status();
                    self.end_attempt(status, CallState::Ended, None).await;
                    return;
                }
            }
        }
    }

    // ==========================================================================
    // TEARDOWN
    // ==========================================================================

    fn completion_status(&self) -> EndStatus {
        match self.call.as_ref().and_then(|c| c.connected_at) {
            Some(_) => EndStatus::Completed,
            None => EndStatus::Cancelled,
        }
    }

    /// Fatal failure of the current attempt: `ended` once in the call,
    /// `error` before that.
    async fn abort_attempt(&mut self, err: CallError) {
        let next = if self.state() == CallState::InCall {
            CallState::Ended
        } else {
            let failure = match err {
                CallError::Signaling(e) => CallFailure::Signaling(e),
                CallError::Negotiation(e) => CallFailure::Negotiation(e),
                CallError::Media(e) => CallFailure::Media(e),
                _ => CallFailure::ConnectionFailed,
            };
            CallState::Error(failure)
        };
        self.end_attempt(EndStatus::Failed, next, None).await;
    }

    /// Tears down the joined attempt and writes its end record. Runs at most
    /// once per attempt because the attempt is taken out of `self.call`.
    async fn end_attempt(&mut self, status: EndStatus, next: CallState, reply: Option<Reply<()>>) {
        let Some(mut call) = self.call.take() else {
            self.set_state(next);
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        };

        call.peer_pump.abort();
        call.negotiator.close().await;
        call.channel.close().await;

        // Media stays available for a rejoin after a failed attempt.
        if !matches!(next, CallState::Error(_)) {
            self.release_media();
        }

        let ended_at = Utc::now();
        let duration_seconds = call
            .connected_at
            .map(|t| (ended_at - t).num_seconds().max(0))
            .unwrap_or(0);

        self.set_state(next);
        if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
        }
        self.emit(CallEvent::Ended(CallSummary {
            status,
            duration_seconds,
        }));

        let record = SessionEnded {
            session_id: self.session.session_id,
            participant_id: self.session.participant_id,
            status,
            ended_at,
            duration_seconds,
        };
        let sink = self.deps.sink.clone();
        tokio::spawn(
            async move {
                if let Err(e) = sink.session_ended(record).await {
                    warn!("Failed to record session end: {}", e);
                }
            }
            .in_current_span(),
        );
        info!("Attempt {} ended ({:?}, {}s)", call.attempt, status, duration_seconds);
    }

    fn release_media(&mut self) {
        if let Some(media) = self.local_media.take() {
            media.release();
            self.media_tx.send_replace(None);
        }
    }

    async fn shutdown(&mut self) {
        if self.call.is_some() {
            let status = self.completion_status();
            self.end_attempt(status, CallState::Ended, None).await;
        }
        self.release_media();
    }
}

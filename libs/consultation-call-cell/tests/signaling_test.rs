// =====================================================================================
// SIGNALING CHANNEL TESTS
// Envelope format, self-filtering and presence over the in-memory relay
// =====================================================================================

use futures::StreamExt;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

use consultation_call_cell::{
    ConsultationSession, IceCandidate, InMemoryRelay, ParticipantRole, PresenceState,
    SessionDescription, SignalDispatcher, SignalEnvelope, SignalKind, SignalingChannel,
    SignalingError, SignalingRelay,
};

const PREFIX: &str = "test-consultation";

fn recording_dispatcher(kinds: &[SignalKind]) -> (SignalDispatcher, Arc<Mutex<Vec<SignalEnvelope>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let mut dispatcher = SignalDispatcher::new();
    for kind in kinds {
        let sink = received.clone();
        dispatcher.on_message(*kind, move |envelope| sink.lock().unwrap().push(envelope));
    }
    (dispatcher, received)
}

async fn wait_for_len(received: &Arc<Mutex<Vec<SignalEnvelope>>>, len: usize) -> bool {
    for _ in 0..100 {
        if received.lock().unwrap().len() >= len {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[test]
fn test_envelope_wire_format() {
    let sender_id = Uuid::new_v4();

    let presence = serde_json::to_value(SignalEnvelope::joined(sender_id)).unwrap();
    assert_eq!(
        presence,
        json!({ "kind": "presence", "senderId": sender_id, "state": "joined" })
    );

    let candidate = serde_json::to_value(SignalEnvelope::IceCandidate {
        sender_id,
        candidate: IceCandidate::new("candidate:1 1 udp 1 127.0.0.1 9 typ host"),
    })
    .unwrap();
    assert_eq!(candidate["kind"], "ice-candidate");
    assert_eq!(candidate["candidate"]["sdpMid"], "0");
    assert_eq!(candidate["candidate"]["sdpMLineIndex"], 0);

    let offer = serde_json::to_value(SignalEnvelope::Offer {
        sender_id,
        sdp: SessionDescription::offer("v=0"),
    })
    .unwrap();
    assert_eq!(offer["sdp"], json!({ "type": "offer", "sdp": "v=0" }));
}

#[test]
fn test_presence_without_state_means_joined() {
    let sender_id = Uuid::new_v4();
    let envelope: SignalEnvelope =
        serde_json::from_value(json!({ "kind": "presence", "senderId": sender_id })).unwrap();

    assert_eq!(
        envelope,
        SignalEnvelope::Presence {
            sender_id,
            state: PresenceState::Joined
        }
    );
}

#[test]
fn test_dispatch_without_handler_reports_unhandled() {
    let (dispatcher, received) = recording_dispatcher(&[SignalKind::Offer]);

    assert!(!dispatcher.dispatch(SignalEnvelope::joined(Uuid::new_v4())));
    assert!(dispatcher.dispatch(SignalEnvelope::Offer {
        sender_id: Uuid::new_v4(),
        sdp: SessionDescription::offer("v=0"),
    }));
    assert_eq!(received.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_open_announces_presence_to_existing_subscribers() {
    let relay = InMemoryRelay::new();
    let session = ConsultationSession::new(Uuid::new_v4(), Uuid::new_v4(), ParticipantRole::Responder);
    let mut observer = relay.subscribe(&session.topic(PREFIX)).await.unwrap();

    let _channel = SignalingChannel::open(Arc::new(relay.clone()), &session, PREFIX, SignalDispatcher::new())
        .await
        .unwrap();

    let payload = timeout(Duration::from_secs(1), observer.next()).await.unwrap().unwrap();
    let envelope: SignalEnvelope = serde_json::from_str(&payload).unwrap();
    assert_eq!(envelope, SignalEnvelope::joined(session.participant_id));
}

#[tokio::test]
async fn test_own_envelopes_are_never_dispatched() {
    let relay = InMemoryRelay::new();
    let session_id = Uuid::new_v4();
    let doctor = ConsultationSession::new(session_id, Uuid::new_v4(), ParticipantRole::Initiator);
    let patient = ConsultationSession::new(session_id, Uuid::new_v4(), ParticipantRole::Responder);

    let (doctor_dispatcher, doctor_received) =
        recording_dispatcher(&[SignalKind::Presence, SignalKind::Offer]);
    let doctor_channel = SignalingChannel::open(Arc::new(relay.clone()), &doctor, PREFIX, doctor_dispatcher)
        .await
        .unwrap();

    let (patient_dispatcher, patient_received) = recording_dispatcher(&[SignalKind::Presence, SignalKind::Offer]);
    let _patient_channel = SignalingChannel::open(Arc::new(relay.clone()), &patient, PREFIX, patient_dispatcher)
        .await
        .unwrap();

    doctor_channel
        .sender()
        .send(&SignalEnvelope::Offer {
            sender_id: doctor.participant_id,
            sdp: SessionDescription::offer("v=0"),
        })
        .await
        .unwrap();

    assert!(wait_for_len(&patient_received, 1).await);
    assert!(wait_for_len(&doctor_received, 1).await);

    // The doctor only heard the patient's presence; the patient only the offer.
    let doctor_seen = doctor_received.lock().unwrap().clone();
    assert_eq!(doctor_seen, vec![SignalEnvelope::joined(patient.participant_id)]);
    let patient_seen = patient_received.lock().unwrap().clone();
    assert_eq!(patient_seen.len(), 1);
    assert_eq!(patient_seen[0].kind(), SignalKind::Offer);
}

#[tokio::test]
async fn test_undecodable_payloads_are_skipped() {
    let relay = InMemoryRelay::new();
    let session = ConsultationSession::new(Uuid::new_v4(), Uuid::new_v4(), ParticipantRole::Responder);
    let (dispatcher, received) = recording_dispatcher(&[SignalKind::Presence]);
    let _channel = SignalingChannel::open(Arc::new(relay.clone()), &session, PREFIX, dispatcher)
        .await
        .unwrap();
    let topic = session.topic(PREFIX);

    relay.publish(&topic, "not json".to_string()).await.unwrap();
    relay
        .publish(&topic, json!({ "kind": "renegotiate", "senderId": Uuid::new_v4() }).to_string())
        .await
        .unwrap();
    let remote = Uuid::new_v4();
    relay
        .publish(&topic, serde_json::to_string(&SignalEnvelope::joined(remote)).unwrap())
        .await
        .unwrap();

    assert!(wait_for_len(&received, 1).await);
    assert_eq!(received.lock().unwrap()[0], SignalEnvelope::joined(remote));
}

#[tokio::test]
async fn test_close_announces_departure_and_rejects_sends() {
    let relay = InMemoryRelay::new();
    let session = ConsultationSession::new(Uuid::new_v4(), Uuid::new_v4(), ParticipantRole::Initiator);
    let mut channel = SignalingChannel::open(Arc::new(relay.clone()), &session, PREFIX, SignalDispatcher::new())
        .await
        .unwrap();
    let mut observer = relay.subscribe(&session.topic(PREFIX)).await.unwrap();
    let sender = channel.sender();

    channel.close().await;
    channel.close().await;

    let payload = timeout(Duration::from_secs(1), observer.next()).await.unwrap().unwrap();
    let envelope: SignalEnvelope = serde_json::from_str(&payload).unwrap();
    assert_eq!(envelope, SignalEnvelope::left(session.participant_id));
    assert!(channel.is_closed());

    let result = sender.send(&SignalEnvelope::joined(session.participant_id)).await;
    assert_eq!(result, Err(SignalingError::ChannelClosed));

    // Only one departure was announced.
    let extra = timeout(Duration::from_millis(100), observer.next()).await;
    assert!(extra.is_err());
}

#[test]
fn test_topic_is_scoped_per_consultation() {
    let session_id = Uuid::new_v4();
    let session = ConsultationSession::new(session_id, Uuid::new_v4(), ParticipantRole::Responder);

    assert_eq!(session.topic("consultation"), format!("consultation:{}", session_id));
}

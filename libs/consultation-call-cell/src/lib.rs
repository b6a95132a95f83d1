// libs/consultation-call-cell/src/lib.rs
//! # Consultation Call Cell
//!
//! Peer-to-peer video consultations between a patient and a doctor. Media
//! flows directly between the two participants over WebRTC; this cell owns
//! the signaling and the call lifecycle around it.
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------------+
//! |                Consultation Call Cell               |
//! +-----------------------------------------------------+
//! |  models.rs        |  Envelopes, call states, records|
//! |  error.rs         |  Error types per component      |
//! |  services/        |                                 |
//! |    media.rs       |  Local camera/microphone        |
//! |    relay.rs       |  Pub/sub transport (memory/Redis)|
//! |    signaling.rs   |  Per-consultation channel       |
//! |    negotiator.rs  |  Offer/answer and ICE handling  |
//! |    webrtc_peer.rs |  webrtc-rs peer connections     |
//! |    call_session.rs|  Call lifecycle state machine   |
//! |    record_sink.rs |  Durable session status         |
//! +-----------------------------------------------------+
//! ```
//!
//! ## Call lifecycle
//!
//! `idle -> acquiring-media -> waiting-room -> connecting -> in-call -> ended`,
//! with `error` reachable from acquisition and negotiation. The initiator
//! (doctor) sends the single offer of an attempt once it has seen the other
//! participant's presence; the responder (patient) answers.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use consultation_call_cell::{
//!     CallDependencies, CallSession, CallSettings, ConsultationSession, InMemoryRelay,
//!     ParticipantRole, SampleTrackDevices, WebRtcConnector,
//! };
//! use consultation_call_cell::services::record_sink::SessionRecordSink;
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! # async fn example(sink: Arc<dyn SessionRecordSink>) -> Result<(), Box<dyn std::error::Error>> {
//! let deps = CallDependencies {
//!     media: Arc::new(SampleTrackDevices::new()),
//!     relay: Arc::new(InMemoryRelay::new()),
//!     connector: Arc::new(WebRtcConnector::default()),
//!     sink,
//! };
//! let session = ConsultationSession::new(Uuid::new_v4(), Uuid::new_v4(), ParticipantRole::Initiator);
//!
//! let call = CallSession::spawn(session, CallSettings::default(), deps);
//! call.preview().await?;
//! call.join().await?;
//! // ...
//! call.leave().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! - `REDIS_URL` - pub/sub relay for signaling (in-memory relay otherwise)
//! - `ICE_SERVER_URLS` - comma separated STUN/TURN urls (public STUN by default)
//! - `SIGNALING_TOPIC_PREFIX` - topic namespace, defaults to `consultation`
//! - `SUPABASE_URL` / `SUPABASE_ANON_PUBLIC_KEY` - session record storage

pub mod error;
pub mod models;
pub mod services;

pub use error::*;
pub use models::*;
pub use services::*;

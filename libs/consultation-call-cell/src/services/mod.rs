// libs/consultation-call-cell/src/services/mod.rs

pub mod call_session;
pub mod media;
pub mod negotiator;
pub mod record_sink;
pub mod relay;
pub mod signaling;
pub mod webrtc_peer;

pub use call_session::{CallDependencies, CallSession, CallSettings};
pub use media::{LocalMediaHandle, LocalTrack, MediaConstraints, MediaDevices, SampleTrackDevices};
pub use negotiator::{Negotiator, NegotiatorEvent, PeerConnection, PeerConnector, PeerEvent};
pub use record_sink::{SessionRecordSink, SupabaseRecordSink};
pub use relay::{InMemoryRelay, RedisRelay, RelayStream, SignalingRelay};
pub use signaling::{SignalDispatcher, SignalSender, SignalingChannel};
pub use webrtc_peer::{WebRtcConnector, DEFAULT_ICE_SERVERS};

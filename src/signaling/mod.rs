//! Signaling transport
//!
//! Persistent, self-healing link to the relay that pairs participants and
//! forwards offers, answers and ICE candidates between them.

pub mod protocol;
pub mod relay;
pub mod retry;
pub mod transport;

pub use protocol::{
    CallRole, ChatMessage, ChatMessageKind, GenderPreference, IceCandidate, MatchPreferences,
    Participant, ReportReason, SdpType, SessionDescription, SessionId, SignalKind,
    SignalingMessage, SYSTEM_SENDER,
};
pub use relay::{RelayConnector, RelayLink, WebSocketConnector};
pub use retry::{ManualScheduler, RetryPolicy, Scheduler, TokioScheduler};
pub use transport::{SignalHandler, SignalSink, SignalingTransport, TransportState, TransportStatus};

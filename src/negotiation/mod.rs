//! Negotiation engine
//!
//! Owns the local media stream and one peer connection per call attempt,
//! and drives the offer/answer/ICE exchange over the signaling transport.

pub mod config;
pub mod engine;
pub mod media;
pub mod peer;

pub use config::{RtcConfig, TurnServer};
pub use engine::{CandidateOutcome, EngineEvent, NegotiationEngine, NegotiationPhase, NegotiationState};
pub use media::{
    DeviceMediaSource, LocalMedia, LocalTrack, MediaConstraints, MediaSource, RemoteMedia,
    RemoteTrack, TrackKind,
};
pub use peer::{ConnectionQuality, ConnectionState, PeerEvent, PeerFactory, PeerLink, RtcPeerFactory};

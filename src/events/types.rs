//! Session event types
//!
//! Notifications the presentation layer renders. Every event serialises as
//! `{"event": "<name>", "data": {...}}`.

use serde::{Deserialize, Serialize};

use crate::negotiation::{ConnectionQuality, TrackKind};
use crate::session::{SessionPhase, SessionView};
use crate::signaling::{ChatMessage, TransportStatus};

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    /// Local user hung up
    UserEnded,
    /// Local user skipped to the next partner
    NextPartner,
    /// Partner hung up or vanished
    RemoteEnded,
    /// Offer/answer exchange or the peer connection failed
    NegotiationFailed,
    /// Signaling relay lost for good
    TransportLost,
    /// Application shutting down
    Shutdown,
}

impl std::fmt::Display for CallEndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallEndReason::UserEnded => "user_ended",
            CallEndReason::NextPartner => "next_partner",
            CallEndReason::RemoteEnded => "remote_ended",
            CallEndReason::NegotiationFailed => "negotiation_failed",
            CallEndReason::TransportLost => "transport_lost",
            CallEndReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Session events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    /// Session phase changed
    #[serde(rename = "session.phase_changed")]
    PhaseChanged {
        phase: SessionPhase,
        /// Phase as shown to the user (negotiating folds into chat)
        view: SessionView,
    },

    /// An error was set on the session
    #[serde(rename = "session.error")]
    Error {
        /// Human-readable message
        message: String,
        /// Whether simply trying again may help
        retryable: bool,
    },

    /// A message was appended to the in-call log
    #[serde(rename = "session.message")]
    Message { message: ChatMessage },

    #[serde(rename = "transport.status_changed")]
    TransportStatusChanged {
        status: TransportStatus,
        /// Failed reconnect attempts so far
        attempt: u32,
    },

    #[serde(rename = "call.quality_changed")]
    QualityChanged { quality: ConnectionQuality },

    /// Partner media arrived
    #[serde(rename = "call.remote_track")]
    RemoteTrack { track_id: String, kind: TrackKind },

    /// A call ended; emitted once per matched pairing
    #[serde(rename = "call.ended")]
    CallEnded {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        partner_id: String,
        duration_secs: u64,
        reason: CallEndReason,
    },
}

impl SessionEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::PhaseChanged { .. } => "session.phase_changed",
            Self::Error { .. } => "session.error",
            Self::Message { .. } => "session.message",
            Self::TransportStatusChanged { .. } => "transport.status_changed",
            Self::QualityChanged { .. } => "call.quality_changed",
            Self::RemoteTrack { .. } => "call.remote_track",
            Self::CallEnded { .. } => "call.ended",
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `call.*` matches all call events
    /// - `call.ended` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if let Some(prefix) = topic.strip_suffix(".*") {
            event_name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
        } else {
            event_name == topic
        }
    }
}

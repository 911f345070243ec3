//! Session state record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::negotiation::{ConnectionQuality, LocalMedia, RemoteMedia};
use crate::signaling::{CallRole, ChatMessage, MatchPreferences, Participant, SessionId, TransportStatus};

/// Internal session phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Landing,
    Onboarding,
    Lobby,
    Searching,
    /// Matched, offer/answer in progress
    Negotiating,
    /// Peer connection established
    Chat,
}

impl SessionPhase {
    /// Phase as presented to the user
    pub fn view(&self) -> SessionView {
        match self {
            SessionPhase::Landing => SessionView::Landing,
            SessionPhase::Onboarding => SessionView::Onboarding,
            SessionPhase::Lobby => SessionView::Lobby,
            SessionPhase::Searching => SessionView::Searching,
            SessionPhase::Negotiating | SessionPhase::Chat => SessionView::Chat,
        }
    }

    /// Whether a partner is attached
    pub fn in_call(&self) -> bool {
        matches!(self, SessionPhase::Negotiating | SessionPhase::Chat)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::Landing => write!(f, "landing"),
            SessionPhase::Onboarding => write!(f, "onboarding"),
            SessionPhase::Lobby => write!(f, "lobby"),
            SessionPhase::Searching => write!(f, "searching"),
            SessionPhase::Negotiating => write!(f, "negotiating"),
            SessionPhase::Chat => write!(f, "chat"),
        }
    }
}

/// User-facing phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionView {
    Landing,
    Onboarding,
    Lobby,
    Searching,
    Chat,
}

/// The orchestrator's single mutable record
///
/// Readers get immutable snapshots; only the orchestrator task mutates it.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// Local profile, set by onboarding
    pub user: Option<Participant>,
    pub preferences: MatchPreferences,
    pub partner: Option<Participant>,
    pub role: Option<CallRole>,
    pub session_id: Option<SessionId>,
    pub local_media: Option<LocalMedia>,
    pub remote_media: RemoteMedia,
    pub messages: Vec<ChatMessage>,
    pub call_started_at: Option<DateTime<Utc>>,
    pub quality: Option<ConnectionQuality>,
    pub transport: TransportStatus,
    /// Human-readable error shown until dismissed
    pub error: Option<String>,
}

impl SessionState {
    pub fn new(preferences: MatchPreferences) -> Self {
        Self {
            phase: SessionPhase::Landing,
            user: None,
            preferences,
            partner: None,
            role: None,
            session_id: None,
            local_media: None,
            remote_media: RemoteMedia::default(),
            messages: vec![],
            call_started_at: None,
            quality: None,
            transport: TransportStatus::Disconnected,
            error: None,
        }
    }

    pub fn view(&self) -> SessionView {
        self.phase.view()
    }

    /// Forget everything tied to the current pairing
    pub fn clear_call(&mut self) {
        self.partner = None;
        self.role = None;
        self.session_id = None;
        self.remote_media = RemoteMedia::default();
        self.messages.clear();
        self.call_started_at = None;
        self.quality = None;
    }

    /// Seconds since the call started
    pub fn call_duration_secs(&self) -> u64 {
        self.call_started_at
            .map(|started| (Utc::now() - started).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }
}

/// Whether an inbound message tagged `incoming` belongs to the `current` pairing.
///
/// Once the relay assigned an id, untagged and mismatched messages are
/// rejected. Without an assigned id only untagged messages are accepted.
pub fn session_matches(current: Option<&SessionId>, incoming: Option<&SessionId>) -> bool {
    match (current, incoming) {
        (Some(current), Some(incoming)) => current == incoming,
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::ChatMessage;

    #[test]
    fn test_negotiating_folds_into_chat() {
        assert_eq!(SessionPhase::Negotiating.view(), SessionView::Chat);
        assert_eq!(SessionPhase::Chat.view(), SessionView::Chat);
        assert_eq!(SessionPhase::Searching.view(), SessionView::Searching);
        assert!(SessionPhase::Negotiating.in_call());
        assert!(!SessionPhase::Searching.in_call());
    }

    #[test]
    fn test_clear_call_keeps_profile() {
        let mut state = SessionState::new(MatchPreferences::default());
        state.user = Some(Participant::new("Ada", "Norway"));
        state.partner = Some(Participant::new("Bob", "Chile"));
        state.session_id = Some(SessionId::new("s-1"));
        state.messages.push(ChatMessage::system("Connected with Bob from Chile"));
        state.call_started_at = Some(Utc::now());

        state.clear_call();

        assert!(state.partner.is_none());
        assert!(state.session_id.is_none());
        assert!(state.messages.is_empty());
        assert_eq!(state.call_duration_secs(), 0);
        assert!(state.user.is_some());
    }

    #[test]
    fn test_session_matching() {
        let s1 = SessionId::new("s-1");
        let s2 = SessionId::new("s-2");

        assert!(session_matches(None, None));
        assert!(session_matches(Some(&s1), Some(&s1)));
        assert!(!session_matches(Some(&s1), Some(&s2)));
        assert!(!session_matches(Some(&s1), None));
        assert!(!session_matches(None, Some(&s2)));
    }
}

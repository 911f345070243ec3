//! Signaling wire protocol
//!
//! Every frame on the relay link is a JSON object of the form
//! `{"event": "<name>", "data": {...}}`. Event names match the socket events
//! of the web client, so the same relay can serve both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Relay-assigned identifier of one matched pairing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Anonymous participant profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    /// Shown to the partner; older relays send it as `name`
    #[serde(alias = "name")]
    pub display_name: String,
    pub country: String,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "en".to_string()
}

impl Participant {
    /// Create a participant with a fresh `user_<uuid>` id
    pub fn new(display_name: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            id: format!("user_{}", uuid::Uuid::new_v4().simple()),
            display_name: display_name.into(),
            country: country.into(),
            interests: vec![],
            language: default_language(),
        }
    }
}

/// Gender filter for matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenderPreference {
    Male,
    Female,
    Other,
    #[default]
    Any,
}

/// Matching preferences sent with each search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPreferences {
    /// Inclusive (min, max) age
    pub age_range: (u8, u8),
    pub country: String,
    pub interests: Vec<String>,
    pub gender: GenderPreference,
}

impl Default for MatchPreferences {
    fn default() -> Self {
        Self {
            age_range: (18, 65),
            country: "any".to_string(),
            interests: vec![],
            gender: GenderPreference::Any,
        }
    }
}

/// Which side of the pairing creates the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    /// Creates the offer as soon as the match arrives
    #[default]
    Caller,
    /// Waits for the partner's offer
    Callee,
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description in the browser `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Chat message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMessageKind {
    Text,
    System,
    Emoji,
}

/// Sender id used for system notices in the message log
pub const SYSTEM_SENDER: &str = "system";

/// One entry of the in-call message log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: ChatMessageKind,
}

impl ChatMessage {
    pub fn text(sender_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            message: message.into(),
            timestamp: Utc::now(),
            kind: ChatMessageKind::Text,
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self {
            id: "welcome".to_string(),
            sender_id: SYSTEM_SENDER.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
            kind: ChatMessageKind::System,
        }
    }
}

/// Reason attached to a user report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReportReason {
    InappropriateBehavior,
    Harassment,
    Spam,
    FakeProfile,
    Underage,
    SexualContent,
    Violence,
    HateSpeech,
    TechnicalIssues,
    Other(String),
}

impl ReportReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::InappropriateBehavior => "Inappropriate behavior",
            Self::Harassment => "Harassment or bullying",
            Self::Spam => "Spam or advertising",
            Self::FakeProfile => "Fake profile or catfishing",
            Self::Underage => "Underage user",
            Self::SexualContent => "Nudity or sexual content",
            Self::Violence => "Violence or threats",
            Self::HateSpeech => "Hate speech or discrimination",
            Self::TechnicalIssues => "Technical issues",
            Self::Other(reason) => reason,
        }
    }
}

impl From<String> for ReportReason {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Inappropriate behavior" => Self::InappropriateBehavior,
            "Harassment or bullying" | "Harassment" => Self::Harassment,
            "Spam or advertising" => Self::Spam,
            "Fake profile or catfishing" | "Fake profile" => Self::FakeProfile,
            "Underage user" => Self::Underage,
            "Nudity or sexual content" => Self::SexualContent,
            "Violence or threats" => Self::Violence,
            "Hate speech or discrimination" => Self::HateSpeech,
            "Technical issues" => Self::TechnicalIssues,
            _ => Self::Other(value),
        }
    }
}

impl From<ReportReason> for String {
    fn from(value: ReportReason) -> Self {
        match value {
            ReportReason::Other(reason) => reason,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for ReportReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signaling message types
///
/// Fire-and-forget events; no acknowledgment or request/response pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all_fields = "camelCase")]
pub enum SignalingMessage {
    /// Ask the relay to pair us with someone
    #[serde(rename = "search-partner")]
    SearchPartner {
        user_id: String,
        preferences: MatchPreferences,
    },

    /// Relay paired us with `partner`
    #[serde(rename = "match-found")]
    MatchFound {
        partner: Participant,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(default)]
        role: CallRole,
    },

    #[serde(rename = "call-offer")]
    CallOffer {
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    #[serde(rename = "call-answer")]
    CallAnswer {
        answer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    #[serde(rename = "ice-candidate")]
    Candidate {
        candidate: IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    #[serde(rename = "call-ended")]
    CallEnded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    #[serde(rename = "search-cancelled")]
    SearchCancelled,

    #[serde(rename = "chat-message")]
    Chat {
        message: ChatMessage,
        partner_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    #[serde(rename = "report-user")]
    ReportUser { user_id: String, reason: ReportReason },
}

/// Event type key used for handler registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    SearchPartner,
    MatchFound,
    CallOffer,
    CallAnswer,
    IceCandidate,
    CallEnded,
    SearchCancelled,
    ChatMessage,
    ReportUser,
}

impl SignalKind {
    /// Wire event name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchPartner => "search-partner",
            Self::MatchFound => "match-found",
            Self::CallOffer => "call-offer",
            Self::CallAnswer => "call-answer",
            Self::IceCandidate => "ice-candidate",
            Self::CallEnded => "call-ended",
            Self::SearchCancelled => "search-cancelled",
            Self::ChatMessage => "chat-message",
            Self::ReportUser => "report-user",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SignalingMessage {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::SearchPartner { .. } => SignalKind::SearchPartner,
            Self::MatchFound { .. } => SignalKind::MatchFound,
            Self::CallOffer { .. } => SignalKind::CallOffer,
            Self::CallAnswer { .. } => SignalKind::CallAnswer,
            Self::Candidate { .. } => SignalKind::IceCandidate,
            Self::CallEnded { .. } => SignalKind::CallEnded,
            Self::SearchCancelled => SignalKind::SearchCancelled,
            Self::Chat { .. } => SignalKind::ChatMessage,
            Self::ReportUser { .. } => SignalKind::ReportUser,
        }
    }

    /// Session tag of a call-scoped message
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::MatchFound { session_id, .. }
            | Self::CallOffer { session_id, .. }
            | Self::CallAnswer { session_id, .. }
            | Self::Candidate { session_id, .. }
            | Self::CallEnded { session_id }
            | Self::Chat { session_id, .. } => session_id.as_ref(),
            _ => None,
        }
    }

    /// Encode as a text frame
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode a text frame
    ///
    /// Web clients emit payload-less events with `data` omitted or `null`;
    /// `call-ended` is normalised to an empty payload before decoding.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        let mut frame: serde_json::Value = serde_json::from_str(text)?;
        if let Some(object) = frame.as_object_mut() {
            let is_call_ended = object.get("event").and_then(|e| e.as_str())
                == Some(SignalKind::CallEnded.as_str());
            if is_call_ended && object.get("data").map_or(true, |d| d.is_null()) {
                object.insert(
                    "data".to_string(),
                    serde_json::Value::Object(serde_json::Map::new()),
                );
            }
        }
        serde_json::from_value(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_less_events() {
        for text in [
            r#"{"event":"call-ended"}"#,
            r#"{"event":"call-ended","data":null}"#,
            r#"{"event":"call-ended","data":{}}"#,
        ] {
            assert_eq!(
                SignalingMessage::from_json(text).unwrap(),
                SignalingMessage::CallEnded { session_id: None },
                "{}",
                text
            );
        }

        for text in [
            r#"{"event":"search-cancelled"}"#,
            r#"{"event":"search-cancelled","data":null}"#,
        ] {
            assert_eq!(
                SignalingMessage::from_json(text).unwrap(),
                SignalingMessage::SearchCancelled,
                "{}",
                text
            );
        }

        let tagged =
            SignalingMessage::from_json(r#"{"event":"call-ended","data":{"sessionId":"s-1"}}"#)
                .unwrap();
        assert_eq!(tagged.session_id(), Some(&SessionId::new("s-1")));
        assert!(SignalingMessage::from_json(r#"{"event":"call-offer"}"#).is_err());
    }

    #[test]
    fn test_legacy_match_found() {
        // Relays that predate session tagging send only the partner
        let text = json!({
            "event": "match-found",
            "data": {
                "partner": {
                    "id": "partner-1",
                    "name": "Demo User",
                    "country": "Virtual Land",
                    "interests": ["Technology", "Movies"]
                }
            }
        })
        .to_string();

        let msg = SignalingMessage::from_json(&text).unwrap();
        match msg {
            SignalingMessage::MatchFound {
                partner,
                session_id,
                role,
            } => {
                assert_eq!(partner.display_name, "Demo User");
                assert_eq!(partner.language, "en");
                assert_eq!(session_id, None);
                assert_eq!(role, CallRole::Caller);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_offer_wire_shape() {
        let msg = SignalingMessage::CallOffer {
            offer: SessionDescription::offer("v=0"),
            session_id: Some(SessionId::new("s-1")),
        };

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "call-offer",
                "data": { "offer": { "type": "offer", "sdp": "v=0" }, "sessionId": "s-1" }
            })
        );
        assert_eq!(msg.kind(), SignalKind::CallOffer);
        assert_eq!(msg.session_id().map(|s| s.as_str()), Some("s-1"));
    }

    #[test]
    fn test_candidate_field_names() {
        let msg = SignalingMessage::Candidate {
            candidate: IceCandidate::new("candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host")
                .with_mid("0", 0),
            session_id: None,
        };

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "ice-candidate");
        assert_eq!(value["data"]["candidate"]["sdpMid"], "0");
        assert_eq!(value["data"]["candidate"]["sdpMLineIndex"], 0);
        assert!(value["data"].get("sessionId").is_none());
    }

    #[test]
    fn test_search_partner_preferences() {
        let msg = SignalingMessage::SearchPartner {
            user_id: "user_1".to_string(),
            preferences: MatchPreferences::default(),
        };

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["data"]["userId"], "user_1");
        assert_eq!(value["data"]["preferences"]["ageRange"], json!([18, 65]));
        assert_eq!(value["data"]["preferences"]["gender"], "any");
    }

    #[test]
    fn test_search_cancelled_has_no_payload() {
        let text = SignalingMessage::SearchCancelled.to_json().unwrap();
        assert_eq!(text, r#"{"event":"search-cancelled"}"#);
        assert_eq!(
            SignalingMessage::from_json(&text).unwrap(),
            SignalingMessage::SearchCancelled
        );
    }

    #[test]
    fn test_report_reason_strings() {
        assert_eq!(
            ReportReason::from("Spam or advertising".to_string()),
            ReportReason::Spam
        );
        assert_eq!(
            ReportReason::from("Harassment".to_string()),
            ReportReason::Harassment
        );
        assert_eq!(
            ReportReason::from("camera pointed at ceiling".to_string()),
            ReportReason::Other("camera pointed at ceiling".to_string())
        );

        let msg = SignalingMessage::ReportUser {
            user_id: "partner-1".to_string(),
            reason: ReportReason::Underage,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["data"]["reason"], "Underage user");
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(SignalingMessage::from_json(r#"{"event":"admin-action","data":{}}"#).is_err());
    }
}

//! Peer-connection configuration

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Public STUN servers used when nothing else is configured
pub const DEFAULT_STUN_SERVERS: [&str; 5] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// Peer-connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Number of ICE candidates to pre-gather
    pub ice_candidate_pool_size: u8,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn_servers: vec![],
            ice_candidate_pool_size: 10,
        }
    }
}

impl RtcConfig {
    /// ICE server list in webrtc-rs form
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];

        for stun_url in &self.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        ice_servers
    }
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs, e.g. `turn:turn.example.com:3478?transport=udp`
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl TurnServer {
    pub fn new(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_uses_public_stun() {
        let config = RtcConfig::default();
        assert_eq!(config.stun_servers.len(), 5);
        assert_eq!(config.ice_candidate_pool_size, 10);
        assert!(config.turn_servers.is_empty());
    }

    #[test]
    fn test_ice_servers_include_turn_credentials() {
        let config = RtcConfig {
            stun_servers: vec!["stun:stun.example.org:3478".into()],
            turn_servers: vec![TurnServer::new("turn:turn.example.org:3478", "alice", "secret")],
            ice_candidate_pool_size: 0,
        };

        let servers = config.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert!(servers[0].username.is_empty());
        assert_eq!(servers[1].username, "alice");
        assert_eq!(servers[1].credential, "secret");
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: RtcConfig = serde_json::from_str(r#"{"ice_candidate_pool_size": 2}"#).unwrap();
        assert_eq!(config.ice_candidate_pool_size, 2);
        assert_eq!(config.stun_servers.len(), 5);
    }
}

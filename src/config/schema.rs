use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::negotiation::MediaConstraints;
use crate::signaling::{MatchPreferences, RetryPolicy};

// Re-export RtcConfig from negotiation module
pub use crate::negotiation::config::{RtcConfig, TurnServer};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Signaling relay settings
    pub signaling: SignalingConfig,
    /// ICE server settings
    pub rtc: RtcConfig,
    /// Capture device settings
    pub media: MediaConfig,
    /// Call session settings
    pub session: SessionConfig,
}

impl AppConfig {
    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if !(self.signaling.relay_url.starts_with("ws://")
            || self.signaling.relay_url.starts_with("wss://"))
        {
            return Err(AppError::Config(format!(
                "relay_url must be a ws:// or wss:// URL, got '{}'",
                self.signaling.relay_url
            )));
        }
        if self.signaling.connect_timeout_ms == 0 {
            return Err(AppError::Config("connect_timeout_ms must be non-zero".to_string()));
        }
        if self.session.max_message_length == 0 {
            return Err(AppError::Config("max_message_length must be non-zero".to_string()));
        }
        let (min_age, max_age) = self.session.default_preferences.age_range;
        if min_age > max_age {
            return Err(AppError::Config(format!(
                "age range {}-{} is empty",
                min_age, max_age
            )));
        }
        self.media.constraints.validate()
    }
}

/// Signaling relay configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the relay
    pub relay_url: String,
    /// Timeout for one connect attempt
    pub connect_timeout_ms: u64,
    /// Delay before the first retry; doubles on every further retry
    pub reconnect_base_delay_ms: u64,
    /// Retries before the link is given up
    pub max_reconnect_attempts: u32,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:3001".to_string(),
            connect_timeout_ms: 10_000,
            reconnect_base_delay_ms: 1_000,
            max_reconnect_attempts: 5,
        }
    }
}

impl SignalingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.reconnect_base_delay_ms),
            self.max_reconnect_attempts,
        )
    }
}

/// Capture device configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Camera device node
    pub video_device: PathBuf,
    /// Microphone device node; the system default when unset
    pub audio_device: Option<PathBuf>,
    pub constraints: MediaConstraints,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            video_device: PathBuf::from("/dev/video0"),
            audio_device: None,
            constraints: MediaConstraints::default(),
        }
    }
}

/// Call session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Longest accepted chat message, in characters
    pub max_message_length: usize,
    /// Preferences used until the user changes them
    pub default_preferences: MatchPreferences,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_length: 500,
            default_preferences: MatchPreferences::default(),
        }
    }
}

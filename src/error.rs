use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Camera/microphone access was refused or the device is missing
    #[error("Media permission denied: {0}")]
    MediaPermissionDenied(String),

    /// Signaling relay is unreachable
    #[error("Signaling transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Malformed or out-of-order signaling payload, or a peer-connection failure
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Remote participant left the call")]
    RemoteAbandoned,

    /// Command issued in a session phase that does not accept it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),
}

impl AppError {
    /// Whether the user can recover by simply trying again.
    ///
    /// Permanent transport loss is reported as `TransportUnavailable` only after
    /// the reconnect budget is exhausted, so it is terminal for the session.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::MediaPermissionDenied(_)
            | AppError::Negotiation(_)
            | AppError::RemoteAbandoned
            | AppError::BadRequest(_)
            | AppError::InvalidState(_) => true,
            AppError::TransportUnavailable(_) => false,
            _ => false,
        }
    }

    /// Human-readable message shown to the user
    pub fn user_message(&self) -> String {
        match self {
            AppError::MediaPermissionDenied(_) => {
                "Failed to access camera. Please allow camera access and try again.".to_string()
            }
            AppError::TransportUnavailable(_) => {
                "Lost connection to the server. Please try again later.".to_string()
            }
            AppError::Negotiation(_) => {
                "The call could not be established. Please try again.".to_string()
            }
            AppError::RemoteAbandoned => "Your partner left the call.".to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(AppError::MediaPermissionDenied("denied".into()).is_retryable());
        assert!(AppError::Negotiation("bad sdp".into()).is_retryable());
        assert!(!AppError::TransportUnavailable("gone".into()).is_retryable());
    }

    #[test]
    fn test_camera_message() {
        let err = AppError::MediaPermissionDenied("NotAllowedError".into());
        assert!(err.user_message().contains("camera access"));
    }
}

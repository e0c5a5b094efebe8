//! Error types for call signaling and peer connection management

/// Result type alias using the call Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up, running or tearing down a call
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Camera, microphone or screen permission denied, or no device available
    #[error("Media access error: {0}")]
    MediaAccess(String),

    /// Signaling channel write could not be committed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A remote description conflicting with the applied one was observed
    #[error("Stale negotiation: {0}")]
    StaleNegotiation(String),

    /// Operation invoked while the session is in an incompatible state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Call record not found
    #[error("Call not found: {0}")]
    NotFound(String),

    /// Signaling document failed schema validation
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// The session was torn down while the operation was in flight
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// User-facing reason a call attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailure {
    /// Camera/microphone/screen access was denied or unavailable
    PermissionDenied,
    /// The peer connection could not be established
    ConnectionFailed,
    /// The signaling channel could not be reached
    SignalingFailed,
}

impl Error {
    /// Check if this error is retryable
    ///
    /// Media access is deliberately excluded: retrying without the user
    /// granting permission cannot succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Persistence(_))
    }

    /// Check if this error should be shown to the user
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            Error::StaleNegotiation(_) | Error::SessionClosed(_) | Error::InvalidState(_)
        )
    }

    /// Check if this error comes from the signaling side
    pub fn is_signaling_error(&self) -> bool {
        matches!(
            self,
            Error::Persistence(_) | Error::NotFound(_) | Error::InvalidData(_)
        )
    }

    /// Map this error to the reason shown to the user, if any
    pub fn failure_reason(&self) -> Option<CallFailure> {
        if !self.is_user_facing() {
            return None;
        }
        Some(match self {
            Error::MediaAccess(_) => CallFailure::PermissionDenied,
            e if e.is_signaling_error() => CallFailure::SignalingFailed,
            _ => CallFailure::ConnectionFailed,
        })
    }
}

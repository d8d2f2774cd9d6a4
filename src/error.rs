use thiserror::Error;

/// Errors from the backend session API
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),
}

/// Session lifecycle errors surfaced to the caller
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to create session: {0}")]
    Create(#[source] ApiError),

    #[error("Failed to start session: {0}")]
    Start(#[source] ApiError),

    #[error("Failed to end session: {0}")]
    End(#[source] ApiError),

    #[error("No session id - create a session first")]
    NoSession,

    #[error("Session already created")]
    AlreadyCreated,

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Session is not active")]
    NotActive,

    #[error("Session has ended - a fresh session requires a new id")]
    Ended,

    #[error(transparent)]
    Audio(#[from] crate::audio::AudioCaptureError),

    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Already recording: {0}")]
    AlreadyRecording(String),

    #[error("Not recording: {0}")]
    NotRecording(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Transport broken: {0}")]
    TransportBroken(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Duplicate requests are reported back to the requester, not treated as failures
    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppError::AlreadyExists(_) | AppError::AlreadyRecording(_))
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;

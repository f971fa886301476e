//! Error types for Rewatch Core

use crate::engine::EngineErrorKind;
use thiserror::Error;

/// Result type alias for playback operations
pub type Result<T> = std::result::Result<T, Error>;

/// Playback error types
#[derive(Error, Debug)]
pub enum Error {
    // Manifest errors
    #[error("Failed to parse manifest: {0}")]
    ManifestParse(String),

    #[error("No permitted quality for media {media_id}")]
    NoPermittedQualities { media_id: String },

    // Permission errors
    #[error("Quality {quality} is not permitted")]
    PermissionDenied { quality: String },

    #[error("Quality {quality} requires login")]
    LoginRequired { quality: String },

    #[error("Unknown quality: {quality}")]
    UnknownQuality { quality: String },

    // Session errors
    #[error("Quality switch not accepted while {state}")]
    QualitySwitchRejected { state: String },

    #[error("Seek not accepted while {state}")]
    SeekRejected { state: String },

    #[error("Invalid playback state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Session has been disposed")]
    SessionDisposed,

    // Engine errors
    #[error("Fatal playback error ({kind}): {reason}")]
    FatalEngine { kind: EngineErrorKind, reason: String },

    #[error("Engine rejected command: {0}")]
    EngineCommand(String),

    // Backend errors
    #[error("Backend returned {status} for {url}")]
    BackendStatus { status: u16, url: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true for the user-facing permission family (deny and re-auth)
    pub fn is_permission_error(&self) -> bool {
        matches!(
            self,
            Error::PermissionDenied { .. } | Error::LoginRequired { .. }
        )
    }

    /// Returns true if playback can continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::PermissionDenied { .. }
                | Error::LoginRequired { .. }
                | Error::UnknownQuality { .. }
                | Error::QualitySwitchRejected { .. }
                | Error::SeekRejected { .. }
                | Error::BackendStatus { .. }
                | Error::Network(_)
        )
    }

    /// Returns the error code for logging and reporting
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::ManifestParse(_) => "MANIFEST_PARSE",
            Error::NoPermittedQualities { .. } => "NO_PERMITTED_QUALITY",
            Error::PermissionDenied { .. } => "PERMISSION_DENIED",
            Error::LoginRequired { .. } => "LOGIN_REQUIRED",
            Error::UnknownQuality { .. } => "UNKNOWN_QUALITY",
            Error::QualitySwitchRejected { .. } => "SWITCH_REJECTED",
            Error::SeekRejected { .. } => "SEEK_REJECTED",
            Error::InvalidStateTransition { .. } => "INVALID_STATE",
            Error::SessionDisposed => "DISPOSED",
            Error::FatalEngine { .. } => "FATAL_ENGINE",
            Error::EngineCommand(_) => "ENGINE_COMMAND",
            Error::BackendStatus { .. } => "BACKEND_STATUS",
            Error::Network(_) => "NETWORK",
            Error::InvalidUrl(_) => "INVALID_URL",
            Error::Json(_) => "JSON",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Internal(_) => "INTERNAL",
            Error::Io(_) => "IO",
        }
    }
}

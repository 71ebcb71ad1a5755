//! Error types for Segue Core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types
#[derive(Error, Debug)]
pub enum Error {
    // Manifest errors
    #[error("Failed to fetch manifest: {0}")]
    ManifestFetch(String),

    #[error("Failed to parse manifest: {0}")]
    ManifestParse(String),

    #[error("Invalid manifest format: {0}")]
    InvalidManifest(String),

    #[error("No suitable rendition found")]
    NoSuitableRendition,

    // Segment errors
    #[error("Failed to fetch segment {url}: {reason}")]
    SegmentFetch { url: String, reason: String },

    #[error("Request timeout: {url}")]
    RequestTimeout { url: String },

    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Request aborted")]
    Aborted,

    // Pipeline errors
    #[error("Transmux failed: {0}")]
    Transmux(String),

    #[error("Buffer sink error: {0}")]
    Sink(String),

    #[error("Codec not supported: {codec}")]
    CodecNotSupported { codec: String },

    // Media element errors
    #[error("Media element error ({code}): {message}")]
    Media { code: u16, message: String },

    #[error("DRM error: {0}")]
    Drm(String),

    #[error("Setup failed: {0}")]
    Setup(String),

    // Native bridge errors
    #[error("Native bridge call {call} failed: {message}")]
    Bridge { call: String, message: String },

    // Ad decision errors
    #[error("Invalid ad response: {0}")]
    AdResponse(String),

    // Playback errors
    #[error("Invalid playback state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Unknown {kind} track: {id}")]
    UnknownTrack { kind: &'static str, id: String },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error taxonomy surfaced to the host in error events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    MediaError,
    NetworkError,
    DrmError,
    SetupError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MediaError => "MEDIA_ERROR",
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::DrmError => "DRM_ERROR",
            ErrorKind::SetupError => "SETUP_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// VAST error codes substituted into `[ERRORCODE]` beacon templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VastErrorCode {
    /// 400: general linear error
    General,
    /// 402: timeout of media file URI
    MediaTimeout,
    /// 403: no supported media file found
    UnsupportedMedia,
    /// 405: problem displaying the media file
    DisplayProblem,
    /// 900: undefined error
    Undefined,
}

impl VastErrorCode {
    pub fn code(&self) -> u16 {
        match self {
            VastErrorCode::General => 400,
            VastErrorCode::MediaTimeout => 402,
            VastErrorCode::UnsupportedMedia => 403,
            VastErrorCode::DisplayProblem => 405,
            VastErrorCode::Undefined => 900,
        }
    }
}

impl Error {
    /// Create a media element error
    pub fn media(code: u16, message: impl Into<String>) -> Self {
        Error::Media {
            code,
            message: message.into(),
        }
    }

    /// Create a native bridge error
    pub fn bridge(call: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Bridge {
            call: call.into(),
            message: message.into(),
        }
    }

    /// Taxonomy bucket for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ManifestFetch(_)
            | Error::SegmentFetch { .. }
            | Error::RequestTimeout { .. }
            | Error::HttpStatus { .. }
            | Error::Aborted
            | Error::AdResponse(_)
            | Error::Network(_)
            | Error::Json(_) => ErrorKind::NetworkError,
            Error::Drm(_) => ErrorKind::DrmError,
            Error::Setup(_) | Error::InvalidConfig(_) | Error::Io(_) | Error::Bridge { .. } => {
                ErrorKind::SetupError
            }
            Error::ManifestParse(_)
            | Error::InvalidManifest(_)
            | Error::NoSuitableRendition
            | Error::Transmux(_)
            | Error::Sink(_)
            | Error::CodecNotSupported { .. }
            | Error::Media { .. }
            | Error::InvalidStateTransition { .. }
            | Error::UnknownTrack { .. }
            | Error::Internal(_) => ErrorKind::MediaError,
        }
    }

    /// Returns true if this error is worth retrying
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::SegmentFetch { .. } | Error::RequestTimeout { .. } | Error::ManifestFetch(_) => {
                true
            }
            Error::HttpStatus { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            _ => false,
        }
    }

    /// Returns true for timeout failures
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::RequestTimeout { .. } => true,
            Error::Network(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// VAST code reported through an ad's error beacon
    pub fn vast_code(&self) -> VastErrorCode {
        match self {
            _ if self.is_timeout() => VastErrorCode::MediaTimeout,
            Error::NoSuitableRendition | Error::CodecNotSupported { .. } => {
                VastErrorCode::UnsupportedMedia
            }
            Error::Media { .. } | Error::Transmux(_) | Error::Sink(_) | Error::Bridge { .. } => {
                VastErrorCode::DisplayProblem
            }
            Error::ManifestFetch(_)
            | Error::ManifestParse(_)
            | Error::InvalidManifest(_)
            | Error::SegmentFetch { .. }
            | Error::HttpStatus { .. }
            | Error::Network(_) => VastErrorCode::General,
            _ => VastErrorCode::Undefined,
        }
    }

    /// Returns the error code for events
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::ManifestFetch(_) => "MANIFEST_FETCH",
            Error::ManifestParse(_) => "MANIFEST_PARSE",
            Error::InvalidManifest(_) => "INVALID_MANIFEST",
            Error::NoSuitableRendition => "NO_RENDITION",
            Error::SegmentFetch { .. } => "SEGMENT_FETCH",
            Error::RequestTimeout { .. } => "TIMEOUT",
            Error::HttpStatus { .. } => "HTTP_STATUS",
            Error::Aborted => "ABORTED",
            Error::Transmux(_) => "TRANSMUX",
            Error::Sink(_) => "BUFFER_SINK",
            Error::CodecNotSupported { .. } => "CODEC_UNSUPPORTED",
            Error::Media { .. } => "MEDIA",
            Error::Drm(_) => "DRM",
            Error::Setup(_) => "SETUP",
            Error::Bridge { .. } => "BRIDGE",
            Error::AdResponse(_) => "AD_RESPONSE",
            Error::InvalidStateTransition { .. } => "INVALID_STATE",
            Error::UnknownTrack { .. } => "UNKNOWN_TRACK",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Network(_) => "NETWORK",
            Error::Json(_) => "JSON",
            Error::Internal(_) => "INTERNAL",
            Error::Io(_) => "IO",
        }
    }
}

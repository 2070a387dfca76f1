//! Error types for chartbundle_core.

use std::fmt;

use thiserror::Error;

/// Classification of a failed tile fetch, as reported by a map source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    /// The request did not complete in time.
    Timeout,
    /// The connection to the tile server could not be established.
    ConnectFailure,
    /// Generic download failure (bad status, truncated body, ...).
    DownloadFailed,
    /// The tile can never be fetched (invalid tile, bad request).
    Unrecoverable,
}

impl FetchErrorKind {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(self) -> bool {
        !matches!(self, FetchErrorKind::Unrecoverable)
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::ConnectFailure => "connect failure",
            FetchErrorKind::DownloadFailed => "download failed",
            FetchErrorKind::Unrecoverable => "unrecoverable",
        };
        f.write_str(name)
    }
}

/// A failed fetch from a map source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Timeout, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::ConnectFailure, message)
    }

    pub fn download(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::DownloadFailed, message)
    }

    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Unrecoverable, message)
    }
}

/// Error types for bundle assembly.
#[derive(Error, Debug)]
pub enum BundleError {
    #[error("Unrecoverable download of {tile}: {reason}")]
    UnrecoverableDownload { tile: String, reason: String },

    #[error("Transient network failure for {tile} ({kind}): {reason}")]
    TransientNetwork {
        tile: String,
        kind: FetchErrorKind,
        reason: String,
    },

    #[error("Preflight test failed: {0}")]
    PreflightTestFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cancelled")]
    Cancelled,

    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("Dispatcher {0} is shut down")]
    Shutdown(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Panicked: {0}")]
    Panicked(String),
}

impl BundleError {
    /// Build the error for a failed fetch of `tile`.
    pub fn from_fetch(tile: impl fmt::Display, err: FetchError) -> Self {
        if err.kind.is_transient() {
            BundleError::TransientNetwork {
                tile: tile.to_string(),
                kind: err.kind,
                reason: err.message,
            }
        } else {
            BundleError::UnrecoverableDownload {
                tile: tile.to_string(),
                reason: err.message,
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BundleError::Cancelled)
    }
}

/// Result type alias for bundle operations.
pub type BundleResult<T> = Result<T, BundleError>;

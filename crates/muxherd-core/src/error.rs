//! Error types for muxherd-core

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for muxherd-core
#[derive(Error, Debug)]
pub enum Error {
    /// The requested multiplexer session does not exist
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// An external collaborator (terminal binary, reservation store) is unavailable
    #[error("dependency missing: {name} ({hint})")]
    DependencyMissing {
        /// Name of the missing dependency
        name: String,
        /// Human hint on how to resolve it
        hint: String,
    },

    /// Caller-supplied option failed validation
    #[error("invalid flag: {0}")]
    InvalidFlag(String),

    /// Wrapped adapter error or parse failure; never a panic
    #[error("internal error: {0}")]
    Internal(String),

    /// Operation was cancelled by an external signal
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// Stable machine-readable code for the error kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::DependencyMissing { .. } => "DEPENDENCY_MISSING",
            Self::InvalidFlag(_) | Self::Config(_) => "INVALID_FLAG",
            Self::Cancelled(_) => "CANCELLED",
            Self::Internal(_) | Self::Io(_) | Self::Json(_) => "INTERNAL_ERROR",
        }
    }

    /// Convenience constructor for a missing terminal multiplexer binary.
    #[must_use]
    pub fn terminal_missing(detail: impl Into<String>) -> Self {
        Self::DependencyMissing {
            name: "terminal multiplexer".to_string(),
            hint: detail.into(),
        }
    }

    /// Convenience constructor for a missing reservation store.
    #[must_use]
    pub fn reservation_store_missing(detail: impl Into<String>) -> Self {
        Self::DependencyMissing {
            name: "reservation store".to_string(),
            hint: detail.into(),
        }
    }
}

//! Error types for the path cache.
//!
//! Errors fall into four groups: configuration/wiring mistakes, addressing
//! problems, storage I/O failures and corrupt durable data. Only storage I/O is
//! considered transient; everything else points at a programming error or at
//! lost state and must not be retried blindly.

use crate::registry::Lifecycle;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    // Configuration errors
    #[error("{type_name} does not provide a codec with a default-construction hook")]
    MissingCodec { type_name: String },

    #[error("No handler registered for {type_name}")]
    NotRegistered { type_name: String },

    #[error("A handler for {type_name} is already registered")]
    AlreadyRegistered { type_name: String },

    #[error("Handlers can only be registered before the cache is started")]
    RegistrationClosed,

    #[error("Cache already started")]
    AlreadyStarted,

    #[error("Cache not running (state: {state})")]
    NotRunning { state: Lifecycle },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Background task failed: {message}")]
    Task { message: String },

    // Addressing errors
    #[error("Invalid cache path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Path {path} conflicts with the shape of the {type_name} cache tree")]
    PathConflict { type_name: String, path: String },

    // Storage errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Data errors
    #[error("Could not deserialize {type_name} from {path:?}: {message}")]
    Corrupt {
        type_name: String,
        path: PathBuf,
        message: String,
    },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl CacheError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        CacheError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Check if the failed operation may succeed when retried.
    ///
    /// Only storage I/O qualifies. Corrupt files and wiring mistakes fail the
    /// same way every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Io { .. })
    }

    /// Check if this error is a configuration or usage mistake.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            CacheError::MissingCodec { .. }
                | CacheError::NotRegistered { .. }
                | CacheError::AlreadyRegistered { .. }
                | CacheError::RegistrationClosed
                | CacheError::AlreadyStarted
                | CacheError::NotRunning { .. }
                | CacheError::Config { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::NotRegistered {
            type_name: "Player".into(),
        };
        assert_eq!(err.to_string(), "No handler registered for Player");

        let err = CacheError::NotRunning {
            state: Lifecycle::Stopped,
        };
        assert_eq!(err.to_string(), "Cache not running (state: stopped)");
    }

    #[test]
    fn test_corrupt_names_type_and_path() {
        let err = CacheError::Corrupt {
            type_name: "Player".into(),
            path: PathBuf::from("data/alice.json"),
            message: "missing field `score`".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Player"));
        assert!(msg.contains("alice.json"));
    }

    #[test]
    fn test_retryable_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert!(CacheError::io_with_path(io, "/tmp/x").is_retryable());
        assert!(!CacheError::Corrupt {
            type_name: "Player".into(),
            path: PathBuf::from("x.json"),
            message: "bad".into(),
        }
        .is_retryable());
        assert!(!CacheError::AlreadyStarted.is_retryable());
    }

    #[test]
    fn test_config_errors() {
        assert!(CacheError::RegistrationClosed.is_config_error());
        assert!(CacheError::MissingCodec {
            type_name: "Player".into()
        }
        .is_config_error());
        assert!(!CacheError::Codec {
            message: "x".into()
        }
        .is_config_error());
    }
}

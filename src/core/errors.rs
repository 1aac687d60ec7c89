//! Custom error types for translation operations

use std::time::Duration;
use thiserror::Error;

use crate::core::models::{SegmentId, SegmentStatus};

/// Typed failure returned by a translation provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Provider asked us to slow down
    #[error("Rate limit exceeded. Retry after {retry_after:?}")]
    RateLimited {
        retry_after: Option<Duration>,
    },

    /// Request did not complete before its deadline
    #[error("Request timeout")]
    Timeout,

    /// Provider answered, but not with usable content
    #[error("Malformed provider response: {message}")]
    Malformed {
        message: String,
    },

    /// Credentials rejected
    #[error("Authentication failed: {message}")]
    Auth {
        message: String,
    },

    /// Anything else (5xx, transport errors, ...)
    #[error("Provider error: {message}")]
    Unknown {
        message: String,
    },
}

impl ProviderError {
    /// Whether the failure should be retried with backoff
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProviderError::Auth { .. })
    }

    /// Short label for counters and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Timeout => "timeout",
            ProviderError::Malformed { .. } => "malformed",
            ProviderError::Auth { .. } => "auth",
            ProviderError::Unknown { .. } => "unknown",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::Malformed {
                message: err.to_string(),
            }
        } else {
            ProviderError::Unknown {
                message: err.to_string(),
            }
        }
    }
}

/// Translation-related errors
#[derive(Error, Debug)]
pub enum TranslationError {
    /// Transition requested on a segment that is not in the expected state
    #[error("Conflict on segment {id}: status is {status}")]
    ConflictError {
        id: SegmentId,
        status: SegmentStatus,
    },

    /// A second, different translation arrived for an already committed segment
    #[error("Stale write rejected for segment {id}")]
    StaleWriteError {
        id: SegmentId,
    },

    /// Segment id not present in the store
    #[error("Unknown segment: {id}")]
    UnknownSegment {
        id: SegmentId,
    },

    /// Response could not be parsed or repaired
    #[error("Malformed response: {message}")]
    MalformedResponse {
        message: String,
    },

    /// Provider failure surfaced to the caller
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Checkpoint could not be read or written
    #[error("Checkpoint error: {path} - {message}")]
    CheckpointError {
        path: String,
        message: String,
    },

    /// Checkpoint belongs to a different document
    #[error("Checkpoint document hash {found} does not match input {expected}")]
    DocumentMismatch {
        expected: String,
        found: String,
    },

    /// Ingested document violates store invariants
    #[error("Invalid document: {message}")]
    InvalidDocument {
        message: String,
    },

    /// File operation error
    #[error("File error: {path} - {message}")]
    FileError {
        path: String,
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        message: String,
    },

    /// Invalid file format
    #[error("Invalid file format: {format}")]
    InvalidFormat {
        format: String,
    },

    /// Background task or pipeline bookkeeping failure
    #[error("Internal error: {0}")]
    InternalError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Reqwest error
    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

impl TranslationError {
    /// Shorthand for configuration errors
    pub fn config(message: impl Into<String>) -> Self {
        TranslationError::ConfigError {
            message: message.into(),
        }
    }
}

/// Result type for translation operations
pub type Result<T> = std::result::Result<T, TranslationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_cross_into_anyhow_only_at_the_boundary() {
        let err: anyhow::Error = TranslationError::config("missing key").into();
        assert!(matches!(
            err.downcast_ref::<TranslationError>(),
            Some(TranslationError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_only_auth_is_fatal() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::RateLimited { retry_after: None }.is_transient());
        assert!(ProviderError::Malformed { message: "x".into() }.is_transient());
        assert!(ProviderError::Unknown { message: "502".into() }.is_transient());
        assert!(!ProviderError::Auth { message: "401".into() }.is_transient());
    }
}

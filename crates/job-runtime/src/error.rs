//! Error types for job publishing, consumption and backend lifecycle.

use crate::config::BackendKind;
use std::time::Duration;
use thiserror::Error;

/// Error returned by a job processor.
///
/// Processors are application code, so any error type converts into this one.
/// A processing error is never surfaced to the publisher; it is handed to the
/// backend's retry policy.
pub type ProcessingError = anyhow::Error;

/// Comprehensive error type for all job runtime operations
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Connection to '{address}' failed: {message}")]
    Connect { address: String, message: String },

    #[error("Publish to '{topic}' failed: {message}")]
    Publish { topic: String, message: String },

    #[error("Invalid scheduled time '{value}': {message}")]
    InvalidSchedule { value: String, message: String },

    #[error("Broker error ({backend}): {code} - {message}")]
    Broker {
        backend: BackendKind,
        code: String,
        message: String,
    },

    #[error("Protocol error ({backend}): {message}")]
    Protocol {
        backend: BackendKind,
        message: String,
    },

    #[error("Dead-letter requeue to '{topic}' failed: {message}")]
    Requeue { topic: String, message: String },

    #[error("'{capability}' is not supported by the {backend} backend")]
    Unsupported {
        capability: &'static str,
        backend: BackendKind,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

impl JobError {
    /// Check if error is transient and the operation could succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect { .. } => true,
            Self::Publish { .. } => true,
            Self::InvalidSchedule { .. } => false,
            Self::Broker { .. } => true,
            Self::Protocol { .. } => false,
            Self::Requeue { .. } => true,
            Self::Unsupported { .. } => false,
            Self::Timeout { .. } => true,
            Self::Io(_) => true,
            Self::Serialization(_) => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
            Self::Lifecycle(_) => false,
        }
    }

    /// Check if the error means the underlying connection can no longer be used
    pub fn is_connection_broken(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Timeout { .. } | Self::Protocol { .. } | Self::Connect { .. }
        )
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Connect { .. } => Some(Duration::from_secs(5)),
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::Io(_) => Some(Duration::from_secs(1)),
            Self::Broker { .. } => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    pub(crate) fn unsupported(capability: &'static str, backend: BackendKind) -> Self {
        Self::Unsupported {
            capability,
            backend,
        }
    }
}

/// Errors during job serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Frame of {size} bytes exceeds limit of {max_size} bytes")]
    FrameTooLarge { size: usize, max_size: usize },

    #[error("Malformed frame: {message}")]
    MalformedFrame { message: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Errors raised by misuse of the start/stop lifecycle
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Backend has already been started")]
    AlreadyStarted,

    #[error("Backend has been stopped and cannot be restarted")]
    Stopped,

    #[error("Processors have already been registered")]
    ProcessorsAlreadySet,
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

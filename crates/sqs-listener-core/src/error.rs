//! Error types for the listener container.
//!
//! Each concern has its own enum: configuration validation, payload
//! conversion, backend calls, message processing and container lifecycle.

use crate::message::MessageId;
use std::time::Duration;
use thiserror::Error;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;

// ============================================================================
// Backend Errors
// ============================================================================

/// Errors returned by a queue backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Receipt handle is invalid or expired: {receipt}")]
    InvalidReceipt { receipt: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Permission denied for operation: {operation}")]
    PermissionDenied { operation: String },

    #[error("Request throttled: {message}")]
    Throttled { message: String },

    #[error("Batch size {size} exceeds maximum {max_size}")]
    BatchTooLarge { size: usize, max_size: usize },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },
}

impl BackendError {
    /// Check if the error is transient and the call can be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::InvalidReceipt { .. } => false,
            Self::Timeout { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::PermissionDenied { .. } => false,
            Self::Throttled { .. } => true,
            Self::BatchTooLarge { .. } => false,
            Self::ProviderError { .. } => true,
        }
    }

    /// Get a suggested minimum delay before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::ConnectionFailed { .. } => Some(Duration::from_secs(2)),
            Self::Throttled { .. } => Some(Duration::from_secs(5)),
            _ => None,
        }
    }
}

// ============================================================================
// Conversion Errors
// ============================================================================

/// Errors raised while turning a raw payload into a typed message
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Could not read JSON: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
    },

    #[error("Payload: '{payload}' does not contain a {attribute} attribute")]
    MissingAttribute { payload: String, attribute: String },

    #[error("Payload: '{payload}' is not a valid notification")]
    NotANotification { payload: String },

    #[error("Payload: '{payload}' does not contain a message")]
    MissingMessage { payload: String },

    #[error("Payload could not be converted to {target}: {message}")]
    Deserialization {
        target: &'static str,
        message: String,
    },

    #[error("Payload could not be written: {message}")]
    Serialization { message: String },

    #[error("{0}")]
    Unsupported(&'static str),
}

// ============================================================================
// Processing Errors
// ============================================================================

/// Failure reported by an interceptor, listener or error handler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    #[error("Listener failed: {message}")]
    Listener { message: String },

    #[error("Interceptor rejected message: {message}")]
    Interceptor { message: String },

    #[error("Message could not be converted: {message}")]
    Conversion { message: String },
}

impl ProcessingError {
    pub fn listener(message: impl std::fmt::Display) -> Self {
        Self::Listener {
            message: message.to_string(),
        }
    }

    pub fn interceptor(message: impl std::fmt::Display) -> Self {
        Self::Interceptor {
            message: message.to_string(),
        }
    }
}

impl From<ConversionError> for ProcessingError {
    fn from(error: ConversionError) -> Self {
        Self::Conversion {
            message: error.to_string(),
        }
    }
}

/// Failure of a batch listener invocation.
///
/// `failed` names the messages that did not succeed. An empty list fails the
/// whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Batch processing failed for {} message(s): {error}", failed.len())]
pub struct BatchListenerError {
    pub failed: Vec<MessageId>,
    pub error: ProcessingError,
}

impl BatchListenerError {
    /// Fail every message of the batch
    pub fn all(error: ProcessingError) -> Self {
        Self {
            failed: Vec::new(),
            error,
        }
    }

    /// Fail only the named messages
    pub fn partial(failed: Vec<MessageId>, error: ProcessingError) -> Self {
        Self { failed, error }
    }

    pub fn is_whole_batch(&self) -> bool {
        self.failed.is_empty()
    }
}

// ============================================================================
// Acknowledgement Errors
// ============================================================================

/// Errors raised by the acknowledgement state machine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcknowledgementError {
    #[error("Invalid acknowledgement transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

// ============================================================================
// Container Errors
// ============================================================================

/// Errors raised by the container lifecycle
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Container is already running")]
    AlreadyRunning,

    #[error("Container is not running")]
    NotRunning,

    #[error("Container has no queues to listen on")]
    NoQueues,

    #[error("Container requires a tokio runtime")]
    NoRuntime,

    #[error("Container component '{component}' was not configured")]
    NotConfigured { component: &'static str },

    #[error("Invalid container options: {0}")]
    Validation(#[from] ValidationError),
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Errors raised while loading listener settings
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(error: config::ConfigError) -> Self {
        Self::Parsing {
            message: error.to_string(),
        }
    }
}

/// Validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

//! Message types flowing through the container, including core identifiers.

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

/// Suffix that marks a FIFO queue
pub const FIFO_SUFFIX: &str = ".fifo";

const MAX_QUEUE_NAME_LENGTH: usize = 80;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue identifier.
///
/// Accepts either a bare queue name (`orders`, `orders.fifo`) or a full queue
/// URL. For URLs the last path segment is validated as the queue name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.starts_with("https://") || name.starts_with("http://") {
            let url = url::Url::parse(&name).map_err(|e| ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: format!("invalid queue URL: {}", e),
            })?;

            let segment = url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or_default();
            validate_bare_name(segment)?;
            return Ok(Self(name));
        }

        validate_bare_name(&name)?;
        Ok(Self(name))
    }

    /// Get the queue identifier as given
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is a full queue URL
    pub fn is_url(&self) -> bool {
        self.0.starts_with("https://") || self.0.starts_with("http://")
    }

    /// The bare queue name, without any URL prefix
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Whether the queue is a FIFO queue
    pub fn is_fifo(&self) -> bool {
        self.name().ends_with(FIFO_SUFFIX)
    }
}

fn validate_bare_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > MAX_QUEUE_NAME_LENGTH {
        return Err(ValidationError::OutOfRange {
            field: "queue_name".to_string(),
            message: format!("must be 1-{} characters", MAX_QUEUE_NAME_LENGTH),
        });
    }

    let base = name.strip_suffix(FIFO_SUFFIX).unwrap_or(name);
    if base.is_empty()
        || !base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidFormat {
            field: "queue_name".to_string(),
            message: "only ASCII alphanumeric, hyphens, and underscores allowed".to_string(),
        });
    }

    Ok(())
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Identifier assigned to a message by the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque token proving receipt, required to delete a message or change its
/// visibility
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: String) -> Self {
        Self(handle)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Received Messages
// ============================================================================

/// A message as returned by a backend receive call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub receipt_handle: ReceiptHandle,
    pub body: String,
    pub message_attributes: HashMap<String, String>,
    pub system_attributes: HashMap<String, String>,
}

impl ReceivedMessage {
    pub fn new(message_id: MessageId, receipt_handle: ReceiptHandle, body: impl Into<String>) -> Self {
        Self {
            message_id,
            receipt_handle,
            body: body.into(),
            message_attributes: HashMap::new(),
            system_attributes: HashMap::new(),
        }
    }

    pub fn with_message_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.message_attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_system_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.system_attributes.insert(key.into(), value.into());
        self
    }
}

/// A received message owned by the container.
///
/// Built by the poller; moves from sink to pipeline and is never shared
/// between stages.
#[derive(Debug)]
pub struct MessageEnvelope {
    pub queue: QueueName,
    pub message_id: MessageId,
    pub receipt_handle: ReceiptHandle,
    pub body: String,
    pub message_attributes: HashMap<String, String>,
    pub system_attributes: HashMap<String, String>,
    pub queue_attributes: Arc<HashMap<String, String>>,
    /// Per-queue receive order, starting at zero for each container start
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn from_received(
        queue: QueueName,
        received: ReceivedMessage,
        sequence: u64,
        queue_attributes: Arc<HashMap<String, String>>,
    ) -> Self {
        Self {
            queue,
            message_id: received.message_id,
            receipt_handle: received.receipt_handle,
            body: received.body,
            message_attributes: received.message_attributes,
            system_attributes: received.system_attributes,
            queue_attributes,
            sequence,
            received_at: Utc::now(),
        }
    }

    pub fn message_attribute(&self, name: &str) -> Option<&str> {
        self.message_attributes.get(name).map(String::as_str)
    }

    pub fn system_attribute(&self, name: &str) -> Option<&str> {
        self.system_attributes.get(name).map(String::as_str)
    }

    /// Message group of a FIFO message
    pub fn message_group_id(&self) -> Option<&str> {
        self.system_attribute("MessageGroupId")
    }

    /// Number of times the backend has delivered this message
    pub fn receive_count(&self) -> Option<u32> {
        self.system_attribute("ApproximateReceiveCount")
            .and_then(|count| count.parse().ok())
    }
}

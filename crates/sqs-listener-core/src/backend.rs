//! Queue backend abstraction.
//!
//! The container talks to SQS only through [`QueueBackend`]. Implementations
//! live in [`crate::providers`].

use crate::error::BackendError;
use crate::message::{QueueName, ReceiptHandle, ReceivedMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

#[cfg(test)]
#[path = "backend_tests.rs"]
mod tests;

/// Maximum number of entries in one batched delete or visibility call
pub const MAX_BATCH_SIZE: usize = 10;

// ============================================================================
// Requests and Results
// ============================================================================

/// Parameters of a single receive call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub max_messages: usize,
    pub wait_time: Duration,
    pub visibility_timeout: Option<Duration>,
    pub message_attribute_names: Vec<String>,
    pub system_attribute_names: Vec<String>,
}

impl Default for ReceiveRequest {
    fn default() -> Self {
        Self {
            max_messages: MAX_BATCH_SIZE,
            wait_time: Duration::ZERO,
            visibility_timeout: None,
            message_attribute_names: Vec::new(),
            system_attribute_names: Vec::new(),
        }
    }
}

/// Per-entry failure of a batched call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntryFailure {
    pub receipt_handle: ReceiptHandle,
    pub code: String,
    pub message: String,
    /// The request itself was wrong; retrying it cannot succeed
    pub sender_fault: bool,
}

/// Outcome of a batched delete or visibility change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOperationResult {
    pub successful: Vec<ReceiptHandle>,
    pub failed: Vec<BatchEntryFailure>,
}

impl BatchOperationResult {
    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Receipt handles whose failure may succeed on another attempt
    pub fn retryable(&self) -> Vec<ReceiptHandle> {
        self.failed
            .iter()
            .filter(|failure| !failure.sender_fault)
            .map(|failure| failure.receipt_handle.clone())
            .collect()
    }
}

// ============================================================================
// Backend Trait
// ============================================================================

/// Operations the container needs from a queue service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Receive up to `request.max_messages` messages, waiting at most
    /// `request.wait_time` for the first one
    async fn receive_messages(
        &self,
        queue: &QueueName,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, BackendError>;

    /// Delete up to [`MAX_BATCH_SIZE`] messages
    async fn delete_messages(
        &self,
        queue: &QueueName,
        receipts: &[ReceiptHandle],
    ) -> Result<BatchOperationResult, BackendError>;

    /// Change the visibility timeout of up to [`MAX_BATCH_SIZE`] messages
    async fn change_visibility(
        &self,
        queue: &QueueName,
        receipts: &[ReceiptHandle],
        visibility: Duration,
    ) -> Result<BatchOperationResult, BackendError>;

    /// Fetch queue attributes by name
    async fn queue_attributes(
        &self,
        _queue: &QueueName,
        _names: &[String],
    ) -> Result<HashMap<String, String>, BackendError> {
        Ok(HashMap::new())
    }
}

/// Split receipts into chunks a single batched call accepts
pub fn batch_chunks(receipts: &[ReceiptHandle]) -> impl Iterator<Item = &[ReceiptHandle]> {
    receipts.chunks(MAX_BATCH_SIZE)
}

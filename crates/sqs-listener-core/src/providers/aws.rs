//! AWS SQS backend.
//!
//! Binds [`QueueBackend`] to the official `aws-sdk-sqs` client. Queue names
//! are resolved to queue URLs once through `GetQueueUrl` and cached; queue
//! identifiers that already are URLs are used directly.
//!
//! ## Error mapping
//!
//! Service error codes map onto [`BackendError`] variants so that the
//! poller and acknowledgement coordinator can decide whether to retry:
//! missing queues, authentication and permission problems are permanent,
//! throttling and dispatch failures are transient.

use crate::backend::{
    BatchEntryFailure, BatchOperationResult, QueueBackend, ReceiveRequest, MAX_BATCH_SIZE,
};
use crate::error::BackendError;
use crate::message::{MessageId, QueueName, ReceiptHandle, ReceivedMessage};
use async_trait::async_trait;
use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_sqs::types::{
    ChangeMessageVisibilityBatchRequestEntry, DeleteMessageBatchRequestEntry, Message,
    MessageSystemAttributeName, QueueAttributeName,
};
use aws_sdk_sqs::Client;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "aws_tests.rs"]
mod tests;

const PROVIDER: &str = "AwsSqs";

/// Longest wait a receive call accepts, in seconds
const MAX_WAIT_SECONDS: i32 = 20;

/// SQS-backed queue backend
pub struct SqsBackend {
    client: Client,
    queue_urls: RwLock<HashMap<QueueName, String>>,
}

impl SqsBackend {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            queue_urls: RwLock::new(HashMap::new()),
        }
    }

    /// Build a client from the standard AWS environment (credentials chain,
    /// region), optionally overriding the endpoint for local emulators
    pub async fn from_env(endpoint_url: Option<&str>) -> Self {
        let mut loader = aws_config::from_env();
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let config = loader.load().await;
        Self::new(Client::new(&config))
    }

    /// Resolve the queue URL, caching lookups by name
    async fn queue_url(&self, queue: &QueueName) -> Result<String, BackendError> {
        if queue.is_url() {
            return Ok(queue.as_str().to_string());
        }

        {
            let cache = self.queue_urls.read().await;
            if let Some(url) = cache.get(queue) {
                return Ok(url.clone());
            }
        }

        let output = self
            .client
            .get_queue_url()
            .queue_name(queue.name())
            .send()
            .await
            .map_err(|e| map_sdk_error("GetQueueUrl", queue, e))?;

        let url = output
            .queue_url()
            .ok_or_else(|| BackendError::QueueNotFound {
                queue_name: queue.to_string(),
            })?
            .to_string();

        debug!(queue = %queue, queue_url = %url, "Resolved queue URL");
        self.queue_urls
            .write()
            .await
            .insert(queue.clone(), url.clone());

        Ok(url)
    }
}

#[async_trait]
impl QueueBackend for SqsBackend {
    async fn receive_messages(
        &self,
        queue: &QueueName,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, BackendError> {
        let url = self.queue_url(queue).await?;

        let system_attribute_names = request
            .system_attribute_names
            .iter()
            .map(|name| MessageSystemAttributeName::from(name.as_str()))
            .collect();

        let mut call = self
            .client
            .receive_message()
            .queue_url(url)
            .max_number_of_messages(clamp_count(request.max_messages))
            .wait_time_seconds(to_seconds(request.wait_time).min(MAX_WAIT_SECONDS))
            .set_message_attribute_names(Some(request.message_attribute_names.clone()))
            .set_message_system_attribute_names(Some(system_attribute_names));

        if let Some(visibility) = request.visibility_timeout {
            call = call.visibility_timeout(to_seconds(visibility));
        }

        let output = call
            .send()
            .await
            .map_err(|e| map_sdk_error("ReceiveMessage", queue, e))?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|message| {
                let converted = convert_message(message);
                if converted.is_none() {
                    warn!(queue = %queue, "Skipping SQS message without id or receipt handle");
                }
                converted
            })
            .collect();

        Ok(messages)
    }

    async fn delete_messages(
        &self,
        queue: &QueueName,
        receipts: &[ReceiptHandle],
    ) -> Result<BatchOperationResult, BackendError> {
        if receipts.is_empty() {
            return Ok(BatchOperationResult::default());
        }
        check_batch_size(receipts)?;

        let url = self.queue_url(queue).await?;
        let entries = receipts
            .iter()
            .enumerate()
            .map(|(index, receipt)| {
                DeleteMessageBatchRequestEntry::builder()
                    .id(index.to_string())
                    .receipt_handle(receipt.as_str())
                    .build()
                    .map_err(|e| build_error("DeleteMessageBatch", e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .client
            .delete_message_batch()
            .queue_url(url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| map_sdk_error("DeleteMessageBatch", queue, e))?;

        let successful = output.successful().iter().map(|entry| entry.id());
        let failed = output.failed().iter().map(|entry| {
            (
                entry.id(),
                entry.code(),
                entry.message().unwrap_or_default(),
                entry.sender_fault(),
            )
        });

        Ok(collect_batch_result(receipts, successful, failed))
    }

    async fn change_visibility(
        &self,
        queue: &QueueName,
        receipts: &[ReceiptHandle],
        visibility: Duration,
    ) -> Result<BatchOperationResult, BackendError> {
        if receipts.is_empty() {
            return Ok(BatchOperationResult::default());
        }
        check_batch_size(receipts)?;

        let url = self.queue_url(queue).await?;
        let seconds = to_seconds(visibility);
        let entries = receipts
            .iter()
            .enumerate()
            .map(|(index, receipt)| {
                ChangeMessageVisibilityBatchRequestEntry::builder()
                    .id(index.to_string())
                    .receipt_handle(receipt.as_str())
                    .visibility_timeout(seconds)
                    .build()
                    .map_err(|e| build_error("ChangeMessageVisibilityBatch", e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .client
            .change_message_visibility_batch()
            .queue_url(url)
            .set_entries(Some(entries))
            .send()
            .await
            .map_err(|e| map_sdk_error("ChangeMessageVisibilityBatch", queue, e))?;

        let successful = output.successful().iter().map(|entry| entry.id());
        let failed = output.failed().iter().map(|entry| {
            (
                entry.id(),
                entry.code(),
                entry.message().unwrap_or_default(),
                entry.sender_fault(),
            )
        });

        Ok(collect_batch_result(receipts, successful, failed))
    }

    async fn queue_attributes(
        &self,
        queue: &QueueName,
        names: &[String],
    ) -> Result<HashMap<String, String>, BackendError> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }

        let url = self.queue_url(queue).await?;
        let attribute_names = names
            .iter()
            .map(|name| QueueAttributeName::from(name.as_str()))
            .collect();

        let output = self
            .client
            .get_queue_attributes()
            .queue_url(url)
            .set_attribute_names(Some(attribute_names))
            .send()
            .await
            .map_err(|e| map_sdk_error("GetQueueAttributes", queue, e))?;

        Ok(output
            .attributes()
            .map(|attributes| {
                attributes
                    .iter()
                    .map(|(name, value)| (name.as_str().to_string(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ============================================================================
// Conversion Helpers
// ============================================================================

fn convert_message(message: &Message) -> Option<ReceivedMessage> {
    let message_id: MessageId = message.message_id()?.parse().ok()?;
    let receipt_handle = ReceiptHandle::new(message.receipt_handle()?.to_string());

    let system_attributes = message
        .attributes()
        .map(|attributes| {
            attributes
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.clone()))
                .collect()
        })
        .unwrap_or_default();

    // Binary attribute values are not carried
    let message_attributes = message
        .message_attributes()
        .map(|attributes| {
            attributes
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .string_value()
                        .map(|text| (name.clone(), text.to_string()))
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ReceivedMessage {
        message_id,
        receipt_handle,
        body: message.body().unwrap_or_default().to_string(),
        message_attributes,
        system_attributes,
    })
}

/// Map batch entry ids (request indices) back to receipt handles
fn collect_batch_result<'a>(
    receipts: &[ReceiptHandle],
    successful: impl Iterator<Item = &'a str>,
    failed: impl Iterator<Item = (&'a str, &'a str, &'a str, bool)>,
) -> BatchOperationResult {
    let lookup = |id: &str| {
        id.parse::<usize>()
            .ok()
            .and_then(|index| receipts.get(index))
            .cloned()
    };

    BatchOperationResult {
        successful: successful.filter_map(lookup).collect(),
        failed: failed
            .filter_map(|(id, code, message, sender_fault)| {
                lookup(id).map(|receipt_handle| BatchEntryFailure {
                    receipt_handle,
                    code: code.to_string(),
                    message: message.to_string(),
                    sender_fault,
                })
            })
            .collect(),
    }
}

fn check_batch_size(receipts: &[ReceiptHandle]) -> Result<(), BackendError> {
    if receipts.len() > MAX_BATCH_SIZE {
        return Err(BackendError::BatchTooLarge {
            size: receipts.len(),
            max_size: MAX_BATCH_SIZE,
        });
    }
    Ok(())
}

fn clamp_count(count: usize) -> i32 {
    i32::try_from(count.clamp(1, MAX_BATCH_SIZE)).unwrap_or(1)
}

fn to_seconds(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

fn build_error(operation: &str, error: impl std::fmt::Display) -> BackendError {
    BackendError::ProviderError {
        provider: PROVIDER.to_string(),
        code: "InvalidRequest".to_string(),
        message: format!("{}: {}", operation, error),
    }
}

/// Map an SDK error onto the backend error categories
fn map_sdk_error<E>(operation: &str, queue: &QueueName, error: SdkError<E>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let details = DisplayErrorContext(&error).to_string();

    match &error {
        SdkError::TimeoutError(_) => BackendError::Timeout {
            duration: Duration::ZERO,
        },
        SdkError::DispatchFailure(_) => BackendError::ConnectionFailed { message: details },
        SdkError::ServiceError(context) => {
            let code = context.err().code().unwrap_or("Unknown");
            classify_service_error(operation, queue, code, details)
        }
        _ => BackendError::ProviderError {
            provider: PROVIDER.to_string(),
            code: operation.to_string(),
            message: details,
        },
    }
}

fn classify_service_error(
    operation: &str,
    queue: &QueueName,
    code: &str,
    details: String,
) -> BackendError {
    match code {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            BackendError::QueueNotFound {
                queue_name: queue.to_string(),
            }
        }
        "InvalidClientTokenId" | "UnrecognizedClientException" | "SignatureDoesNotMatch"
        | "ExpiredToken" => BackendError::AuthenticationFailed { message: details },
        "AccessDenied" | "AccessDeniedException" => BackendError::PermissionDenied {
            operation: operation.to_string(),
        },
        "ThrottlingException" | "RequestThrottled" | "OverLimit" => {
            BackendError::Throttled { message: details }
        }
        "ReceiptHandleIsInvalid" => BackendError::InvalidReceipt { receipt: details },
        "AWS.SimpleQueueService.TooManyEntriesInBatchRequest" | "TooManyEntriesInBatchRequest" => {
            BackendError::BatchTooLarge {
                size: MAX_BATCH_SIZE + 1,
                max_size: MAX_BATCH_SIZE,
            }
        }
        other => BackendError::ProviderError {
            provider: PROVIDER.to_string(),
            code: other.to_string(),
            message: details,
        },
    }
}

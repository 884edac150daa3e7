//! In-memory queue backend for testing and development.
//!
//! This backend provides:
//! - FIFO receive order with long polling
//! - Visibility timeouts, after which unacknowledged messages reappear
//! - Recorded delete and visibility calls for assertions
//! - Injectable receive and delete failures
//!
//! It is used by the test suites and by the CLI's demo mode.

use crate::backend::{BatchEntryFailure, BatchOperationResult, QueueBackend, ReceiveRequest};
use crate::error::BackendError;
use crate::message::{MessageId, QueueName, ReceiptHandle, ReceivedMessage};
use crate::options::ALL_ATTRIBUTES;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Configuration for the in-memory backend
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Visibility timeout applied when a receive does not override it
    pub visibility_timeout: Duration,
    /// How often a waiting receive re-checks for expired visibility
    pub poll_interval: Duration,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// One recorded delete call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteCall {
    pub queue: QueueName,
    pub message_ids: Vec<MessageId>,
}

/// One recorded visibility change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilityChange {
    pub queue: QueueName,
    pub message_id: MessageId,
    pub visibility: Duration,
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Default)]
struct QueueStorage {
    queues: HashMap<QueueName, InMemoryQueue>,
    receive_failures: u32,
    delete_failures: u32,
    receive_calls: usize,
    delete_calls: Vec<DeleteCall>,
    visibility_changes: Vec<VisibilityChange>,
}

impl QueueStorage {
    fn queue_mut(&mut self, queue: &QueueName) -> Result<&mut InMemoryQueue, BackendError> {
        self.queues
            .get_mut(queue)
            .ok_or_else(|| BackendError::QueueNotFound {
                queue_name: queue.to_string(),
            })
    }
}

#[derive(Default)]
struct InMemoryQueue {
    available: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlightEntry>,
    attributes: HashMap<String, String>,
    deleted: Vec<MessageId>,
}

impl InMemoryQueue {
    /// Return messages whose visibility expired to the available list
    fn restore_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        let mut restored: Vec<StoredMessage> = expired
            .into_iter()
            .filter_map(|receipt| self.in_flight.remove(&receipt))
            .map(|entry| entry.message)
            .collect();
        restored.sort_by_key(|message| message.position);

        for message in restored.into_iter().rev() {
            self.available.push_front(message);
        }
    }

    fn take(
        &mut self,
        request: &ReceiveRequest,
        visibility: Duration,
        now: Instant,
    ) -> Vec<ReceivedMessage> {
        let mut received = Vec::new();

        while received.len() < request.max_messages {
            let Some(mut message) = self.available.pop_front() else {
                break;
            };

            message.receive_count += 1;
            let receipt = uuid::Uuid::new_v4().to_string();
            received.push(message.to_received(&receipt, request));

            self.in_flight.insert(
                receipt,
                InFlightEntry {
                    message,
                    visible_at: now + visibility,
                },
            );
        }

        received
    }
}

#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    body: String,
    attributes: HashMap<String, String>,
    group_id: Option<String>,
    sent_timestamp: i64,
    receive_count: u32,
    position: u64,
}

impl StoredMessage {
    fn to_received(&self, receipt: &str, request: &ReceiveRequest) -> ReceivedMessage {
        let mut system = HashMap::new();
        system.insert(
            "ApproximateReceiveCount".to_string(),
            self.receive_count.to_string(),
        );
        system.insert("SentTimestamp".to_string(), self.sent_timestamp.to_string());
        if let Some(group) = &self.group_id {
            system.insert("MessageGroupId".to_string(), group.clone());
        }

        ReceivedMessage {
            message_id: self.message_id.clone(),
            receipt_handle: ReceiptHandle::new(receipt.to_string()),
            body: self.body.clone(),
            message_attributes: select_attributes(&self.attributes, &request.message_attribute_names),
            system_attributes: select_attributes(&system, &request.system_attribute_names),
        }
    }
}

struct InFlightEntry {
    message: StoredMessage,
    visible_at: Instant,
}

fn select_attributes(
    attributes: &HashMap<String, String>,
    names: &[String],
) -> HashMap<String, String> {
    if names.iter().any(|name| name == ALL_ATTRIBUTES || name == ".*") {
        return attributes.clone();
    }

    attributes
        .iter()
        .filter(|(key, _)| names.iter().any(|name| name == *key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

// ============================================================================
// InMemoryBackend
// ============================================================================

/// In-memory queue backend.
///
/// Clones share the same storage, so a test can keep a handle for
/// assertions while the container owns another.
#[derive(Clone)]
pub struct InMemoryBackend {
    storage: Arc<Mutex<QueueStorage>>,
    arrivals: Arc<Notify>,
    config: InMemoryConfig,
}

impl InMemoryBackend {
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            storage: Arc::new(Mutex::new(QueueStorage::default())),
            arrivals: Arc::new(Notify::new()),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueStorage> {
        self.storage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty queue; existing queues are left untouched
    pub fn create_queue(&self, queue: &QueueName) {
        self.lock().queues.entry(queue.clone()).or_default();
    }

    pub fn set_queue_attribute(&self, queue: &QueueName, name: &str, value: &str) {
        self.lock()
            .queues
            .entry(queue.clone())
            .or_default()
            .attributes
            .insert(name.to_string(), value.to_string());
    }

    /// Enqueue a message, creating the queue if needed
    pub fn send_message(&self, queue: &QueueName, body: impl Into<String>) -> MessageId {
        self.enqueue(queue, body.into(), HashMap::new(), None)
    }

    pub fn send_message_with_attributes(
        &self,
        queue: &QueueName,
        body: impl Into<String>,
        attributes: HashMap<String, String>,
    ) -> MessageId {
        self.enqueue(queue, body.into(), attributes, None)
    }

    pub fn send_message_to_group(
        &self,
        queue: &QueueName,
        body: impl Into<String>,
        group_id: impl Into<String>,
    ) -> MessageId {
        self.enqueue(queue, body.into(), HashMap::new(), Some(group_id.into()))
    }

    fn enqueue(
        &self,
        queue: &QueueName,
        body: String,
        attributes: HashMap<String, String>,
        group_id: Option<String>,
    ) -> MessageId {
        let message_id = MessageId::generate();
        {
            let mut storage = self.lock();
            let state = storage.queues.entry(queue.clone()).or_default();
            let position = (state.available.len() + state.in_flight.len() + state.deleted.len()) as u64;
            state.available.push_back(StoredMessage {
                message_id: message_id.clone(),
                body,
                attributes,
                group_id,
                sent_timestamp: Utc::now().timestamp_millis(),
                receive_count: 0,
                position,
            });
        }
        self.arrivals.notify_waiters();
        message_id
    }

    /// Fail the next `count` receive calls with a connection error
    pub fn fail_next_receives(&self, count: u32) {
        self.lock().receive_failures = count;
    }

    /// Fail the next `count` delete calls with a connection error
    pub fn fail_next_deletes(&self, count: u32) {
        self.lock().delete_failures = count;
    }

    /// Messages waiting to be received
    pub fn available_count(&self, queue: &QueueName) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |state| state.available.len())
    }

    /// Messages received but neither deleted nor visible again
    pub fn in_flight_count(&self, queue: &QueueName) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |state| state.in_flight.len())
    }

    /// Ids of deleted messages in deletion order
    pub fn deleted_message_ids(&self, queue: &QueueName) -> Vec<MessageId> {
        self.lock()
            .queues
            .get(queue)
            .map(|state| state.deleted.clone())
            .unwrap_or_default()
    }

    pub fn delete_calls(&self) -> Vec<DeleteCall> {
        self.lock().delete_calls.clone()
    }

    pub fn visibility_changes(&self) -> Vec<VisibilityChange> {
        self.lock().visibility_changes.clone()
    }

    pub fn receive_calls(&self) -> usize {
        self.lock().receive_calls
    }

    fn try_receive(
        &self,
        queue: &QueueName,
        request: &ReceiveRequest,
        deadline: Instant,
    ) -> Result<Option<Vec<ReceivedMessage>>, BackendError> {
        let mut storage = self.lock();

        if storage.receive_failures > 0 {
            storage.receive_failures -= 1;
            storage.receive_calls += 1;
            return Err(BackendError::ConnectionFailed {
                message: "injected receive failure".to_string(),
            });
        }

        let now = Instant::now();
        let visibility = request
            .visibility_timeout
            .unwrap_or(self.config.visibility_timeout);

        let state = storage.queue_mut(queue)?;
        state.restore_expired(now);
        let messages = state.take(request, visibility, now);

        if !messages.is_empty() || now >= deadline {
            storage.receive_calls += 1;
            return Ok(Some(messages));
        }

        Ok(None)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

#[async_trait]
impl QueueBackend for InMemoryBackend {
    async fn receive_messages(
        &self,
        queue: &QueueName,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>, BackendError> {
        let deadline = Instant::now() + request.wait_time;

        loop {
            let arrival = self.arrivals.notified();

            if let Some(messages) = self.try_receive(queue, request, deadline)? {
                return Ok(messages);
            }

            let recheck = (Instant::now() + self.config.poll_interval).min(deadline);
            tokio::select! {
                _ = arrival => {}
                _ = tokio::time::sleep_until(recheck) => {}
            }
        }
    }

    async fn delete_messages(
        &self,
        queue: &QueueName,
        receipts: &[ReceiptHandle],
    ) -> Result<BatchOperationResult, BackendError> {
        let mut storage = self.lock();

        if storage.delete_failures > 0 {
            storage.delete_failures -= 1;
            return Err(BackendError::ConnectionFailed {
                message: "injected delete failure".to_string(),
            });
        }

        let state = storage.queue_mut(queue)?;
        let mut result = BatchOperationResult::default();
        let mut deleted_ids = Vec::new();

        for receipt in receipts {
            match state.in_flight.remove(receipt.as_str()) {
                Some(entry) => {
                    state.deleted.push(entry.message.message_id.clone());
                    deleted_ids.push(entry.message.message_id);
                    result.successful.push(receipt.clone());
                }
                None => result.failed.push(BatchEntryFailure {
                    receipt_handle: receipt.clone(),
                    code: "ReceiptHandleIsInvalid".to_string(),
                    message: "receipt handle is not in flight".to_string(),
                    sender_fault: true,
                }),
            }
        }

        storage.delete_calls.push(DeleteCall {
            queue: queue.clone(),
            message_ids: deleted_ids,
        });

        Ok(result)
    }

    async fn change_visibility(
        &self,
        queue: &QueueName,
        receipts: &[ReceiptHandle],
        visibility: Duration,
    ) -> Result<BatchOperationResult, BackendError> {
        let mut storage = self.lock();
        let now = Instant::now();
        let state = storage.queue_mut(queue)?;
        let mut result = BatchOperationResult::default();
        let mut changes = Vec::new();

        for receipt in receipts {
            match state.in_flight.get_mut(receipt.as_str()) {
                Some(entry) => {
                    entry.visible_at = now + visibility;
                    changes.push(VisibilityChange {
                        queue: queue.clone(),
                        message_id: entry.message.message_id.clone(),
                        visibility,
                    });
                    result.successful.push(receipt.clone());
                }
                None => result.failed.push(BatchEntryFailure {
                    receipt_handle: receipt.clone(),
                    code: "ReceiptHandleIsInvalid".to_string(),
                    message: "receipt handle is not in flight".to_string(),
                    sender_fault: true,
                }),
            }
        }

        storage.visibility_changes.extend(changes);
        Ok(result)
    }

    async fn queue_attributes(
        &self,
        queue: &QueueName,
        names: &[String],
    ) -> Result<HashMap<String, String>, BackendError> {
        let mut storage = self.lock();
        let state = storage.queue_mut(queue)?;
        Ok(select_attributes(&state.attributes, names))
    }
}

//! Per-queue polling loop.
//!
//! Each cycle acquires permits, issues one receive call sized to the grant,
//! returns unused permits, feeds the poll result back to the gate, registers
//! the received messages with the acknowledgement coordinator and hands them
//! to the sink. Receive failures are retried with backoff until the container
//! stops.

use crate::acknowledgement::{AcknowledgementSender, InFlightMessage};
use crate::backend::{QueueBackend, ReceiveRequest};
use crate::message::{MessageEnvelope, QueueName};
use crate::options::ContainerOptions;
use crate::permits::PermitGate;
use crate::retry::{Backoff, RetryPolicy};
use crate::sink::MessageSink;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "poller_tests.rs"]
mod tests;

/// Polls one queue until cancelled
pub struct MessagePoller<T> {
    queue: QueueName,
    backend: Arc<dyn QueueBackend>,
    gate: PermitGate,
    sink: Arc<dyn MessageSink<T>>,
    acknowledgements: AcknowledgementSender,
    request: ReceiveRequest,
    permit_acquire_timeout: Duration,
    queue_attributes: Arc<HashMap<String, String>>,
    retry_policy: RetryPolicy,
    next_sequence: u64,
}

impl<T: Send + Sync + 'static> MessagePoller<T> {
    pub fn new(
        queue: QueueName,
        backend: Arc<dyn QueueBackend>,
        gate: PermitGate,
        sink: Arc<dyn MessageSink<T>>,
        acknowledgements: AcknowledgementSender,
        options: &ContainerOptions,
        queue_attributes: Arc<HashMap<String, String>>,
    ) -> Self {
        let request = ReceiveRequest {
            max_messages: options.messages_per_poll(),
            wait_time: options.poll_timeout(),
            visibility_timeout: options.message_visibility(),
            message_attribute_names: options.message_attribute_names().to_vec(),
            system_attribute_names: options.message_system_attribute_names().to_vec(),
        };

        Self {
            queue,
            backend,
            gate,
            sink,
            acknowledgements,
            request,
            permit_acquire_timeout: options.permit_acquire_timeout(),
            queue_attributes,
            retry_policy: RetryPolicy::polling(),
            next_sequence: 0,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Run the loop until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(queue = %self.queue, "Starting poller");
        let mut backoff = self.retry_policy.backoff();

        while !shutdown.is_cancelled() {
            if !self.poll_once(&shutdown, &mut backoff).await {
                break;
            }
        }

        info!(queue = %self.queue, "Poller stopped");
    }

    /// One poll cycle. Returns `false` once shutdown was observed.
    async fn poll_once(&mut self, shutdown: &CancellationToken, backoff: &mut Backoff) -> bool {
        let acquired = tokio::select! {
            _ = shutdown.cancelled() => return false,
            acquired = self.gate.acquire(self.request.max_messages, self.permit_acquire_timeout) => acquired,
        };

        let Some(mut permits) = acquired else {
            debug!(
                queue = %self.queue,
                in_flight = self.gate.in_flight(),
                "No permits available, skipping poll"
            );
            return true;
        };

        let request = ReceiveRequest {
            max_messages: permits.len(),
            ..self.request.clone()
        };

        let received = tokio::select! {
            _ = shutdown.cancelled() => return false,
            received = self.backend.receive_messages(&self.queue, &request) => received,
        };

        match received {
            Ok(messages) => {
                backoff.reset();
                self.gate.on_poll_result(messages.len());
                debug!(
                    queue = %self.queue,
                    requested = request.max_messages,
                    received = messages.len(),
                    "Poll completed"
                );

                let mut batch = Vec::with_capacity(messages.len());
                for message in messages {
                    let Some(permit) = permits.take() else {
                        warn!(
                            queue = %self.queue,
                            message_id = %message.message_id,
                            "Received more messages than requested, leaving message for redelivery"
                        );
                        continue;
                    };

                    let envelope = MessageEnvelope::from_received(
                        self.queue.clone(),
                        message,
                        self.next_sequence,
                        Arc::clone(&self.queue_attributes),
                    );
                    self.next_sequence += 1;

                    let ticket = self.acknowledgements.register(&envelope, permit);
                    batch.push(InFlightMessage::new(envelope, ticket));
                }

                // Unused permits go back before processing starts
                drop(permits);

                if !batch.is_empty() {
                    if let Err(e) = self.sink.emit(batch).await {
                        error!(queue = %self.queue, error = %e, "Sink rejected messages");
                    }
                }
                true
            }
            Err(e) => {
                drop(permits);

                let delay = backoff
                    .next_delay()
                    .unwrap_or_else(|| self.retry_policy.delay_for(backoff.retries()));
                let delay = e.retry_after().map_or(delay, |hint| hint.max(delay));
                warn!(
                    queue = %self.queue,
                    error = %e,
                    attempt = backoff.retries(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Receive failed, backing off"
                );

                tokio::select! {
                    _ = shutdown.cancelled() => false,
                    _ = tokio::time::sleep(delay) => true,
                }
            }
        }
    }
}

//! Message processing pipeline.
//!
//! Stages, in order:
//! 1. conversion of the raw body into `T` (failure marks the message failed)
//! 2. every [`MessageInterceptor`], which may transform the message or fail it
//! 3. the [`MessageListener`], per message or per batch
//! 4. the optional [`ErrorHandler`], which may turn a failure into success
//! 5. outcome reporting through the message's acknowledgement ticket
//!
//! Interceptors see the final result through
//! [`MessageInterceptor::after_processing`].

use crate::acknowledgement::{Acknowledgement, AcknowledgementTicket, InFlightMessage, MessageOutcome};
use crate::converter::MessageConverter;
use crate::error::{BatchListenerError, ConversionError, ProcessingError};
use crate::message::{MessageEnvelope, MessageId};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;

// ============================================================================
// Typed Message
// ============================================================================

/// A converted message as seen by interceptors and listeners
#[derive(Debug)]
pub struct Message<T> {
    payload: T,
    envelope: MessageEnvelope,
    acknowledgement: Acknowledgement,
}

impl<T> Message<T> {
    pub fn new(payload: T, envelope: MessageEnvelope, acknowledgement: Acknowledgement) -> Self {
        Self {
            payload,
            envelope,
            acknowledgement,
        }
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut T {
        &mut self.payload
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }

    pub fn message_id(&self) -> &MessageId {
        &self.envelope.message_id
    }

    /// Handle for explicit acknowledgement in manual mode
    pub fn acknowledgement(&self) -> &Acknowledgement {
        &self.acknowledgement
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Message<U> {
        Message {
            payload: f(self.payload),
            envelope: self.envelope,
            acknowledgement: self.acknowledgement,
        }
    }

    pub fn into_parts(self) -> (T, MessageEnvelope, Acknowledgement) {
        (self.payload, self.envelope, self.acknowledgement)
    }
}

// ============================================================================
// Extension Points
// ============================================================================

/// Application code receiving messages
#[async_trait]
pub trait MessageListener<T: Send + Sync>: Send + Sync {
    async fn on_message(&self, message: &Message<T>) -> Result<(), ProcessingError>;

    /// Batch entry point. The default delivers each message on its own and
    /// reports the ones that failed.
    async fn on_messages(&self, messages: &[Message<T>]) -> Result<(), BatchListenerError> {
        let mut failed = Vec::new();
        let mut last_error = None;

        for message in messages {
            if let Err(e) = self.on_message(message).await {
                failed.push(message.message_id().clone());
                last_error = Some(e);
            }
        }

        match last_error {
            None => Ok(()),
            Some(error) => Err(BatchListenerError::partial(failed, error)),
        }
    }
}

/// Runs before the listener and observes the final result
#[async_trait]
pub trait MessageInterceptor<T: Send + Sync>: Send + Sync {
    /// Inspect or transform the message. An error fails it without calling
    /// the listener.
    async fn intercept(&self, message: &mut Message<T>) -> Result<(), ProcessingError>;

    async fn after_processing(&self, _message: &Message<T>, _result: &Result<(), ProcessingError>) {}
}

/// Last chance to recover a failed message
#[async_trait]
pub trait ErrorHandler<T: Send + Sync>: Send + Sync {
    /// Return `Ok(())` to treat the message as successfully processed
    async fn handle(&self, message: &Message<T>, error: ProcessingError) -> Result<(), ProcessingError>;
}

// ============================================================================
// Pipeline
// ============================================================================

/// Builder for [`MessageProcessingPipeline`]
pub struct PipelineBuilder<T> {
    converter: Arc<dyn MessageConverter<T>>,
    listener: Arc<dyn MessageListener<T>>,
    interceptors: Vec<Arc<dyn MessageInterceptor<T>>>,
    error_handler: Option<Arc<dyn ErrorHandler<T>>>,
}

impl<T: Send + Sync + 'static> PipelineBuilder<T> {
    pub fn interceptor(mut self, interceptor: Arc<dyn MessageInterceptor<T>>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn interceptors(mut self, interceptors: impl IntoIterator<Item = Arc<dyn MessageInterceptor<T>>>) -> Self {
        self.interceptors.extend(interceptors);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler<T>>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn build(self) -> MessageProcessingPipeline<T> {
        MessageProcessingPipeline {
            converter: self.converter,
            listener: self.listener,
            interceptors: self.interceptors,
            error_handler: self.error_handler,
        }
    }
}

/// Conversion, interception, delivery and error handling for one payload type
pub struct MessageProcessingPipeline<T> {
    converter: Arc<dyn MessageConverter<T>>,
    listener: Arc<dyn MessageListener<T>>,
    interceptors: Vec<Arc<dyn MessageInterceptor<T>>>,
    error_handler: Option<Arc<dyn ErrorHandler<T>>>,
}

impl<T: Send + Sync + 'static> MessageProcessingPipeline<T> {
    pub fn builder(
        converter: Arc<dyn MessageConverter<T>>,
        listener: Arc<dyn MessageListener<T>>,
    ) -> PipelineBuilder<T> {
        PipelineBuilder {
            converter,
            listener,
            interceptors: Vec::new(),
            error_handler: None,
        }
    }

    /// Process one message and report its outcome
    pub async fn process(&self, message: InFlightMessage) -> MessageOutcome {
        let (envelope, ticket) = message.into_parts();

        let Some(mut message) = self.convert(envelope, &ticket) else {
            ticket.complete(MessageOutcome::Failure);
            return MessageOutcome::Failure;
        };

        let result = match self.intercept(&mut message).await {
            Ok(()) => self.listener.on_message(&message).await,
            Err(e) => Err(e),
        };

        let outcome = self.finish(&message, result).await;
        ticket.complete(outcome);
        outcome
    }

    /// Process the messages of one poll as a unit.
    ///
    /// Returns the outcome of each message keyed by receive sequence.
    pub async fn process_batch(&self, messages: Vec<InFlightMessage>) -> BTreeMap<u64, MessageOutcome> {
        let mut outcomes = BTreeMap::new();
        let mut tickets = BTreeMap::new();
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        let (envelopes, batch_tickets): (Vec<_>, Vec<_>) =
            messages.into_iter().map(InFlightMessage::into_parts).unzip();
        let conversions = self.converter.from_messages(&envelopes);

        for ((envelope, ticket), converted) in envelopes.into_iter().zip(batch_tickets).zip(conversions) {
            let sequence = ticket.sequence();

            let mut message = match converted {
                Ok(payload) => Message::new(payload, envelope, ticket.acknowledgement()),
                Err(e) => {
                    log_conversion_failure(&envelope, &e);
                    ticket.complete(MessageOutcome::Failure);
                    outcomes.insert(sequence, MessageOutcome::Failure);
                    continue;
                }
            };
            tickets.insert(sequence, ticket);

            match self.intercept(&mut message).await {
                Ok(()) => accepted.push(message),
                Err(e) => rejected.push((message, e)),
            }
        }

        let listener_result = if accepted.is_empty() {
            Ok(())
        } else {
            debug!(count = accepted.len(), "Delivering batch to listener");
            self.listener.on_messages(&accepted).await
        };

        let mut results = split_batch_result(accepted, listener_result);
        results.extend(rejected.into_iter().map(|(message, e)| (message, Err(e))));

        for (message, result) in results {
            let sequence = message.envelope().sequence;
            let outcome = self.finish(&message, result).await;
            if let Some(ticket) = tickets.remove(&sequence) {
                ticket.complete(outcome);
            }
            outcomes.insert(sequence, outcome);
        }

        outcomes
    }

    fn convert(&self, envelope: MessageEnvelope, ticket: &AcknowledgementTicket) -> Option<Message<T>> {
        match self.converter.from_message(&envelope) {
            Ok(payload) => Some(Message::new(payload, envelope, ticket.acknowledgement())),
            Err(e) => {
                log_conversion_failure(&envelope, &e);
                None
            }
        }
    }

    async fn intercept(&self, message: &mut Message<T>) -> Result<(), ProcessingError> {
        for interceptor in &self.interceptors {
            interceptor.intercept(message).await?;
        }
        Ok(())
    }

    /// Apply the error handler and after-processing hooks
    async fn finish(&self, message: &Message<T>, result: Result<(), ProcessingError>) -> MessageOutcome {
        let result = match (result, &self.error_handler) {
            (Err(e), Some(handler)) => handler.handle(message, e).await,
            (result, _) => result,
        };

        for interceptor in &self.interceptors {
            interceptor.after_processing(message, &result).await;
        }

        match result {
            Ok(()) => MessageOutcome::Success,
            Err(e) => {
                warn!(
                    queue = %message.envelope().queue,
                    message_id = %message.message_id(),
                    error = %e,
                    "Message processing failed"
                );
                MessageOutcome::Failure
            }
        }
    }
}

fn log_conversion_failure(envelope: &MessageEnvelope, error: &ConversionError) {
    warn!(
        queue = %envelope.queue,
        message_id = %envelope.message_id,
        error = %error,
        "Message conversion failed"
    );
}

/// Assign each message of a batch its share of the listener result
fn split_batch_result<T>(
    messages: Vec<Message<T>>,
    result: Result<(), BatchListenerError>,
) -> Vec<(Message<T>, Result<(), ProcessingError>)> {
    match result {
        Ok(()) => messages.into_iter().map(|message| (message, Ok(()))).collect(),
        Err(batch_error) if batch_error.is_whole_batch() => messages
            .into_iter()
            .map(|message| (message, Err(batch_error.error.clone())))
            .collect(),
        Err(batch_error) => {
            let failed: HashSet<&MessageId> = batch_error.failed.iter().collect();
            messages
                .into_iter()
                .map(|message| {
                    let result = if failed.contains(message.message_id()) {
                        Err(batch_error.error.clone())
                    } else {
                        Ok(())
                    };
                    (message, result)
                })
                .collect()
        }
    }
}

//! # SQS Listener Core
//!
//! Backpressure-governed message listener for SQS-style queues.
//!
//! A [`MessageListenerContainer`] polls one or more queues, bounds the number
//! of in-flight messages per queue with a [`PermitGate`], runs every message
//! through a [`MessageProcessingPipeline`] (conversion, interceptors,
//! listener, error handler) and deletes processed messages through a single
//! [`AcknowledgementCoordinator`] that batches deletes and can keep them in
//! receive order.
//!
//! ## Module Organization
//!
//! - [`message`] - Queue names, identifiers and the message envelope
//! - [`options`] - Container options and their validation
//! - [`settings`] - Loading options from YAML and the environment
//! - [`backend`] - The queue backend trait
//! - [`providers`] - In-memory and SQS backends
//! - [`converter`] - Payload converters, including SNS and EventBridge
//! - [`permits`] - Per-queue in-flight limits and throughput modes
//! - [`poller`] - Per-queue polling loop
//! - [`sink`] - Scheduling of processing work
//! - [`pipeline`] - Listener, interceptor and error handler contracts
//! - [`acknowledgement`] - Message state and delete batching
//! - [`executor`] - Task tracking and abandonment
//! - [`container`] - Lifecycle of the whole assembly
//! - [`retry`] - Backoff policies
//! - [`error`] - Error types

pub mod acknowledgement;
pub mod backend;
pub mod container;
pub mod converter;
pub mod error;
pub mod executor;
pub mod message;
pub mod options;
pub mod permits;
pub mod pipeline;
pub mod poller;
pub mod providers;
pub mod retry;
pub mod settings;
pub mod sink;

pub use acknowledgement::{
    Acknowledgement, AcknowledgementCoordinator, AcknowledgementStats, InFlightMessage,
    MessageOutcome, MessageStatus,
};
pub use backend::{BatchEntryFailure, BatchOperationResult, QueueBackend, ReceiveRequest};
pub use container::{ContainerBuilder, MessageListenerContainer, ShutdownReport};
pub use converter::{
    EventBridgeMessageConverter, JsonMessageConverter, MessageConverter, RawPayload,
    SnsMessageConverter, StringMessageConverter,
};
pub use error::{
    AcknowledgementError, BackendError, BatchListenerError, ConfigurationError, ContainerError,
    ConversionError, ProcessingError, ValidationError,
};
pub use executor::TaskExecutor;
pub use message::{MessageEnvelope, MessageId, QueueName, ReceiptHandle, ReceivedMessage};
pub use options::{
    AcknowledgementMode, AcknowledgementOrdering, BackPressureMode, ContainerOptions,
    MessageDeliveryStrategy,
};
pub use permits::{Permit, PermitBatch, PermitGate};
pub use pipeline::{ErrorHandler, Message, MessageInterceptor, MessageListener, MessageProcessingPipeline};
pub use providers::{InMemoryBackend, InMemoryConfig, SqsBackend};
pub use retry::RetryPolicy;
pub use settings::ListenerSettings;
pub use sink::MessageSink;

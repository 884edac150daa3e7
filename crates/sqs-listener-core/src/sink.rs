//! Message sinks.
//!
//! A sink takes the messages of one poll and schedules their processing:
//!
//! - [`FanOutMessageSink`] processes every message on its own task
//! - [`OrderedMessageSink`] processes the messages one after another on a
//!   single task
//! - [`BatchMessageSink`] hands the whole poll to the pipeline as one batch
//! - [`VisibilityExtendingSinkAdapter`] changes the visibility timeout of
//!   every message before delegating to another sink
//!
//! Sinks get their collaborators through capability traits. The container
//! asks each sink for [`MessageSink::as_executor_aware`],
//! [`MessageSink::as_pipeline_aware`] and [`MessageSink::as_backend_aware`]
//! and only wires what the sink exposes.

use crate::acknowledgement::InFlightMessage;
use crate::backend::{batch_chunks, QueueBackend};
use crate::error::ContainerError;
use crate::executor::TaskExecutor;
use crate::message::{QueueName, ReceiptHandle};
use crate::options::{ConfigurableContainerComponent, ContainerOptions, MessageDeliveryStrategy};
use crate::pipeline::MessageProcessingPipeline;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "sink_tests.rs"]
mod tests;

// ============================================================================
// Traits
// ============================================================================

/// Receives the executor processing tasks are spawned on
pub trait ExecutorAware {
    fn set_executor(&mut self, executor: TaskExecutor);
}

/// Receives the pipeline messages are processed by
pub trait PipelineAware<T> {
    fn set_pipeline(&mut self, pipeline: Arc<MessageProcessingPipeline<T>>);
}

/// Receives the queue backend
pub trait BackendAware {
    fn set_backend(&mut self, backend: Arc<dyn QueueBackend>);
}

/// Schedules processing for the messages of one poll
#[async_trait]
pub trait MessageSink<T>: ConfigurableContainerComponent + Send + Sync {
    async fn emit(&self, messages: Vec<InFlightMessage>) -> Result<(), ContainerError>;

    fn as_executor_aware(&mut self) -> Option<&mut dyn ExecutorAware> {
        None
    }

    fn as_pipeline_aware(&mut self) -> Option<&mut dyn PipelineAware<T>> {
        None
    }

    fn as_backend_aware(&mut self) -> Option<&mut dyn BackendAware> {
        None
    }
}

/// Pick the sink for a queue: batch delivery gets a [`BatchMessageSink`],
/// FIFO queues an [`OrderedMessageSink`], everything else a
/// [`FanOutMessageSink`]. With `message_visibility` set the sink is wrapped in
/// a [`VisibilityExtendingSinkAdapter`].
pub fn create_sink<T>(queue: &QueueName, options: &ContainerOptions) -> Box<dyn MessageSink<T>>
where
    T: Send + Sync + 'static,
{
    let sink: Box<dyn MessageSink<T>> = match options.message_delivery_strategy() {
        MessageDeliveryStrategy::Batch => Box::new(BatchMessageSink::new()),
        MessageDeliveryStrategy::SingleMessage if queue.is_fifo() => Box::new(OrderedMessageSink::new()),
        MessageDeliveryStrategy::SingleMessage => Box::new(FanOutMessageSink::new()),
    };

    match options.message_visibility() {
        Some(_) => Box::new(VisibilityExtendingSinkAdapter::new(sink)),
        None => sink,
    }
}

// ============================================================================
// Shared Wiring
// ============================================================================

struct SinkComponents<T> {
    executor: Option<TaskExecutor>,
    pipeline: Option<Arc<MessageProcessingPipeline<T>>>,
}

impl<T> SinkComponents<T> {
    fn new() -> Self {
        Self {
            executor: None,
            pipeline: None,
        }
    }

    fn parts(&self) -> Result<(&TaskExecutor, &Arc<MessageProcessingPipeline<T>>), ContainerError> {
        let executor = self
            .executor
            .as_ref()
            .ok_or(ContainerError::NotConfigured { component: "executor" })?;
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or(ContainerError::NotConfigured { component: "pipeline" })?;
        Ok((executor, pipeline))
    }
}

macro_rules! impl_sink_capabilities {
    ($sink:ident) => {
        impl<T> ExecutorAware for $sink<T> {
            fn set_executor(&mut self, executor: TaskExecutor) {
                self.components.executor = Some(executor);
            }
        }

        impl<T> PipelineAware<T> for $sink<T> {
            fn set_pipeline(&mut self, pipeline: Arc<MessageProcessingPipeline<T>>) {
                self.components.pipeline = Some(pipeline);
            }
        }

        impl<T> ConfigurableContainerComponent for $sink<T> {
            // Scheduling does not depend on any option
            fn configure(&mut self, _options: ContainerOptions) {}
        }

        impl<T> Default for $sink<T> {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

// ============================================================================
// Fan-Out Sink
// ============================================================================

/// Processes each message of a poll concurrently
pub struct FanOutMessageSink<T> {
    components: SinkComponents<T>,
}

impl<T> FanOutMessageSink<T> {
    pub fn new() -> Self {
        Self {
            components: SinkComponents::new(),
        }
    }
}

impl_sink_capabilities!(FanOutMessageSink);

#[async_trait]
impl<T: Send + Sync + 'static> MessageSink<T> for FanOutMessageSink<T> {
    async fn emit(&self, messages: Vec<InFlightMessage>) -> Result<(), ContainerError> {
        let (executor, pipeline) = self.components.parts()?;

        for message in messages {
            let pipeline = Arc::clone(pipeline);
            executor.spawn(async move {
                pipeline.process(message).await;
            });
        }
        Ok(())
    }

    fn as_executor_aware(&mut self) -> Option<&mut dyn ExecutorAware> {
        Some(self)
    }

    fn as_pipeline_aware(&mut self) -> Option<&mut dyn PipelineAware<T>> {
        Some(self)
    }
}

// ============================================================================
// Ordered Sink
// ============================================================================

/// Processes the messages of a poll one after another, in receive order
pub struct OrderedMessageSink<T> {
    components: SinkComponents<T>,
}

impl<T> OrderedMessageSink<T> {
    pub fn new() -> Self {
        Self {
            components: SinkComponents::new(),
        }
    }
}

impl_sink_capabilities!(OrderedMessageSink);

#[async_trait]
impl<T: Send + Sync + 'static> MessageSink<T> for OrderedMessageSink<T> {
    async fn emit(&self, messages: Vec<InFlightMessage>) -> Result<(), ContainerError> {
        let (executor, pipeline) = self.components.parts()?;
        let pipeline = Arc::clone(pipeline);

        executor.spawn(async move {
            for message in messages {
                pipeline.process(message).await;
            }
        });
        Ok(())
    }

    fn as_executor_aware(&mut self) -> Option<&mut dyn ExecutorAware> {
        Some(self)
    }

    fn as_pipeline_aware(&mut self) -> Option<&mut dyn PipelineAware<T>> {
        Some(self)
    }
}

// ============================================================================
// Batch Sink
// ============================================================================

/// Processes the messages of a poll as a single batch
pub struct BatchMessageSink<T> {
    components: SinkComponents<T>,
}

impl<T> BatchMessageSink<T> {
    pub fn new() -> Self {
        Self {
            components: SinkComponents::new(),
        }
    }
}

impl_sink_capabilities!(BatchMessageSink);

#[async_trait]
impl<T: Send + Sync + 'static> MessageSink<T> for BatchMessageSink<T> {
    async fn emit(&self, messages: Vec<InFlightMessage>) -> Result<(), ContainerError> {
        if messages.is_empty() {
            return Ok(());
        }

        let (executor, pipeline) = self.components.parts()?;
        let pipeline = Arc::clone(pipeline);

        executor.spawn(async move {
            pipeline.process_batch(messages).await;
        });
        Ok(())
    }

    fn as_executor_aware(&mut self) -> Option<&mut dyn ExecutorAware> {
        Some(self)
    }

    fn as_pipeline_aware(&mut self) -> Option<&mut dyn PipelineAware<T>> {
        Some(self)
    }
}

// ============================================================================
// Visibility Adapter
// ============================================================================

/// Sets the visibility timeout of every message to `message_visibility`,
/// then delegates to the wrapped sink
pub struct VisibilityExtendingSinkAdapter<T> {
    inner: Box<dyn MessageSink<T>>,
    backend: Option<Arc<dyn QueueBackend>>,
    visibility: Option<Duration>,
}

impl<T> VisibilityExtendingSinkAdapter<T> {
    pub fn new(inner: Box<dyn MessageSink<T>>) -> Self {
        Self {
            inner,
            backend: None,
            visibility: None,
        }
    }

    async fn change_visibility(
        &self,
        backend: &dyn QueueBackend,
        visibility: Duration,
        messages: &[InFlightMessage],
    ) {
        let Some(queue) = messages.first().map(|message| &message.envelope().queue) else {
            return;
        };
        let receipts: Vec<ReceiptHandle> = messages
            .iter()
            .map(|message| message.envelope().receipt_handle.clone())
            .collect();

        for chunk in batch_chunks(&receipts) {
            match backend.change_visibility(queue, chunk, visibility).await {
                Ok(result) if result.is_complete_success() => {
                    debug!(
                        queue = %queue,
                        count = chunk.len(),
                        visibility_seconds = visibility.as_secs(),
                        "Changed message visibility"
                    );
                }
                Ok(result) => {
                    warn!(
                        queue = %queue,
                        failed = result.failed.len(),
                        "Visibility change failed for some messages"
                    );
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Visibility change failed");
                }
            }
        }
    }
}

impl<T> ConfigurableContainerComponent for VisibilityExtendingSinkAdapter<T> {
    fn configure(&mut self, options: ContainerOptions) {
        self.visibility = options.message_visibility();
        self.inner.configure(options);
    }
}

impl<T> ExecutorAware for VisibilityExtendingSinkAdapter<T> {
    fn set_executor(&mut self, executor: TaskExecutor) {
        if let Some(inner) = self.inner.as_executor_aware() {
            inner.set_executor(executor);
        }
    }
}

impl<T> PipelineAware<T> for VisibilityExtendingSinkAdapter<T> {
    fn set_pipeline(&mut self, pipeline: Arc<MessageProcessingPipeline<T>>) {
        if let Some(inner) = self.inner.as_pipeline_aware() {
            inner.set_pipeline(pipeline);
        }
    }
}

impl<T> BackendAware for VisibilityExtendingSinkAdapter<T> {
    fn set_backend(&mut self, backend: Arc<dyn QueueBackend>) {
        if let Some(inner) = self.inner.as_backend_aware() {
            inner.set_backend(Arc::clone(&backend));
        }
        self.backend = Some(backend);
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> MessageSink<T> for VisibilityExtendingSinkAdapter<T> {
    async fn emit(&self, messages: Vec<InFlightMessage>) -> Result<(), ContainerError> {
        if let Some(visibility) = self.visibility {
            let backend = self
                .backend
                .as_deref()
                .ok_or(ContainerError::NotConfigured { component: "backend" })?;
            self.change_visibility(backend, visibility, &messages).await;
        }

        self.inner.emit(messages).await
    }

    fn as_executor_aware(&mut self) -> Option<&mut dyn ExecutorAware> {
        Some(self)
    }

    fn as_pipeline_aware(&mut self) -> Option<&mut dyn PipelineAware<T>> {
        Some(self)
    }

    fn as_backend_aware(&mut self) -> Option<&mut dyn BackendAware> {
        Some(self)
    }
}

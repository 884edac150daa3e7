//! Listener container.
//!
//! [`MessageListenerContainer`] owns every runtime component for one or more
//! queues: a permit gate, sink and poller per queue, one shared processing
//! pipeline, one task executor and one acknowledgement coordinator.
//!
//! ## Shutdown
//!
//! [`MessageListenerContainer::stop`] runs in four steps:
//! 1. cancel polling and wait for the pollers to exit
//! 2. wait up to `source_shutdown_timeout` for in-flight processing
//! 3. cancel whatever is still processing; those messages are abandoned and
//!    their permits released
//! 4. stop the acknowledgement coordinator after a final flush

use crate::acknowledgement::{AcknowledgementCoordinator, AcknowledgementStats};
use crate::backend::QueueBackend;
use crate::converter::MessageConverter;
use crate::error::ContainerError;
use crate::executor::TaskExecutor;
use crate::message::QueueName;
use crate::options::ContainerOptions;
use crate::permits::PermitGate;
use crate::pipeline::{ErrorHandler, MessageInterceptor, MessageListener, MessageProcessingPipeline};
use crate::poller::MessagePoller;
use crate::retry::RetryPolicy;
use crate::sink::{create_sink, MessageSink};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(test)]
#[path = "container_tests.rs"]
mod tests;

/// Result of a graceful stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Processing finished before `source_shutdown_timeout` elapsed
    pub drained_in_time: bool,
    pub stats: AcknowledgementStats,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`MessageListenerContainer`]
pub struct ContainerBuilder<T> {
    backend: Arc<dyn QueueBackend>,
    converter: Arc<dyn MessageConverter<T>>,
    listener: Arc<dyn MessageListener<T>>,
    queues: Vec<QueueName>,
    options: ContainerOptions,
    interceptors: Vec<Arc<dyn MessageInterceptor<T>>>,
    error_handler: Option<Arc<dyn ErrorHandler<T>>>,
    polling_retry_policy: RetryPolicy,
    acknowledgement_retry_policy: RetryPolicy,
}

impl<T: Send + Sync + 'static> ContainerBuilder<T> {
    /// Listen on `queue`; repeated names are ignored
    pub fn queue(mut self, queue: QueueName) -> Self {
        if !self.queues.contains(&queue) {
            self.queues.push(queue);
        }
        self
    }

    pub fn queues(self, queues: impl IntoIterator<Item = QueueName>) -> Self {
        queues.into_iter().fold(self, Self::queue)
    }

    pub fn options(mut self, options: ContainerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn MessageInterceptor<T>>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn error_handler(mut self, handler: Arc<dyn ErrorHandler<T>>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn polling_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.polling_retry_policy = policy;
        self
    }

    pub fn acknowledgement_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.acknowledgement_retry_policy = policy;
        self
    }

    pub fn build(self) -> MessageListenerContainer<T> {
        MessageListenerContainer {
            backend: self.backend,
            converter: self.converter,
            listener: self.listener,
            queues: self.queues,
            options: self.options,
            interceptors: self.interceptors,
            error_handler: self.error_handler,
            polling_retry_policy: self.polling_retry_policy,
            acknowledgement_retry_policy: self.acknowledgement_retry_policy,
            running: None,
        }
    }
}

// ============================================================================
// Container
// ============================================================================

struct RunningComponents {
    options: ContainerOptions,
    executor: TaskExecutor,
    polling: CancellationToken,
    pollers: Vec<JoinHandle<()>>,
    coordinator: AcknowledgementCoordinator,
    gates: HashMap<QueueName, PermitGate>,
}

/// Polls queues and processes their messages until stopped
pub struct MessageListenerContainer<T> {
    backend: Arc<dyn QueueBackend>,
    converter: Arc<dyn MessageConverter<T>>,
    listener: Arc<dyn MessageListener<T>>,
    queues: Vec<QueueName>,
    options: ContainerOptions,
    interceptors: Vec<Arc<dyn MessageInterceptor<T>>>,
    error_handler: Option<Arc<dyn ErrorHandler<T>>>,
    polling_retry_policy: RetryPolicy,
    acknowledgement_retry_policy: RetryPolicy,
    running: Option<RunningComponents>,
}

impl<T: Send + Sync + 'static> MessageListenerContainer<T> {
    pub fn builder(
        backend: Arc<dyn QueueBackend>,
        converter: Arc<dyn MessageConverter<T>>,
        listener: Arc<dyn MessageListener<T>>,
    ) -> ContainerBuilder<T> {
        ContainerBuilder {
            backend,
            converter,
            listener,
            queues: Vec::new(),
            options: ContainerOptions::default(),
            interceptors: Vec::new(),
            error_handler: None,
            polling_retry_policy: RetryPolicy::polling(),
            acknowledgement_retry_policy: RetryPolicy::acknowledgement(),
        }
    }

    pub fn queues(&self) -> &[QueueName] {
        &self.queues
    }

    pub fn options(&self) -> &ContainerOptions {
        &self.options
    }

    /// Replace the options used by the next start. A running container keeps
    /// the snapshot it started with.
    pub fn set_options(&mut self, options: ContainerOptions) {
        self.options = options;
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Permit gate of a queue while running
    pub fn permit_gate(&self, queue: &QueueName) -> Option<&PermitGate> {
        self.running.as_ref().and_then(|running| running.gates.get(queue))
    }

    pub fn acknowledgement_stats(&self) -> Option<AcknowledgementStats> {
        self.running
            .as_ref()
            .map(|running| running.coordinator.stats())
    }

    /// Validate the options and start polling every queue
    pub async fn start(&mut self) -> Result<(), ContainerError> {
        if self.running.is_some() {
            return Err(ContainerError::AlreadyRunning);
        }
        if self.queues.is_empty() {
            return Err(ContainerError::NoQueues);
        }
        self.options.validate()?;

        let options = self.options.create_copy();
        let executor = match options.components_runtime() {
            Some(handle) => TaskExecutor::new(handle.clone()),
            None => TaskExecutor::current()?,
        };
        let runtime = executor.handle().clone();

        info!(
            queues = self.queues.len(),
            max_in_flight = options.max_inflight_messages_per_queue(),
            messages_per_poll = options.messages_per_poll(),
            back_pressure_mode = ?options.back_pressure_mode(),
            delivery = ?options.message_delivery_strategy(),
            "Starting listener container"
        );

        let mut coordinator = AcknowledgementCoordinator::new(Arc::clone(&self.backend))
            .with_retry_policy(self.acknowledgement_retry_policy.clone());
        options.configure(&mut coordinator);
        coordinator.start(&runtime)?;

        let mut pipeline = MessageProcessingPipeline::builder(
            Arc::clone(&self.converter),
            Arc::clone(&self.listener),
        )
        .interceptors(self.interceptors.iter().cloned());
        if let Some(handler) = &self.error_handler {
            pipeline = pipeline.error_handler(Arc::clone(handler));
        }
        let pipeline = Arc::new(pipeline.build());

        let polling = CancellationToken::new();
        let mut pollers = Vec::with_capacity(self.queues.len());
        let mut gates = HashMap::with_capacity(self.queues.len());

        for queue in &self.queues {
            let queue_attributes = self.fetch_queue_attributes(queue, &options).await;
            let gate = PermitGate::new(queue.clone(), &options);

            let mut sink = create_sink::<T>(queue, &options);
            options.configure(sink.as_mut());
            if let Some(aware) = sink.as_executor_aware() {
                aware.set_executor(executor.clone());
            }
            if let Some(aware) = sink.as_pipeline_aware() {
                aware.set_pipeline(Arc::clone(&pipeline));
            }
            if let Some(aware) = sink.as_backend_aware() {
                aware.set_backend(Arc::clone(&self.backend));
            }
            let sink: Arc<dyn MessageSink<T>> = Arc::from(sink);

            let poller = MessagePoller::new(
                queue.clone(),
                Arc::clone(&self.backend),
                gate.clone(),
                sink,
                coordinator.sender(),
                &options,
                queue_attributes,
            )
            .with_retry_policy(self.polling_retry_policy.clone());

            pollers.push(runtime.spawn(poller.run(polling.child_token())));
            gates.insert(queue.clone(), gate);
        }

        self.running = Some(RunningComponents {
            options,
            executor,
            polling,
            pollers,
            coordinator,
            gates,
        });

        info!("Listener container started");
        Ok(())
    }

    /// Stop polling, drain processing and flush acknowledgements
    pub async fn stop(&mut self) -> Result<ShutdownReport, ContainerError> {
        let mut running = self.running.take().ok_or(ContainerError::NotRunning)?;
        info!("Stopping listener container");

        running.polling.cancel();
        for poller in running.pollers.drain(..) {
            if let Err(e) = poller.await {
                error!(error = %e, "Poller task failed");
            }
        }

        let timeout = running.options.source_shutdown_timeout();
        let drained_in_time = running.executor.drain(timeout).await;
        if !drained_in_time {
            warn!(
                remaining = running.executor.in_flight_tasks(),
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Processing did not finish within the shutdown timeout, abandoning remaining messages"
            );
            running.executor.abandon();
            running.executor.wait().await;
        }

        let stats = running.coordinator.stop().await;
        info!(
            acknowledged = stats.acknowledged,
            failed = stats.failed,
            abandoned = stats.abandoned,
            deleted = stats.deleted,
            "Listener container stopped"
        );

        Ok(ShutdownReport {
            drained_in_time,
            stats,
        })
    }

    async fn fetch_queue_attributes(
        &self,
        queue: &QueueName,
        options: &ContainerOptions,
    ) -> Arc<HashMap<String, String>> {
        let names = options.queue_attribute_names();
        if names.is_empty() {
            return Arc::default();
        }

        match self.backend.queue_attributes(queue, names).await {
            Ok(attributes) => Arc::new(attributes),
            Err(e) => {
                warn!(queue = %queue, error = %e, "Could not fetch queue attributes");
                Arc::default()
            }
        }
    }
}

impl<T> Drop for MessageListenerContainer<T> {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            warn!("Listener container dropped while running, cancelling its tasks");
            running.polling.cancel();
            running.executor.abandon();
        }
    }
}

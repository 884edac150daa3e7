//! Tests for the message sinks.

use super::*;
use crate::acknowledgement::AcknowledgementCoordinator;
use crate::backend::ReceiveRequest;
use crate::converter::StringMessageConverter;
use crate::error::{BatchListenerError, ProcessingError};
use crate::message::MessageEnvelope;
use crate::options::BackPressureMode;
use crate::permits::PermitGate;
use crate::pipeline::{Message, MessageListener};
use crate::providers::InMemoryBackend;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::runtime::Handle;

struct Fixture {
    backend: InMemoryBackend,
    queue: QueueName,
    coordinator: AcknowledgementCoordinator,
    gate: PermitGate,
    next_sequence: u64,
}

impl Fixture {
    fn new(queue: &str) -> Self {
        let backend = InMemoryBackend::default();
        let queue: QueueName = queue.parse().unwrap();
        backend.create_queue(&queue);

        let mut coordinator = AcknowledgementCoordinator::new(Arc::new(backend.clone()));
        coordinator.start(&Handle::current()).unwrap();

        let options = ContainerOptions::new()
            .with_max_inflight_messages_per_queue(50)
            .with_back_pressure_mode(BackPressureMode::FixedHighThroughput);

        Self {
            backend,
            gate: PermitGate::new(queue.clone(), &options),
            queue,
            coordinator,
            next_sequence: 0,
        }
    }

    async fn receive(&mut self, bodies: &[&str]) -> Vec<InFlightMessage> {
        for body in bodies {
            self.backend.send_message(&self.queue, *body);
        }
        let request = ReceiveRequest {
            max_messages: bodies.len(),
            ..ReceiveRequest::default()
        };
        let received = self
            .backend
            .receive_messages(&self.queue, &request)
            .await
            .unwrap();

        let mut permits = self
            .gate
            .acquire(bodies.len(), Duration::from_secs(1))
            .await
            .unwrap();
        let sender = self.coordinator.sender();

        received
            .into_iter()
            .map(|message| {
                let envelope = MessageEnvelope::from_received(
                    self.queue.clone(),
                    message,
                    self.next_sequence,
                    Arc::default(),
                );
                self.next_sequence += 1;
                let ticket = sender.register(&envelope, permits.take().unwrap());
                InFlightMessage::new(envelope, ticket)
            })
            .collect()
    }
}

/// Records payload order and the highest number of concurrent calls
#[derive(Default)]
struct ConcurrencyListener {
    active: AtomicUsize,
    peak: AtomicUsize,
    order: Mutex<Vec<String>>,
    batches: AtomicUsize,
}

#[async_trait]
impl MessageListener<String> for ConcurrencyListener {
    async fn on_message(&self, message: &Message<String>) -> Result<(), ProcessingError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.order.lock().unwrap().push(message.payload().clone());
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_messages(&self, messages: &[Message<String>]) -> Result<(), BatchListenerError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        for message in messages {
            self.order.lock().unwrap().push(message.payload().clone());
        }
        Ok(())
    }
}

/// Hand the sink every collaborator it asks for; returns the executor
fn wire(
    sink: &mut dyn MessageSink<String>,
    listener: Arc<ConcurrencyListener>,
    backend: &InMemoryBackend,
) -> TaskExecutor {
    let executor = TaskExecutor::current().unwrap();
    let pipeline = Arc::new(
        MessageProcessingPipeline::builder(Arc::new(StringMessageConverter), listener).build(),
    );
    if let Some(aware) = sink.as_executor_aware() {
        aware.set_executor(executor.clone());
    }
    if let Some(aware) = sink.as_pipeline_aware() {
        aware.set_pipeline(pipeline);
    }
    if let Some(aware) = sink.as_backend_aware() {
        aware.set_backend(Arc::new(backend.clone()));
    }
    executor
}

// ============================================================================
// Scheduling Tests
// ============================================================================

mod scheduling_tests {
    use super::*;

    /// Verify that the fan-out sink processes messages concurrently.
    #[tokio::test]
    async fn test_fan_out_processes_concurrently() {
        // Arrange
        let mut fixture = Fixture::new("orders");
        let listener = Arc::new(ConcurrencyListener::default());
        let mut sink = FanOutMessageSink::<String>::new();
        let executor = wire(&mut sink, listener.clone(), &fixture.backend);
        let messages = fixture.receive(&["a", "b", "c", "d"]).await;

        // Act
        sink.emit(messages).await.unwrap();
        assert!(executor.drain(Duration::from_secs(5)).await);

        // Assert
        assert!(listener.peak.load(Ordering::SeqCst) > 1);
        assert_eq!(listener.order.lock().unwrap().len(), 4);
        assert_eq!(fixture.gate.in_flight(), 0);
    }

    /// Verify that the ordered sink processes one message at a time in order.
    #[tokio::test]
    async fn test_ordered_processes_one_at_a_time_in_order() {
        let mut fixture = Fixture::new("orders.fifo");
        let listener = Arc::new(ConcurrencyListener::default());
        let mut sink = OrderedMessageSink::<String>::new();
        let executor = wire(&mut sink, listener.clone(), &fixture.backend);
        let messages = fixture.receive(&["1", "2", "3"]).await;

        sink.emit(messages).await.unwrap();
        assert!(executor.drain(Duration::from_secs(5)).await);

        assert_eq!(listener.peak.load(Ordering::SeqCst), 1);
        assert_eq!(*listener.order.lock().unwrap(), vec!["1", "2", "3"]);
    }

    /// Verify that the batch sink delivers a poll as one batch.
    #[tokio::test]
    async fn test_batch_sink_delivers_one_batch() {
        let mut fixture = Fixture::new("orders");
        let listener = Arc::new(ConcurrencyListener::default());
        let mut sink = BatchMessageSink::<String>::new();
        let executor = wire(&mut sink, listener.clone(), &fixture.backend);
        let messages = fixture.receive(&["x", "y"]).await;

        sink.emit(messages).await.unwrap();
        assert!(executor.drain(Duration::from_secs(5)).await);

        assert_eq!(listener.batches.load(Ordering::SeqCst), 1);
        assert_eq!(*listener.order.lock().unwrap(), vec!["x", "y"]);
    }

    /// Verify that a sink without its pipeline reports the missing component.
    #[tokio::test]
    async fn test_unwired_sink_reports_missing_component() {
        let mut fixture = Fixture::new("orders");
        let sink = FanOutMessageSink::<String>::new();
        let messages = fixture.receive(&["a"]).await;

        let result = sink.emit(messages).await;

        assert!(matches!(
            result,
            Err(ContainerError::NotConfigured { component: "executor" })
        ));
        // The unprocessed message was abandoned and its permit returned
        assert_eq!(fixture.gate.in_flight(), 0);
    }

    /// Verify that the basic sinks do not ask for a backend.
    #[tokio::test]
    async fn test_basic_sinks_are_not_backend_aware() {
        let mut fan_out = FanOutMessageSink::<String>::new();
        let mut ordered = OrderedMessageSink::<String>::new();
        let mut batch = BatchMessageSink::<String>::new();

        assert!(fan_out.as_backend_aware().is_none());
        assert!(ordered.as_backend_aware().is_none());
        assert!(batch.as_backend_aware().is_none());
        assert!(fan_out.as_executor_aware().is_some());
    }
}

// ============================================================================
// Sink Selection Tests
// ============================================================================

mod selection_tests {
    use super::*;

    /// Verify that a visibility option wraps the sink in the adapter.
    #[tokio::test]
    async fn test_visibility_wraps_sink_in_adapter() {
        let queue: QueueName = "orders".parse().unwrap();
        let options = ContainerOptions::new().with_message_visibility(Duration::from_secs(60));

        let mut sink = create_sink::<String>(&queue, &options);

        assert!(sink.as_backend_aware().is_some());
    }

    /// Verify that the sink is not wrapped without a visibility option.
    #[tokio::test]
    async fn test_plain_options_give_unwrapped_sink() {
        let queue: QueueName = "orders".parse().unwrap();

        let mut sink = create_sink::<String>(&queue, &ContainerOptions::new());

        assert!(sink.as_backend_aware().is_none());
        assert!(sink.as_pipeline_aware().is_some());
    }

    /// Verify that FIFO queues get the ordered sink.
    #[tokio::test]
    async fn test_fifo_queue_gets_ordered_processing() {
        // Arrange
        let mut fixture = Fixture::new("orders.fifo");
        let listener = Arc::new(ConcurrencyListener::default());
        let mut sink = create_sink::<String>(&fixture.queue, &ContainerOptions::new());
        let executor = wire(sink.as_mut(), listener.clone(), &fixture.backend);
        let messages = fixture.receive(&["1", "2", "3"]).await;

        // Act
        sink.emit(messages).await.unwrap();
        assert!(executor.drain(Duration::from_secs(5)).await);

        // Assert
        assert_eq!(listener.peak.load(Ordering::SeqCst), 1);
    }
}

// ============================================================================
// Visibility Adapter Tests
// ============================================================================

mod adapter_tests {
    use super::*;

    /// Inner sink exposing no capabilities, recording what reaches it
    #[derive(Default)]
    struct InertSink {
        configured: Arc<Mutex<Option<ContainerOptions>>>,
        emitted: Arc<AtomicUsize>,
    }

    impl ConfigurableContainerComponent for InertSink {
        fn configure(&mut self, options: ContainerOptions) {
            *self.configured.lock().unwrap() = Some(options);
        }
    }

    #[async_trait]
    impl MessageSink<String> for InertSink {
        async fn emit(&self, messages: Vec<InFlightMessage>) -> Result<(), ContainerError> {
            self.emitted.fetch_add(messages.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    /// Verify that the adapter ignores wiring its inner sink does not need.
    #[tokio::test]
    async fn test_capabilities_are_silent_no_ops_for_inert_inner_sink() {
        // Arrange
        let fixture = Fixture::new("orders");
        let inner = InertSink::default();
        let configured = Arc::clone(&inner.configured);
        let mut adapter = VisibilityExtendingSinkAdapter::new(Box::new(inner));

        // Act
        ContainerOptions::new()
            .with_message_visibility(Duration::from_secs(45))
            .configure(&mut adapter);
        wire(&mut adapter, Arc::new(ConcurrencyListener::default()), &fixture.backend);
        adapter.emit(Vec::new()).await.unwrap();

        // Assert
        let configured = configured.lock().unwrap();
        assert_eq!(
            configured.as_ref().and_then(|options| options.message_visibility()),
            Some(Duration::from_secs(45))
        );
    }

    /// Verify that visibility is changed before the inner sink runs.
    #[tokio::test]
    async fn test_visibility_changed_before_delegating() {
        // Arrange
        let mut fixture = Fixture::new("orders");
        let inner = InertSink::default();
        let emitted = Arc::clone(&inner.emitted);
        let mut adapter = VisibilityExtendingSinkAdapter::new(Box::new(inner));
        ContainerOptions::new()
            .with_message_visibility(Duration::from_secs(90))
            .configure(&mut adapter);
        adapter.set_backend(Arc::new(fixture.backend.clone()));
        let messages = fixture.receive(&["a", "b"]).await;

        // Act
        adapter.emit(messages).await.unwrap();

        // Assert
        let changes = fixture.backend.visibility_changes();
        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .all(|change| change.visibility == Duration::from_secs(90)));
        assert_eq!(emitted.load(Ordering::SeqCst), 2);
    }

    /// Verify that the adapter forwards wiring to its inner sink.
    #[tokio::test]
    async fn test_adapter_forwards_wiring_to_capable_inner_sink() {
        let mut fixture = Fixture::new("orders");
        let listener = Arc::new(ConcurrencyListener::default());
        let mut adapter =
            VisibilityExtendingSinkAdapter::new(Box::new(FanOutMessageSink::<String>::new()));
        ContainerOptions::new()
            .with_message_visibility(Duration::from_secs(30))
            .configure(&mut adapter);
        let executor = wire(&mut adapter, listener.clone(), &fixture.backend);
        let messages = fixture.receive(&["a", "b", "c"]).await;

        adapter.emit(messages).await.unwrap();
        assert!(executor.drain(Duration::from_secs(5)).await);

        assert_eq!(listener.order.lock().unwrap().len(), 3);
        assert_eq!(fixture.backend.visibility_changes().len(), 3);
    }

    /// Verify that the adapter reports a missing backend.
    #[tokio::test]
    async fn test_missing_backend_is_reported() {
        let mut fixture = Fixture::new("orders");
        let mut adapter = VisibilityExtendingSinkAdapter::new(Box::new(InertSink::default()));
        ContainerOptions::new()
            .with_message_visibility(Duration::from_secs(30))
            .configure(&mut adapter);
        let messages = fixture.receive(&["a"]).await;

        let result = adapter.emit(messages).await;

        assert!(matches!(
            result,
            Err(ContainerError::NotConfigured { component: "backend" })
        ));
    }
}

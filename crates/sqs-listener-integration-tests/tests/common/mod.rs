//! Common test utilities for listener integration tests
//!
//! Provides a recording listener, container construction helpers and a
//! polling wait used by every scenario.

#![allow(dead_code)]

use async_trait::async_trait;
use sqs_listener_core::{
    BackPressureMode, ContainerOptions, InMemoryBackend, Message, MessageConverter,
    MessageListener, MessageListenerContainer, ProcessingError, QueueName,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One message as the listener saw it
#[derive(Debug, Clone)]
pub struct ReceivedRecord<T> {
    pub queue: QueueName,
    pub sequence: u64,
    pub payload: T,
}

/// Listener that records payloads, tracks concurrency and can be told to fail
/// or slow down specific bodies
pub struct RecordingListener<T> {
    records: Mutex<Vec<ReceivedRecord<T>>>,
    delays: Mutex<HashMap<String, Duration>>,
    default_delay: Duration,
    failing_bodies: Mutex<Vec<String>>,
    acknowledge_bodies: Mutex<Option<Vec<String>>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl<T> RecordingListener<T> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            delays: Mutex::new(HashMap::new()),
            default_delay: Duration::ZERO,
            failing_bodies: Mutex::new(Vec::new()),
            acknowledge_bodies: Mutex::new(None),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Delay processing of the message with this raw body
    pub fn delay_body(&self, body: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(body.to_string(), delay);
    }

    pub fn fail_body(&self, body: &str) {
        self.failing_bodies.lock().unwrap().push(body.to_string());
    }

    /// Only acknowledge messages with these bodies explicitly
    pub fn acknowledge_only(&self, bodies: &[&str]) {
        *self.acknowledge_bodies.lock().unwrap() =
            Some(bodies.iter().map(|body| body.to_string()).collect());
    }

    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl<T: Clone> RecordingListener<T> {
    pub fn records(&self) -> Vec<ReceivedRecord<T>> {
        self.records.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<T> {
        self.records()
            .into_iter()
            .map(|record| record.payload)
            .collect()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> MessageListener<T> for RecordingListener<T> {
    async fn on_message(&self, message: &Message<T>) -> Result<(), ProcessingError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let body = message.envelope().body.clone();
        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(&body)
            .copied()
            .unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.records.lock().unwrap().push(ReceivedRecord {
            queue: message.envelope().queue.clone(),
            sequence: message.envelope().sequence,
            payload: message.payload().clone(),
        });

        if let Some(bodies) = self.acknowledge_bodies.lock().unwrap().as_ref() {
            if bodies.contains(&body) {
                message.acknowledgement().acknowledge();
            }
        }

        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing_bodies.lock().unwrap().contains(&body) {
            return Err(ProcessingError::listener(format!("refusing {}", body)));
        }
        Ok(())
    }
}

/// Options with short waits so containers start and stop quickly
pub fn create_test_options() -> ContainerOptions {
    ContainerOptions::new()
        .with_poll_timeout(Duration::from_millis(50))
        .with_permit_acquire_timeout(Duration::from_millis(50))
        .with_back_pressure_mode(BackPressureMode::FixedHighThroughput)
}

pub fn create_test_container<T>(
    backend: &InMemoryBackend,
    converter: Arc<dyn MessageConverter<T>>,
    listener: Arc<dyn MessageListener<T>>,
    queues: &[&QueueName],
    options: ContainerOptions,
) -> MessageListenerContainer<T>
where
    T: Send + Sync + 'static,
{
    MessageListenerContainer::builder(Arc::new(backend.clone()), converter, listener)
        .queues(queues.iter().map(|queue| (*queue).clone()))
        .options(options)
        .build()
}

pub fn queue(name: &str) -> QueueName {
    name.parse().unwrap()
}

/// Poll `condition` every 5ms for up to `timeout`
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

//! Container configuration.
//!
//! [`ContainerOptions`] is built with consuming `with_*` setters, checked with
//! [`ContainerOptions::validate`] and snapshotted with
//! [`ContainerOptions::create_copy`] when a container starts. Components that
//! need configuration implement [`ConfigurableContainerComponent`] and receive
//! their own copy through [`ContainerOptions::configure`].

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::runtime::Handle;

#[cfg(test)]
#[path = "options_tests.rs"]
mod tests;

/// Maximum number of messages a single receive call may return
pub const MAX_MESSAGES_PER_POLL: usize = 10;

/// Longest long-polling wait a receive call accepts
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(20);

/// Wildcard attribute name requesting every attribute
pub const ALL_ATTRIBUTES: &str = "All";

// ============================================================================
// Modes
// ============================================================================

/// How the permit gate trades throughput against polling cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackPressureMode {
    /// Switch between low and high throughput based on poll results
    #[default]
    Auto,
    /// Like `Auto`, but only poll when the full `messages_per_poll` permits
    /// are available
    AlwaysPollMaxMessages,
    /// Always grant permits up to the in-flight ceiling
    FixedHighThroughput,
}

/// Whether messages reach the listener one at a time or as a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDeliveryStrategy {
    #[default]
    SingleMessage,
    Batch,
}

/// Which processing outcomes result in the message being deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcknowledgementMode {
    /// Delete messages that were processed successfully
    #[default]
    OnSuccess,
    /// Delete messages whether processing succeeded or failed
    Always,
    /// Delete only messages the listener acknowledged explicitly
    Manual,
}

/// Whether deletes must follow receive order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcknowledgementOrdering {
    #[default]
    Parallel,
    Ordered,
}

// ============================================================================
// Container Options
// ============================================================================

/// Configuration bundle for a listener container
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    max_inflight_messages_per_queue: usize,
    messages_per_poll: usize,
    poll_timeout: Duration,
    permit_acquire_timeout: Duration,
    source_shutdown_timeout: Duration,
    back_pressure_mode: BackPressureMode,
    message_delivery_strategy: MessageDeliveryStrategy,
    acknowledgement_mode: AcknowledgementMode,
    acknowledgement_ordering: AcknowledgementOrdering,
    acknowledgement_interval: Duration,
    acknowledgement_threshold: usize,
    message_visibility: Option<Duration>,
    queue_attribute_names: Vec<String>,
    message_attribute_names: Vec<String>,
    message_system_attribute_names: Vec<String>,
    components_runtime: Option<Handle>,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            max_inflight_messages_per_queue: 10,
            messages_per_poll: 10,
            poll_timeout: Duration::from_secs(10),
            permit_acquire_timeout: Duration::from_secs(10),
            source_shutdown_timeout: Duration::from_secs(20),
            back_pressure_mode: BackPressureMode::Auto,
            message_delivery_strategy: MessageDeliveryStrategy::SingleMessage,
            acknowledgement_mode: AcknowledgementMode::OnSuccess,
            acknowledgement_ordering: AcknowledgementOrdering::Parallel,
            acknowledgement_interval: Duration::from_secs(1),
            acknowledgement_threshold: 10,
            message_visibility: None,
            queue_attribute_names: Vec::new(),
            message_attribute_names: vec![ALL_ATTRIBUTES.to_string()],
            message_system_attribute_names: vec![ALL_ATTRIBUTES.to_string()],
            components_runtime: None,
        }
    }
}

impl ContainerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Setters
    // ------------------------------------------------------------------------

    pub fn with_max_inflight_messages_per_queue(mut self, max: usize) -> Self {
        self.max_inflight_messages_per_queue = max;
        self
    }

    pub fn with_messages_per_poll(mut self, count: usize) -> Self {
        self.messages_per_poll = count;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_permit_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.permit_acquire_timeout = timeout;
        self
    }

    pub fn with_source_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.source_shutdown_timeout = timeout;
        self
    }

    pub fn with_back_pressure_mode(mut self, mode: BackPressureMode) -> Self {
        self.back_pressure_mode = mode;
        self
    }

    pub fn with_message_delivery_strategy(mut self, strategy: MessageDeliveryStrategy) -> Self {
        self.message_delivery_strategy = strategy;
        self
    }

    pub fn with_acknowledgement_mode(mut self, mode: AcknowledgementMode) -> Self {
        self.acknowledgement_mode = mode;
        self
    }

    pub fn with_acknowledgement_ordering(mut self, ordering: AcknowledgementOrdering) -> Self {
        self.acknowledgement_ordering = ordering;
        self
    }

    pub fn with_acknowledgement_interval(mut self, interval: Duration) -> Self {
        self.acknowledgement_interval = interval;
        self
    }

    pub fn with_acknowledgement_threshold(mut self, threshold: usize) -> Self {
        self.acknowledgement_threshold = threshold;
        self
    }

    pub fn with_message_visibility(mut self, visibility: Duration) -> Self {
        self.message_visibility = Some(visibility);
        self
    }

    pub fn with_queue_attribute_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queue_attribute_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_message_attribute_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.message_attribute_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_message_system_attribute_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.message_system_attribute_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Run processing tasks on the given runtime instead of the one that
    /// starts the container
    pub fn with_components_runtime(mut self, handle: Handle) -> Self {
        self.components_runtime = Some(handle);
        self
    }

    // ------------------------------------------------------------------------
    // Getters
    // ------------------------------------------------------------------------

    pub fn max_inflight_messages_per_queue(&self) -> usize {
        self.max_inflight_messages_per_queue
    }

    pub fn messages_per_poll(&self) -> usize {
        self.messages_per_poll
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn permit_acquire_timeout(&self) -> Duration {
        self.permit_acquire_timeout
    }

    pub fn source_shutdown_timeout(&self) -> Duration {
        self.source_shutdown_timeout
    }

    pub fn back_pressure_mode(&self) -> BackPressureMode {
        self.back_pressure_mode
    }

    pub fn message_delivery_strategy(&self) -> MessageDeliveryStrategy {
        self.message_delivery_strategy
    }

    pub fn acknowledgement_mode(&self) -> AcknowledgementMode {
        self.acknowledgement_mode
    }

    pub fn acknowledgement_ordering(&self) -> AcknowledgementOrdering {
        self.acknowledgement_ordering
    }

    pub fn acknowledgement_interval(&self) -> Duration {
        self.acknowledgement_interval
    }

    pub fn acknowledgement_threshold(&self) -> usize {
        self.acknowledgement_threshold
    }

    pub fn message_visibility(&self) -> Option<Duration> {
        self.message_visibility
    }

    pub fn queue_attribute_names(&self) -> &[String] {
        &self.queue_attribute_names
    }

    pub fn message_attribute_names(&self) -> &[String] {
        &self.message_attribute_names
    }

    pub fn message_system_attribute_names(&self) -> &[String] {
        &self.message_system_attribute_names
    }

    pub fn components_runtime(&self) -> Option<&Handle> {
        self.components_runtime.as_ref()
    }

    /// Whether acknowledgements are flushed as soon as they are recorded
    pub fn is_immediate_acknowledgement(&self) -> bool {
        self.acknowledgement_interval.is_zero() && self.acknowledgement_threshold == 0
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Check the option combination before a container starts
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_inflight_messages_per_queue == 0 {
            return Err(ValidationError::OutOfRange {
                field: "max_inflight_messages_per_queue".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.messages_per_poll == 0 {
            return Err(ValidationError::OutOfRange {
                field: "messages_per_poll".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.messages_per_poll > self.max_inflight_messages_per_queue {
            return Err(ValidationError::OutOfRange {
                field: "messages_per_poll".to_string(),
                message: format!(
                    "messages_per_poll should be less than or equal to max_inflight_messages_per_queue. Values provided: {} and {} respectively",
                    self.messages_per_poll, self.max_inflight_messages_per_queue
                ),
            });
        }

        if self.messages_per_poll > MAX_MESSAGES_PER_POLL {
            return Err(ValidationError::OutOfRange {
                field: "messages_per_poll".to_string(),
                message: format!(
                    "messages_per_poll must be less than or equal to {}.",
                    MAX_MESSAGES_PER_POLL
                ),
            });
        }

        if self.poll_timeout > MAX_POLL_TIMEOUT {
            return Err(ValidationError::OutOfRange {
                field: "poll_timeout".to_string(),
                message: format!(
                    "must be at most {} seconds",
                    MAX_POLL_TIMEOUT.as_secs()
                ),
            });
        }

        Ok(())
    }

    /// Snapshot of every field, used as the running configuration
    pub fn create_copy(&self) -> Self {
        Self {
            max_inflight_messages_per_queue: self.max_inflight_messages_per_queue,
            messages_per_poll: self.messages_per_poll,
            poll_timeout: self.poll_timeout,
            permit_acquire_timeout: self.permit_acquire_timeout,
            source_shutdown_timeout: self.source_shutdown_timeout,
            back_pressure_mode: self.back_pressure_mode,
            message_delivery_strategy: self.message_delivery_strategy,
            acknowledgement_mode: self.acknowledgement_mode,
            acknowledgement_ordering: self.acknowledgement_ordering,
            acknowledgement_interval: self.acknowledgement_interval,
            acknowledgement_threshold: self.acknowledgement_threshold,
            message_visibility: self.message_visibility,
            queue_attribute_names: self.queue_attribute_names.clone(),
            message_attribute_names: self.message_attribute_names.clone(),
            message_system_attribute_names: self.message_system_attribute_names.clone(),
            components_runtime: self.components_runtime.clone(),
        }
    }

    /// Hand a copy of these options to a component
    pub fn configure<C>(&self, component: &mut C) -> &Self
    where
        C: ConfigurableContainerComponent + ?Sized,
    {
        component.configure(self.create_copy());
        self
    }
}

/// A container part that takes its settings from [`ContainerOptions`]
pub trait ConfigurableContainerComponent {
    fn configure(&mut self, options: ContainerOptions);
}

//! File and environment configuration.
//!
//! [`ListenerSettings`] is the serde view of [`ContainerOptions`]. Every field
//! has a default, so an absent file or an empty environment yields the
//! built-in options. Durations are plain integers whose unit is part of the
//! field name.
//!
//! Sources, later ones overriding earlier ones:
//! 1. an optional YAML file
//! 2. environment variables prefixed `SQS_LISTENER`, with `__` separating
//!    nested keys, e.g. `SQS_LISTENER__MESSAGES_PER_POLL=5`

use crate::error::{ConfigurationError, ValidationError};
use crate::message::QueueName;
use crate::options::{
    AcknowledgementMode, AcknowledgementOrdering, BackPressureMode, ContainerOptions,
    MessageDeliveryStrategy, ALL_ATTRIBUTES,
};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;

/// Environment variable prefix
pub const ENVIRONMENT_PREFIX: &str = "SQS_LISTENER";

/// Deserializable listener configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerSettings {
    /// Queue names or URLs to listen on
    pub queues: Vec<String>,

    /// Override for the SQS endpoint, e.g. a local emulator
    pub endpoint_url: Option<String>,

    pub max_inflight_messages_per_queue: usize,
    pub messages_per_poll: usize,
    pub poll_timeout_seconds: u64,
    pub permit_acquire_timeout_millis: u64,
    pub source_shutdown_timeout_seconds: u64,
    pub back_pressure_mode: BackPressureMode,
    pub message_delivery_strategy: MessageDeliveryStrategy,
    pub acknowledgement_mode: AcknowledgementMode,
    pub acknowledgement_ordering: AcknowledgementOrdering,
    pub acknowledgement_interval_millis: u64,
    pub acknowledgement_threshold: usize,
    pub message_visibility_seconds: Option<u64>,
    pub queue_attribute_names: Vec<String>,
    pub message_attribute_names: Vec<String>,
    pub message_system_attribute_names: Vec<String>,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            endpoint_url: None,
            max_inflight_messages_per_queue: 10,
            messages_per_poll: 10,
            poll_timeout_seconds: 10,
            permit_acquire_timeout_millis: 10_000,
            source_shutdown_timeout_seconds: 20,
            back_pressure_mode: BackPressureMode::Auto,
            message_delivery_strategy: MessageDeliveryStrategy::SingleMessage,
            acknowledgement_mode: AcknowledgementMode::OnSuccess,
            acknowledgement_ordering: AcknowledgementOrdering::Parallel,
            acknowledgement_interval_millis: 1_000,
            acknowledgement_threshold: 10,
            message_visibility_seconds: None,
            queue_attribute_names: Vec::new(),
            message_attribute_names: vec![ALL_ATTRIBUTES.to_string()],
            message_system_attribute_names: vec![ALL_ATTRIBUTES.to_string()],
        }
    }
}

impl ListenerSettings {
    /// Load from an optional YAML file and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        Self::load_with_environment(path, environment_source())
    }

    /// Parse YAML text; environment variables are not consulted
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigurationError> {
        let config = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;

        let settings: Self = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn load_with_environment(
        path: Option<&Path>,
        environment: Environment,
    ) -> Result<Self, ConfigurationError> {
        let mut builder = Config::builder();

        // An explicit path must exist; a typo should not silently fall back
        // to defaults.
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        let config = builder.add_source(environment).build()?;
        let settings: Self = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check queue names and the resulting options
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.queue_names()?;
        self.to_options().validate()
    }

    pub fn queue_names(&self) -> Result<Vec<QueueName>, ValidationError> {
        self.queues.iter().map(|queue| queue.parse()).collect()
    }

    pub fn to_options(&self) -> ContainerOptions {
        let options = ContainerOptions::new()
            .with_max_inflight_messages_per_queue(self.max_inflight_messages_per_queue)
            .with_messages_per_poll(self.messages_per_poll)
            .with_poll_timeout(Duration::from_secs(self.poll_timeout_seconds))
            .with_permit_acquire_timeout(Duration::from_millis(self.permit_acquire_timeout_millis))
            .with_source_shutdown_timeout(Duration::from_secs(self.source_shutdown_timeout_seconds))
            .with_back_pressure_mode(self.back_pressure_mode)
            .with_message_delivery_strategy(self.message_delivery_strategy)
            .with_acknowledgement_mode(self.acknowledgement_mode)
            .with_acknowledgement_ordering(self.acknowledgement_ordering)
            .with_acknowledgement_interval(Duration::from_millis(self.acknowledgement_interval_millis))
            .with_acknowledgement_threshold(self.acknowledgement_threshold)
            .with_queue_attribute_names(self.queue_attribute_names.iter().cloned())
            .with_message_attribute_names(self.message_attribute_names.iter().cloned())
            .with_message_system_attribute_names(self.message_system_attribute_names.iter().cloned());

        match self.message_visibility_seconds {
            Some(seconds) => options.with_message_visibility(Duration::from_secs(seconds)),
            None => options,
        }
    }
}

fn environment_source() -> Environment {
    Environment::with_prefix(ENVIRONMENT_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("queues")
        .with_list_parse_key("queue_attribute_names")
        .with_list_parse_key("message_attribute_names")
        .with_list_parse_key("message_system_attribute_names")
}

//! Tests for settings loading.

use super::*;
use std::collections::HashMap;
use std::io::Write;
use tempfile::NamedTempFile;

fn create_test_environment(variables: &[(&str, &str)]) -> Environment {
    let source: HashMap<String, String> = variables
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    environment_source().source(Some(source))
}

fn create_test_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

// ============================================================================
// Default Tests
// ============================================================================

mod default_tests {
    use super::*;

    /// Verify that default settings produce the default options.
    #[test]
    fn test_default_settings_match_default_options() {
        let options = ListenerSettings::default().to_options();
        let defaults = ContainerOptions::default();

        assert_eq!(
            options.max_inflight_messages_per_queue(),
            defaults.max_inflight_messages_per_queue()
        );
        assert_eq!(options.messages_per_poll(), defaults.messages_per_poll());
        assert_eq!(options.poll_timeout(), defaults.poll_timeout());
        assert_eq!(options.permit_acquire_timeout(), defaults.permit_acquire_timeout());
        assert_eq!(options.source_shutdown_timeout(), defaults.source_shutdown_timeout());
        assert_eq!(options.back_pressure_mode(), defaults.back_pressure_mode());
        assert_eq!(options.acknowledgement_interval(), defaults.acknowledgement_interval());
        assert_eq!(options.acknowledgement_threshold(), defaults.acknowledgement_threshold());
        assert_eq!(options.message_visibility(), None);
        assert_eq!(options.message_attribute_names(), defaults.message_attribute_names());
    }

    /// Verify that loading with no sources gives the defaults.
    #[test]
    fn test_empty_environment_yields_defaults() {
        let settings =
            ListenerSettings::load_with_environment(None, create_test_environment(&[])).unwrap();

        assert_eq!(settings, ListenerSettings::default());
    }
}

// ============================================================================
// YAML Tests
// ============================================================================

mod yaml_tests {
    use super::*;

    /// Verify that YAML overrides only the fields it names.
    #[test]
    fn test_yaml_overrides_selected_fields() {
        // Arrange
        let yaml = r#"
queues:
  - orders
  - payments.fifo
max_inflight_messages_per_queue: 40
messages_per_poll: 5
back_pressure_mode: fixed_high_throughput
acknowledgement_ordering: ordered
acknowledgement_interval_millis: 0
acknowledgement_threshold: 0
message_visibility_seconds: 90
"#;

        // Act
        let settings = ListenerSettings::from_yaml_str(yaml).unwrap();
        let options = settings.to_options();

        // Assert
        assert_eq!(settings.queues, vec!["orders", "payments.fifo"]);
        assert_eq!(options.max_inflight_messages_per_queue(), 40);
        assert_eq!(options.messages_per_poll(), 5);
        assert_eq!(options.back_pressure_mode(), BackPressureMode::FixedHighThroughput);
        assert_eq!(options.acknowledgement_ordering(), AcknowledgementOrdering::Ordered);
        assert!(options.is_immediate_acknowledgement());
        assert_eq!(options.message_visibility(), Some(Duration::from_secs(90)));
        assert_eq!(options.poll_timeout(), Duration::from_secs(10));
    }

    /// Verify that an invalid option combination fails loading.
    #[test]
    fn test_invalid_option_combination_is_rejected() {
        let yaml = "max_inflight_messages_per_queue: 5\nmessages_per_poll: 10\n";

        let result = ListenerSettings::from_yaml_str(yaml);

        assert!(matches!(
            result,
            Err(ConfigurationError::Validation(ValidationError::OutOfRange { .. }))
        ));
    }

    /// Verify that an invalid queue name fails loading.
    #[test]
    fn test_invalid_queue_name_is_rejected() {
        let yaml = "queues:\n  - \"not a queue\"\n";

        let result = ListenerSettings::from_yaml_str(yaml);

        assert!(matches!(
            result,
            Err(ConfigurationError::Validation(ValidationError::InvalidFormat { .. }))
        ));
    }

    /// Verify that an unknown mode is a parsing error.
    #[test]
    fn test_unknown_mode_is_a_parsing_error() {
        let yaml = "acknowledgement_mode: sometimes\n";

        let result = ListenerSettings::from_yaml_str(yaml);

        assert!(matches!(result, Err(ConfigurationError::Parsing { .. })));
    }
}

// ============================================================================
// Source Layering Tests
// ============================================================================

mod layering_tests {
    use super::*;

    /// Verify that environment variables override the file.
    #[test]
    fn test_environment_overrides_file() {
        // Arrange
        let file = create_test_file("messages_per_poll: 4\npoll_timeout_seconds: 15\n");
        let environment = create_test_environment(&[
            ("SQS_LISTENER__MESSAGES_PER_POLL", "2"),
            ("SQS_LISTENER__QUEUES", "orders,payments"),
        ]);

        // Act
        let settings =
            ListenerSettings::load_with_environment(Some(file.path()), environment).unwrap();

        // Assert
        assert_eq!(settings.messages_per_poll, 2);
        assert_eq!(settings.poll_timeout_seconds, 15);
        assert_eq!(settings.queues, vec!["orders", "payments"]);
        let names: Vec<String> = settings
            .queue_names()
            .unwrap()
            .iter()
            .map(|queue| queue.to_string())
            .collect();
        assert_eq!(names, vec!["orders", "payments"]);
    }

    /// Verify that variables without the prefix are ignored.
    #[test]
    fn test_unrelated_environment_variables_are_ignored() {
        let environment = create_test_environment(&[
            ("OTHER_APP__MESSAGES_PER_POLL", "2"),
            ("SQS_LISTENER__ACKNOWLEDGEMENT_MODE", "always"),
        ]);

        let settings = ListenerSettings::load_with_environment(None, environment).unwrap();

        assert_eq!(settings.messages_per_poll, 10);
        assert_eq!(settings.acknowledgement_mode, AcknowledgementMode::Always);
    }

    /// Verify that a missing settings file is an error when one is named.
    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let directory = tempfile::tempdir().unwrap();
        let missing = directory.path().join("missing.yaml");

        let result =
            ListenerSettings::load_with_environment(Some(&missing), create_test_environment(&[]));

        assert!(matches!(result, Err(ConfigurationError::Parsing { .. })));
    }
}

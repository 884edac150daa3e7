//! Tests for error types.

use super::*;

/// Verify which backend errors are transient.
#[test]
fn test_backend_error_transience() {
    assert!(BackendError::ConnectionFailed {
        message: "network error".to_string(),
    }
    .is_transient());

    assert!(BackendError::Throttled {
        message: "slow down".to_string(),
    }
    .is_transient());

    assert!(!BackendError::QueueNotFound {
        queue_name: "orders".to_string(),
    }
    .is_transient());

    assert!(!BackendError::BatchTooLarge {
        size: 11,
        max_size: 10
    }
    .is_transient());
}

/// Verify the retry hints suggested by backend errors.
#[test]
fn test_retry_suggestions() {
    let throttled = BackendError::Throttled {
        message: "slow down".to_string(),
    };
    assert_eq!(throttled.retry_after(), Some(Duration::from_secs(5)));

    let not_found = BackendError::QueueNotFound {
        queue_name: "orders".to_string(),
    };
    assert_eq!(not_found.retry_after(), None);
}

/// Verify the text of conversion errors.
#[test]
fn test_conversion_error_messages() {
    let missing = ConversionError::MissingAttribute {
        payload: "{}".to_string(),
        attribute: "Type".to_string(),
    };
    assert_eq!(
        missing.to_string(),
        "Payload: '{}' does not contain a Type attribute"
    );

    let unsupported = ConversionError::Unsupported("read only");
    assert_eq!(unsupported.to_string(), "read only");
}

/// Verify that conversion errors convert into processing errors.
#[test]
fn test_conversion_error_becomes_processing_error() {
    let error: ProcessingError = ConversionError::MissingMessage {
        payload: "{}".to_string(),
    }
    .into();

    match error {
        ProcessingError::Conversion { message } => {
            assert!(message.contains("does not contain a message"))
        }
        other => panic!("Expected conversion error, got {:?}", other),
    }
}

/// Verify that batch listener errors report which messages failed.
#[test]
fn test_batch_listener_error_scope() {
    let whole = BatchListenerError::all(ProcessingError::listener("boom"));
    assert!(whole.is_whole_batch());

    let id: MessageId = "m-1".parse().unwrap();
    let partial = BatchListenerError::partial(vec![id], ProcessingError::listener("boom"));
    assert!(!partial.is_whole_batch());
    assert_eq!(partial.failed.len(), 1);
}

/// Verify that validation errors convert into container errors.
#[test]
fn test_validation_error_wraps_into_container_error() {
    let error: ContainerError = ValidationError::Required {
        field: "queues".to_string(),
    }
    .into();

    assert!(matches!(error, ContainerError::Validation(_)));
    assert!(error.to_string().contains("queues"));
}

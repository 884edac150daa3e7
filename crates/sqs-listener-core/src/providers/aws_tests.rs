//! Tests for the SQS backend.

use super::*;
use aws_sdk_sqs::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_sqs::types::MessageAttributeValue;

fn create_test_client() -> Client {
    let config = aws_sdk_sqs::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(Credentials::new("test", "test", None, None, "static"))
        .build();
    Client::from_conf(config)
}

/// Verify that a queue given by URL skips the URL lookup.
#[tokio::test]
async fn test_queue_url_identifier_used_directly() {
    let backend = SqsBackend::new(create_test_client());
    let queue: QueueName = "https://sqs.us-east-1.amazonaws.com/123456789012/orders"
        .parse()
        .unwrap();

    let url = backend.queue_url(&queue).await.unwrap();

    assert_eq!(url, "https://sqs.us-east-1.amazonaws.com/123456789012/orders");
}

/// Verify that a resolved queue URL is cached.
#[tokio::test]
async fn test_cached_queue_url_is_reused() {
    let backend = SqsBackend::new(create_test_client());
    let queue: QueueName = "orders".parse().unwrap();
    backend.queue_urls.write().await.insert(
        queue.clone(),
        "http://localhost:4566/000000000000/orders".to_string(),
    );

    let url = backend.queue_url(&queue).await.unwrap();

    assert_eq!(url, "http://localhost:4566/000000000000/orders");
}

/// Verify that empty batches make no service calls.
#[tokio::test]
async fn test_empty_batches_make_no_calls() {
    let backend = SqsBackend::new(create_test_client());
    let queue: QueueName = "orders".parse().unwrap();

    let deleted = backend.delete_messages(&queue, &[]).await.unwrap();
    let changed = backend
        .change_visibility(&queue, &[], Duration::from_secs(30))
        .await
        .unwrap();
    let attributes = backend.queue_attributes(&queue, &[]).await.unwrap();

    assert!(deleted.successful.is_empty());
    assert!(changed.successful.is_empty());
    assert!(attributes.is_empty());
}

/// Verify that a batch over ten entries is rejected before any call.
#[tokio::test]
async fn test_oversized_batch_rejected_before_call() {
    let backend = SqsBackend::new(create_test_client());
    let queue: QueueName = "orders".parse().unwrap();
    let receipts: Vec<ReceiptHandle> = (0..11)
        .map(|i| ReceiptHandle::new(format!("r-{}", i)))
        .collect();

    let result = backend.delete_messages(&queue, &receipts).await;

    assert!(matches!(
        result,
        Err(BackendError::BatchTooLarge {
            size: 11,
            max_size: 10
        })
    ));
}

/// Verify that SQS messages keep their attributes when converted.
#[test]
fn test_convert_message_copies_attributes() {
    let message = Message::builder()
        .message_id("m-1")
        .receipt_handle("r-1")
        .body("{\"id\":1}")
        .attributes(MessageSystemAttributeName::ApproximateReceiveCount, "2")
        .message_attributes(
            "tenant",
            MessageAttributeValue::builder()
                .data_type("String")
                .string_value("acme")
                .build()
                .unwrap(),
        )
        .build();

    let converted = convert_message(&message).unwrap();

    assert_eq!(converted.message_id.as_str(), "m-1");
    assert_eq!(converted.receipt_handle.as_str(), "r-1");
    assert_eq!(converted.body, "{\"id\":1}");
    assert_eq!(
        converted.system_attributes.get("ApproximateReceiveCount"),
        Some(&"2".to_string())
    );
    assert_eq!(
        converted.message_attributes.get("tenant"),
        Some(&"acme".to_string())
    );
}

/// Verify that SQS messages without an ID or receipt are rejected.
#[test]
fn test_convert_message_requires_id_and_receipt() {
    let without_receipt = Message::builder().message_id("m-1").body("x").build();
    assert!(convert_message(&without_receipt).is_none());

    let without_id = Message::builder().receipt_handle("r-1").body("x").build();
    assert!(convert_message(&without_id).is_none());
}

/// Verify that batch entry failures map back to their receipts.
#[test]
fn test_collect_batch_result_maps_indices_to_receipts() {
    let receipts = vec![
        ReceiptHandle::new("r-0".to_string()),
        ReceiptHandle::new("r-1".to_string()),
        ReceiptHandle::new("r-2".to_string()),
    ];

    let result = collect_batch_result(
        &receipts,
        vec!["0", "2"].into_iter(),
        vec![("1", "InternalError", "boom", false)].into_iter(),
    );

    assert_eq!(result.successful, vec![receipts[0].clone(), receipts[2].clone()]);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].receipt_handle, receipts[1]);
    assert_eq!(result.retryable(), vec![receipts[1].clone()]);
}

/// Verify how SQS service errors map to backend errors.
#[test]
fn test_service_error_classification() {
    let queue: QueueName = "orders".parse().unwrap();

    assert!(matches!(
        classify_service_error(
            "ReceiveMessage",
            &queue,
            "AWS.SimpleQueueService.NonExistentQueue",
            String::new()
        ),
        BackendError::QueueNotFound { .. }
    ));
    assert!(matches!(
        classify_service_error("ReceiveMessage", &queue, "AccessDenied", String::new()),
        BackendError::PermissionDenied { .. }
    ));
    let throttled =
        classify_service_error("ReceiveMessage", &queue, "RequestThrottled", String::new());
    assert!(throttled.is_transient());
    let unknown = classify_service_error("ReceiveMessage", &queue, "Odd", String::new());
    assert!(matches!(unknown, BackendError::ProviderError { ref code, .. } if code == "Odd"));
}

/// Verify the conversion of durations to SQS seconds.
#[test]
fn test_duration_conversions() {
    assert_eq!(to_seconds(Duration::from_millis(2500)), 2);
    assert_eq!(clamp_count(0), 1);
    assert_eq!(clamp_count(25), 10);
}

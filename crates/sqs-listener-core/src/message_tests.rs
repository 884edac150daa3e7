//! Tests for message types.

use super::*;

mod queue_name_tests {
    use super::*;

    /// Verify that bare queue names are accepted.
    #[test]
    fn test_bare_queue_names() {
        assert!(QueueName::new("orders".to_string()).is_ok());
        assert!(QueueName::new("orders_v2-eu".to_string()).is_ok());
        assert!(QueueName::new("orders.fifo".to_string()).is_ok());
    }

    /// Verify that invalid queue names are rejected.
    #[test]
    fn test_invalid_queue_names() {
        assert!(QueueName::new(String::new()).is_err());
        assert!(QueueName::new("a".repeat(81)).is_err());
        assert!(QueueName::new("orders queue".to_string()).is_err());
        assert!(QueueName::new(".fifo".to_string()).is_err());
        assert!(QueueName::new("orders.v2".to_string()).is_err());
    }

    /// Verify that a queue URL is accepted and its name extracted.
    #[test]
    fn test_queue_url_accepted() {
        let queue: QueueName = "https://sqs.us-east-1.amazonaws.com/123456789012/orders.fifo"
            .parse()
            .unwrap();

        assert!(queue.is_url());
        assert_eq!(queue.name(), "orders.fifo");
        assert!(queue.is_fifo());
    }

    /// Verify that a queue URL with an invalid name is rejected.
    #[test]
    fn test_queue_url_with_invalid_name_rejected() {
        let result = QueueName::new("https://sqs.us-east-1.amazonaws.com/123/".to_string());
        assert!(result.is_err());
    }

    /// Verify that only `.fifo` queues are treated as FIFO.
    #[test]
    fn test_standard_queue_is_not_fifo() {
        let queue: QueueName = "orders".parse().unwrap();
        assert!(!queue.is_fifo());
        assert!(!queue.is_url());
        assert_eq!(queue.name(), "orders");
        assert_eq!(queue.to_string(), "orders");
    }
}

mod identifier_tests {
    use super::*;

    /// Verify that an empty message ID is rejected.
    #[test]
    fn test_message_id_must_not_be_empty() {
        assert!("".parse::<MessageId>().is_err());
        assert_eq!("abc".parse::<MessageId>().unwrap().as_str(), "abc");
    }

    /// Verify that generated message IDs are unique.
    #[test]
    fn test_generated_message_ids_are_unique() {
        assert_ne!(MessageId::generate(), MessageId::generate());
    }
}

mod envelope_tests {
    use super::*;

    fn create_test_received() -> ReceivedMessage {
        ReceivedMessage::new(
            "m-1".parse().unwrap(),
            ReceiptHandle::new("r-1".to_string()),
            "hello",
        )
        .with_message_attribute("tenant", "acme")
        .with_system_attribute("ApproximateReceiveCount", "3")
        .with_system_attribute("MessageGroupId", "group-a")
    }

    /// Verify that the envelope keeps the received message fields.
    #[test]
    fn test_envelope_carries_received_fields() {
        // Arrange
        let queue: QueueName = "orders.fifo".parse().unwrap();
        let mut attributes = HashMap::new();
        attributes.insert("VisibilityTimeout".to_string(), "30".to_string());

        // Act
        let envelope = MessageEnvelope::from_received(
            queue.clone(),
            create_test_received(),
            7,
            Arc::new(attributes),
        );

        // Assert
        assert_eq!(envelope.queue, queue);
        assert_eq!(envelope.body, "hello");
        assert_eq!(envelope.sequence, 7);
        assert_eq!(envelope.message_attribute("tenant"), Some("acme"));
        assert_eq!(envelope.message_group_id(), Some("group-a"));
        assert_eq!(envelope.receive_count(), Some(3));
        assert_eq!(
            envelope.queue_attributes.get("VisibilityTimeout").map(String::as_str),
            Some("30")
        );
    }

    /// Verify that missing system attributes read as absent.
    #[test]
    fn test_missing_system_attributes() {
        let received = ReceivedMessage::new(
            "m-2".parse().unwrap(),
            ReceiptHandle::new("r-2".to_string()),
            "",
        );
        let envelope = MessageEnvelope::from_received(
            "orders".parse().unwrap(),
            received,
            0,
            Arc::default(),
        );

        assert_eq!(envelope.message_group_id(), None);
        assert_eq!(envelope.receive_count(), None);
    }
}

//! Consumer pipeline tests against in-memory collaborators.
//!
//! Drives the real per-delivery pipeline with the in-memory store, broker,
//! and cache, and a wiremock webhook, covering the happy path, transient
//! failure, exhaustion, duplicates, and poison deliveries.

use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use courier_core::{
    error::CourierError,
    guard::{CircuitBreaker, CircuitConfig, RateLimiter},
    models::{MessageStatus, QueueMessage},
    policy::ProcessingPolicy,
};
use courier_engine::{HttpWebhookClient, Processor};
use courier_testing::{fixtures, TestPorts};
use tokio_util::sync::CancellationToken;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

fn processor_for(ports: &TestPorts, webhook_url: String, max_retries: u32) -> Processor {
    let webhook = HttpWebhookClient::new(
        webhook_url,
        Duration::from_secs(5),
        Arc::new(RateLimiter::new(50.0, 100)),
        Arc::new(CircuitBreaker::new("webhook-client", CircuitConfig::default())),
    )
    .expect("webhook client builds");

    Processor::new(
        ports.repository.clone(),
        ports.queue.clone(),
        ports.idempotency.clone(),
        Arc::new(webhook),
        ProcessingPolicy::new(max_retries, Duration::from_secs(240)),
    )
}

#[tokio::test]
async fn happy_path_marks_message_sent_and_processed() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "message": "ok",
            "messageId": "WH1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let ports = TestPorts::new();
    let message = fixtures::message_in_state(MessageStatus::Processing, 0, Utc::now());
    ports.repository.insert(message.clone()).await;

    let processor = processor_for(&ports, server.uri(), 5);
    let delivery = fixtures::delivery_for(&message, 7);
    processor.process_delivery(delivery).await.expect("delivery resolves");

    let stored = ports.repository.get(message.id).await.unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);

    let hex = message.id.to_hex();
    assert!(ports.idempotency.processed_record(&hex).await.is_some());
    assert_eq!(ports.idempotency.webhook_id(&hex).await.as_deref(), Some("WH1"));

    assert!(ports.queue.dead_letters().await.is_empty());
    assert_eq!(ports.queue.acked_tags().await, vec![7]);

    let stats = processor.stats().await;
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.dead_lettered, 0);
}

#[tokio::test]
async fn transient_webhook_failures_then_success() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "message": "ok",
            "messageId": "WH2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let ports = TestPorts::new();
    let message = fixtures::message_in_state(MessageStatus::Processing, 0, Utc::now());
    ports.repository.insert(message.clone()).await;

    let processor = processor_for(&ports, server.uri(), 5);

    // First attempt fails and parks the delivery on the retry queue.
    let delivery = fixtures::delivery_for(&message, 1);
    processor.process_delivery(delivery).await.expect("failure is resolved via retry");
    assert_eq!(ports.queue.retry_depth().await, 1);
    let after_first = ports.repository.get(message.id).await.unwrap();
    assert_eq!(after_first.retry_count, 1);
    assert_eq!(after_first.status, MessageStatus::Processing);

    // TTL expiry returns it to the main queue; second attempt fails too.
    assert_eq!(ports.queue.release_retries().await, 1);
    let delivery = ports.queue.receive_now().await;
    processor.process_delivery(delivery).await.expect("failure is resolved via retry");
    assert_eq!(ports.queue.retry_depth().await, 1);

    // Third attempt succeeds.
    assert_eq!(ports.queue.release_retries().await, 1);
    let delivery = ports.queue.receive_now().await;
    processor.process_delivery(delivery).await.expect("delivery resolves");

    let stored = ports.repository.get(message.id).await.unwrap();
    assert_eq!(stored.status, MessageStatus::Sent);
    assert_eq!(stored.retry_count, 2);
    assert!(ports.queue.dead_letters().await.is_empty());

    let stats = processor.stats().await;
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.sent, 1);
}

#[tokio::test]
async fn continuous_failures_exhaust_retry_budget() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let ports = TestPorts::new();
    let message = fixtures::message_in_state(MessageStatus::Processing, 0, Utc::now());
    ports.repository.insert(message.clone()).await;

    let processor = processor_for(&ports, server.uri(), 3);

    let mut delivery = fixtures::delivery_for(&message, 1);
    for attempt in 1..=3 {
        processor.process_delivery(delivery.clone()).await.expect("attempt resolves");
        if attempt < 3 {
            assert_eq!(ports.queue.release_retries().await, 1);
            delivery = ports.queue.receive_now().await;
        }
    }

    let stored = ports.repository.get(message.id).await.unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);
    assert_eq!(stored.retry_count, 3);

    // Exactly one dead-letter enqueue for the exhausted message.
    assert_eq!(ports.queue.dead_letters().await.len(), 1);
    assert_eq!(ports.queue.retry_depth().await, 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn redelivery_of_processed_message_becomes_duplicate() {
    let server = MockServer::start().await;
    // No mock mounted: any webhook call would 404 and fail the test below.

    let ports = TestPorts::new();
    let message = fixtures::message_in_state(MessageStatus::Sent, 0, Utc::now());
    ports.repository.insert(message.clone()).await;
    ports.idempotency.seed_processed(&message.id.to_hex()).await;

    let processor = processor_for(&ports, server.uri(), 5);
    let delivery = fixtures::delivery_for(&message, 2);
    processor.process_delivery(delivery).await.expect("duplicate resolves");

    let stored = ports.repository.get(message.id).await.unwrap();
    assert_eq!(stored.status, MessageStatus::Duplicate);
    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(processor.stats().await.duplicates, 1);
}

#[tokio::test]
async fn malformed_payload_goes_to_dead_letter_queue() {
    let server = MockServer::start().await;
    let ports = TestPorts::new();
    let processor = processor_for(&ports, server.uri(), 5);

    let delivery = fixtures::raw_delivery(b"not json", 3);
    let error = processor.process_delivery(delivery).await.unwrap_err();
    assert!(matches!(error, CourierError::MalformedPayload { .. }));

    let dead_letters = ports.queue.dead_letters().await;
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(&dead_letters[0].body[..], b"not json");

    // The processor keeps working after a poison delivery.
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let message = fixtures::message_in_state(MessageStatus::Processing, 0, Utc::now());
    ports.repository.insert(message.clone()).await;
    processor
        .process_delivery(fixtures::delivery_for(&message, 4))
        .await
        .expect("valid delivery resolves");
    assert_eq!(
        ports.repository.get(message.id).await.unwrap().status,
        MessageStatus::Sent
    );
}

#[tokio::test]
async fn invalid_id_is_poison() {
    let server = MockServer::start().await;
    let ports = TestPorts::new();
    let processor = processor_for(&ports, server.uri(), 5);

    let payload = QueueMessage {
        id: "definitely-not-hex".to_string(),
        content: "hi".to_string(),
        to: "+90111111111".to_string(),
        retry: 0,
    };
    let delivery = fixtures::raw_delivery(&payload.to_bytes().unwrap(), 5);

    let error = processor.process_delivery(delivery).await.unwrap_err();
    assert!(matches!(error, CourierError::InvalidId { .. }));
    assert_eq!(ports.queue.dead_letters().await.len(), 1);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn valid_id_without_record_is_poison() {
    let server = MockServer::start().await;
    let ports = TestPorts::new();
    let processor = processor_for(&ports, server.uri(), 5);

    let message = fixtures::message_in_state(MessageStatus::Processing, 0, Utc::now());
    // Never inserted into the repository.
    let delivery = fixtures::delivery_for(&message, 6);

    let error = processor.process_delivery(delivery).await.unwrap_err();
    assert!(matches!(error, CourierError::NotFound { .. }));
    assert_eq!(ports.queue.dead_letters().await.len(), 1);
}

#[tokio::test]
async fn store_load_failure_routes_to_retry_queue() {
    let server = MockServer::start().await;
    let ports = TestPorts::new();
    let message = fixtures::message_in_state(MessageStatus::Processing, 0, Utc::now());
    ports.repository.insert(message.clone()).await;
    ports.repository.fail_next_operation("mongo hiccup").await;

    let processor = processor_for(&ports, server.uri(), 5);
    let delivery = fixtures::delivery_for(&message, 7);

    let error = processor.process_delivery(delivery).await.unwrap_err();
    assert!(error.is_retryable());
    assert_eq!(ports.queue.retry_depth().await, 1);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn idempotency_check_failure_routes_to_retry_queue() {
    let server = MockServer::start().await;
    let ports = TestPorts::new();
    let message = fixtures::message_in_state(MessageStatus::Processing, 0, Utc::now());
    ports.repository.insert(message.clone()).await;
    ports.idempotency.fail_next_operation("redis hiccup").await;

    let processor = processor_for(&ports, server.uri(), 5);
    let delivery = fixtures::delivery_for(&message, 8);

    let error = processor.process_delivery(delivery).await.unwrap_err();
    assert!(matches!(error, CourierError::Cache { .. }));
    assert_eq!(ports.queue.retry_depth().await, 1);
}

#[tokio::test]
async fn stale_message_fails_at_the_policy_gate() {
    let server = MockServer::start().await;
    let ports = TestPorts::new();
    let stale_since = Utc::now() - TimeDelta::minutes(5);
    let message = fixtures::message_in_state(MessageStatus::Processing, 0, stale_since);
    ports.repository.insert(message.clone()).await;

    let processor = processor_for(&ports, server.uri(), 5);
    processor
        .process_delivery(fixtures::delivery_for(&message, 9))
        .await
        .expect("terminal routing resolves");

    let stored = ports.repository.get(message.id).await.unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);
    assert_eq!(ports.queue.dead_letters().await.len(), 1);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn already_exhausted_message_fails_at_the_policy_gate() {
    let server = MockServer::start().await;
    let ports = TestPorts::new();
    let message = fixtures::message_in_state(MessageStatus::Processing, 5, Utc::now());
    ports.repository.insert(message.clone()).await;

    let processor = processor_for(&ports, server.uri(), 5);
    processor
        .process_delivery(fixtures::delivery_for(&message, 10))
        .await
        .expect("terminal routing resolves");

    assert_eq!(
        ports.repository.get(message.id).await.unwrap().status,
        MessageStatus::Failed
    );
    assert_eq!(ports.queue.dead_letters().await.len(), 1);
}

#[tokio::test]
async fn mark_failure_after_webhook_success_leaves_processing_for_sweeper() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "message": "ok",
            "messageId": "WH9"
        })))
        .mount(&server)
        .await;

    let ports = TestPorts::new();
    let message = fixtures::message_in_state(MessageStatus::Processing, 0, Utc::now());
    ports.repository.insert(message.clone()).await;

    let processor = processor_for(&ports, server.uri(), 5);

    // The idempotency check and the webhook-id write succeed; only the
    // processed-mark write fails.
    ports.idempotency.fail_next_mark("redis down").await;

    let result = processor.process_delivery(fixtures::delivery_for(&message, 11)).await;
    assert!(result.is_err());

    // The row never reached `sent`, so the sweeper will reconcile it.
    let stored = ports.repository.get(message.id).await.unwrap();
    assert_eq!(stored.status, MessageStatus::Processing);
    assert!(ports.queue.dead_letters().await.is_empty());
    assert_eq!(
        ports.idempotency.webhook_id(&message.id.to_hex()).await.as_deref(),
        Some("WH9")
    );
}

#[tokio::test]
async fn run_loop_drains_deliveries_until_cancelled() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "message": "ok",
            "messageId": "WH3"
        })))
        .expect(2)
        .mount(&server)
        .await;

    let ports = TestPorts::new();
    let first = fixtures::message_in_state(MessageStatus::Processing, 0, Utc::now());
    let second = fixtures::message_in_state(MessageStatus::Processing, 0, Utc::now());
    ports.repository.insert(first.clone()).await;
    ports.repository.insert(second.clone()).await;

    let processor = Arc::new(processor_for(&ports, server.uri(), 5));
    let shutdown = CancellationToken::new();
    let runner = {
        let processor = processor.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { processor.run(token).await })
    };

    ports.queue.inject(&first.to_queue_message());
    ports.queue.inject(&second.to_queue_message());

    // Wait until both deliveries have been resolved.
    for _ in 0..200 {
        if processor.stats().await.sent == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    shutdown.cancel();
    runner.await.unwrap();

    assert_eq!(ports.repository.get(first.id).await.unwrap().status, MessageStatus::Sent);
    assert_eq!(ports.repository.get(second.id).await.unwrap().status, MessageStatus::Sent);
}

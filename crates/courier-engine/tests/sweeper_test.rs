//! Stale sweeper tests against in-memory collaborators.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use courier_core::models::{MessageStatus, QueueMessage};
use courier_engine::{StaleSweeper, SweeperConfig};
use courier_testing::{fixtures, TestPorts};

fn sweeper_for(ports: &TestPorts) -> StaleSweeper {
    StaleSweeper::new(
        ports.repository.clone(),
        ports.queue.clone(),
        SweeperConfig {
            sweep_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(240),
            dlq_alert_threshold: 10,
        },
    )
}

#[tokio::test]
async fn stale_processing_record_is_failed_and_dead_lettered() {
    let ports = TestPorts::new();
    let stale_since = Utc::now() - TimeDelta::minutes(5);
    let message = fixtures::message_in_state(MessageStatus::Processing, 1, stale_since);
    ports.repository.insert(message.clone()).await;

    let recovered = sweeper_for(&ports).sweep_once().await.expect("sweep succeeds");
    assert_eq!(recovered, 1);

    let stored = ports.repository.get(message.id).await.unwrap();
    assert_eq!(stored.status, MessageStatus::Failed);

    let dead_letters = ports.queue.dead_letters().await;
    assert_eq!(dead_letters.len(), 1);
    let payload = QueueMessage::from_bytes(&dead_letters[0].body).unwrap();
    assert_eq!(payload.id, message.id.to_hex());
    assert_eq!(payload.retry, 1);
}

#[tokio::test]
async fn fresh_processing_records_are_left_alone() {
    let ports = TestPorts::new();
    let message = fixtures::message_in_state(MessageStatus::Processing, 0, Utc::now());
    ports.repository.insert(message.clone()).await;

    let recovered = sweeper_for(&ports).sweep_once().await.expect("sweep succeeds");
    assert_eq!(recovered, 0);
    assert_eq!(
        ports.repository.get(message.id).await.unwrap().status,
        MessageStatus::Processing
    );
    assert!(ports.queue.dead_letters().await.is_empty());
}

#[tokio::test]
async fn terminal_records_are_never_swept() {
    let ports = TestPorts::new();
    let old = Utc::now() - TimeDelta::minutes(30);
    for status in [MessageStatus::Sent, MessageStatus::Failed, MessageStatus::Duplicate] {
        ports.repository.insert(fixtures::message_in_state(status, 0, old)).await;
    }

    let recovered = sweeper_for(&ports).sweep_once().await.expect("sweep succeeds");
    assert_eq!(recovered, 0);
    assert!(ports.queue.dead_letters().await.is_empty());
}

#[tokio::test]
async fn one_routing_failure_does_not_abort_the_sweep() {
    let ports = TestPorts::new();
    let stale_since = Utc::now() - TimeDelta::minutes(10);
    let first = fixtures::message_in_state(MessageStatus::Processing, 0, stale_since);
    let second = fixtures::message_in_state(MessageStatus::Processing, 0, stale_since);
    ports.repository.insert(first.clone()).await;
    ports.repository.insert(second.clone()).await;

    ports.queue.fail_next_dead_letter("broker flapping").await;

    let recovered = sweeper_for(&ports).sweep_once().await.expect("sweep succeeds");
    assert_eq!(recovered, 1);
    assert_eq!(ports.queue.dead_letters().await.len(), 1);

    // One of the two is still processing and will be retried next sweep;
    // the other is failed.
    let statuses = [
        ports.repository.get(first.id).await.unwrap().status,
        ports.repository.get(second.id).await.unwrap().status,
    ];
    assert!(statuses.contains(&MessageStatus::Processing));
    assert!(statuses.contains(&MessageStatus::Failed));
}

#[tokio::test]
async fn second_sweep_recovers_what_the_first_could_not() {
    let ports = TestPorts::new();
    let stale_since = Utc::now() - TimeDelta::minutes(10);
    let message = fixtures::message_in_state(MessageStatus::Processing, 0, stale_since);
    ports.repository.insert(message.clone()).await;

    let sweeper = sweeper_for(&ports);

    ports.queue.fail_next_dead_letter("broker flapping").await;
    assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
    assert_eq!(
        ports.repository.get(message.id).await.unwrap().status,
        MessageStatus::Processing
    );

    assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
    assert_eq!(
        ports.repository.get(message.id).await.unwrap().status,
        MessageStatus::Failed
    );
}

//! Producer scheduler tests against in-memory collaborators.

use std::time::Duration;

use courier_core::{models::MessageStatus, ports::MessageRepository};
use courier_engine::{ProducerConfig, Scheduler};
use courier_testing::{fixtures, TestPorts};

fn scheduler_for(ports: &TestPorts, config: ProducerConfig) -> Scheduler {
    Scheduler::new(ports.repository.clone(), ports.queue.clone(), config)
}

#[tokio::test]
async fn dispatch_publishes_batch_and_promotes_to_processing() {
    let ports = TestPorts::new();
    for i in 0..3 {
        ports.repository.insert(fixtures::unsent_message("+90111111111", &format!("m{i}"))).await;
    }

    let scheduler = scheduler_for(
        &ports,
        ProducerConfig { batch_size: 2, poll_interval: Duration::from_secs(120) },
    );
    let published = scheduler.dispatch_once().await.expect("scan succeeds");
    assert_eq!(published, 2);

    let payloads = ports.queue.published().await;
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[0].content, "m0");
    assert_eq!(payloads[0].retry, 0);
    assert_eq!(payloads[0].to, "+90111111111");

    let statuses: Vec<MessageStatus> = {
        let mut statuses = Vec::new();
        for message in ports.repository.list().await.unwrap() {
            statuses.push(message.status);
        }
        statuses
    };
    assert_eq!(
        statuses,
        vec![MessageStatus::Processing, MessageStatus::Processing, MessageStatus::Unsent]
    );
}

#[tokio::test]
async fn publish_failure_skips_message_without_aborting_batch() {
    let ports = TestPorts::new();
    let first = fixtures::unsent_message("+90111111111", "first");
    let second = fixtures::unsent_message("+90222222222", "second");
    ports.repository.insert(first.clone()).await;
    ports.repository.insert(second.clone()).await;

    ports.queue.fail_next_publish("broker flapping").await;

    let scheduler = scheduler_for(&ports, ProducerConfig::default());
    let published = scheduler.dispatch_once().await.expect("scan succeeds");
    assert_eq!(published, 1);

    // The failed message stays unsent for the next tick.
    assert_eq!(
        ports.repository.get(first.id).await.unwrap().status,
        MessageStatus::Unsent
    );
    assert_eq!(
        ports.repository.get(second.id).await.unwrap().status,
        MessageStatus::Processing
    );
}

#[tokio::test]
async fn scan_failure_surfaces_to_caller() {
    let ports = TestPorts::new();
    ports.repository.fail_next_operation("store down").await;

    let scheduler = scheduler_for(&ports, ProducerConfig::default());
    assert!(scheduler.dispatch_once().await.is_err());
}

#[tokio::test]
async fn start_is_idempotent_and_stop_halts_the_loop() {
    let ports = TestPorts::new();
    ports.repository.insert(fixtures::unsent_message("+90111111111", "tick")).await;

    let scheduler = scheduler_for(
        &ports,
        ProducerConfig { batch_size: 2, poll_interval: Duration::from_millis(20) },
    );

    assert!(!scheduler.is_running().await);
    scheduler.start().await;
    scheduler.start().await; // second start is a no-op
    assert!(scheduler.is_running().await);

    // Give the loop a couple of ticks to pick up the seeded message.
    for _ in 0..100 {
        if !ports.queue.published().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(ports.queue.published().await.len(), 1);

    scheduler.stop().await;
    assert!(!scheduler.is_running().await);
    scheduler.stop().await; // second stop is a no-op

    // No further ticks after stop.
    let published_after_stop = ports.queue.published().await.len();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(ports.queue.published().await.len(), published_after_stop);
}

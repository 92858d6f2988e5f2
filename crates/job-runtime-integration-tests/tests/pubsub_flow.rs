//! End-to-end tests for the pub/sub backend over the in-memory broker.
//!
//! These tests exercise push, consumption, retry, dead-letter routing and
//! shutdown through the public `Backend` surface only.

mod common;

use common::{pubsub_backend, pubsub_config, wait_until, RecordingProcessor};
use job_runtime::providers::InMemoryPubSub;
use job_runtime::{Job, JobBackend, JobError, LifecycleState, ProcessorBindings};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_pushed_job_reaches_bound_processor() {
    let broker = InMemoryPubSub::new();
    let backend = pubsub_backend(&broker, pubsub_config(3)).await;
    let processor = RecordingProcessor::new();
    backend
        .set_processor(ProcessorBindings::new().bind("k", "workers", processor.clone()))
        .unwrap();
    backend.start().await.unwrap();

    backend
        .push(&Job::new("fill", vec![json!(1), json!("two")]).with_queue("k"))
        .await
        .unwrap();

    wait_until(|| broker.finished_count("k", "workers") == 1).await;
    let invocations = processor.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].queue, "k");
    assert_eq!(invocations[0].args, vec![json!(1), json!("two")]);
    assert!(!invocations[0].batches_supported);

    backend.stop().await;
    assert_eq!(backend.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_both_topic_and_dead_letter_topic_are_subscribed() {
    let broker = InMemoryPubSub::new();
    let backend = pubsub_backend(&broker, pubsub_config(3)).await;
    backend
        .set_processor(ProcessorBindings::new().bind("k", "workers", RecordingProcessor::new()))
        .unwrap();

    backend.start().await.unwrap();

    let subscriptions = broker.subscriptions();
    assert!(subscriptions.contains(&("k".to_string(), "workers".to_string())));
    assert!(subscriptions.contains(&("k-dlq".to_string(), "workers".to_string())));

    backend.stop().await;
}

#[tokio::test]
async fn test_pushes_rotate_across_brokers() {
    let broker = InMemoryPubSub::new();
    let backend = pubsub_backend(&broker, pubsub_config(3)).await;

    for n in 0..4 {
        backend
            .push(&Job::new("fill", vec![json!(n)]).with_queue("k"))
            .await
            .unwrap();
    }

    let addresses: Vec<String> = broker
        .published_to("k")
        .into_iter()
        .map(|record| record.address)
        .collect();
    assert_eq!(addresses.len(), 4);
    assert_ne!(addresses[0], addresses[1]);
    assert_eq!(addresses[0], addresses[2]);
    assert_eq!(addresses[1], addresses[3]);

    backend.stop().await;
}

#[tokio::test]
async fn test_unreachable_broker_fails_only_its_turn() {
    let broker = InMemoryPubSub::new();
    let backend = pubsub_backend(&broker, pubsub_config(3)).await;
    broker.set_unreachable("10.0.0.1:4150", true);

    let mut results = Vec::new();
    for n in 0..2 {
        results.push(
            backend
                .push(&Job::new("fill", vec![json!(n)]).with_queue("k"))
                .await,
        );
    }

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(JobError::Connect { address, .. }) if address == "10.0.0.1:4150")));
    let records = broker.published_to("k");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].address, "10.0.0.2:4150");

    backend.stop().await;
}

#[tokio::test]
async fn test_scheduled_push_is_deferred() {
    let broker = InMemoryPubSub::new();
    let backend = pubsub_backend(&broker, pubsub_config(3)).await;
    let processor = RecordingProcessor::new();
    backend
        .set_processor(ProcessorBindings::new().bind("k", "workers", processor.clone()))
        .unwrap();
    backend.start().await.unwrap();

    let job = Job::new("fill", vec![]).with_queue("k").with_delay(chrono::Duration::minutes(5));
    backend.push(&job).await.unwrap();

    let records = broker.published_to("k");
    assert_eq!(records.len(), 1);
    assert!(records[0].delay > Duration::from_secs(290));
    assert!(records[0].delay <= Duration::from_secs(300));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(processor.calls(), 0);

    backend.stop().await;
}

#[tokio::test]
async fn test_exhausted_job_is_dead_lettered_and_replayed() {
    let broker = InMemoryPubSub::new();
    let backend = pubsub_backend(&broker, pubsub_config(3)).await;
    let processor = RecordingProcessor::failing_first(3);
    backend
        .set_processor(ProcessorBindings::new().bind("k", "workers", processor.clone()))
        .unwrap();
    backend.start().await.unwrap();

    let job = Job::new("fill", vec![json!(42)]).with_queue("k");
    backend.push(&job).await.unwrap();

    wait_until(|| broker.finished_count("k-dlq", "workers") == 1).await;

    assert_eq!(broker.requeued_count("k", "workers"), 3);
    assert_eq!(broker.finished_count("k", "workers"), 1);
    assert_eq!(processor.calls(), 4);

    let dead = broker.published_to("k-dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(Job::from_bytes(&dead[0].body).unwrap(), job);

    backend.stop().await;
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_job() {
    let broker = InMemoryPubSub::new();
    let backend = pubsub_backend(&broker, pubsub_config(3)).await;
    let processor = RecordingProcessor::new().with_delay(Duration::from_millis(200));
    backend
        .set_processor(ProcessorBindings::new().bind("k", "workers", processor.clone()))
        .unwrap();
    backend.start().await.unwrap();

    backend
        .push(&Job::new("fill", vec![]).with_queue("k"))
        .await
        .unwrap();
    wait_until(|| processor.calls() == 1).await;

    backend.stop().await;

    assert_eq!(processor.completed(), 1);
    assert_eq!(broker.finished_count("k", "workers"), 1);
    assert!(backend.context().is_cancelled());
    assert_eq!(broker.stopped_producers().len(), 2);
}

#[tokio::test]
async fn test_push_after_stop_is_rejected() {
    let broker = InMemoryPubSub::new();
    let backend = pubsub_backend(&broker, pubsub_config(3)).await;
    backend.start().await.unwrap();
    backend.stop().await;

    let result = backend
        .push(&Job::new("fill", vec![]).with_queue("k"))
        .await;

    assert!(matches!(result, Err(JobError::Publish { .. })));
}

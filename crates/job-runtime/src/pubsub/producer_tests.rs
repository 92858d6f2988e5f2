//! Tests for the round-robin producer pool.

use super::*;
use crate::job::Job;
use crate::providers::memory::InMemoryPubSub;
use crate::pubsub::transport::MockProducerConnection;
use chrono::Utc;
use serde_json::json;

fn addresses(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("10.0.0.{}:4150", i + 1)).collect()
}

fn topic(name: &str) -> TopicName {
    TopicName::new(name).unwrap()
}

mod construction {
    use super::*;

    #[tokio::test]
    async fn test_connect_pings_every_node() {
        let broker = InMemoryPubSub::new();

        let pool = ProducerPool::connect(&broker, &addresses(3)).await.unwrap();

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.cursor(), 0);
    }

    #[tokio::test]
    async fn test_empty_address_list_is_configuration_error() {
        let broker = InMemoryPubSub::new();

        let result = ProducerPool::connect(&broker, &[]).await;

        assert!(matches!(result, Err(JobError::Configuration(_))));
    }

    /// Verify an unreachable node fails construction and stops the nodes already connected.
    #[tokio::test]
    async fn test_unreachable_node_stops_connected_producers() {
        let broker = InMemoryPubSub::new();
        let nodes = addresses(3);
        broker.set_unreachable(&nodes[2], true);

        let result = ProducerPool::connect(&broker, &nodes).await;

        match result {
            Err(JobError::Connect { address, .. }) => assert_eq!(address, nodes[2]),
            other => panic!("Expected connect error, got {:?}", other.map(|_| ())),
        }
        let mut stopped = broker.stopped_producers();
        stopped.sort();
        assert_eq!(stopped, vec![nodes[0].clone(), nodes[1].clone()]);
    }
}

mod rotation {
    use super::*;

    /// Verify M publishes over N nodes are spread strictly cyclically.
    #[tokio::test]
    async fn test_publishes_rotate_in_cyclic_order() {
        let broker = InMemoryPubSub::new();
        let nodes = addresses(3);
        let pool = ProducerPool::connect(&broker, &nodes).await.unwrap();

        for i in 0..7 {
            pool.publish(&topic("k"), Duration::ZERO, Bytes::from(format!("m{}", i)))
                .await
                .unwrap();
        }

        let used: Vec<String> = broker.published().into_iter().map(|r| r.address).collect();
        let expected: Vec<String> = (0..7).map(|i| nodes[i % 3].clone()).collect();
        assert_eq!(used, expected);
        assert_eq!(pool.cursor(), 7 % 3);
    }

    #[tokio::test]
    async fn test_fair_distribution_counts() {
        let broker = InMemoryPubSub::new();
        let nodes = addresses(4);
        let pool = ProducerPool::connect(&broker, &nodes).await.unwrap();

        for _ in 0..10 {
            pool.publish(&topic("k"), Duration::ZERO, Bytes::from_static(b"{}"))
                .await
                .unwrap();
        }

        for node in &nodes {
            let count = broker
                .published()
                .iter()
                .filter(|r| &r.address == node)
                .count();
            assert!(count == 2 || count == 3, "{} used {} times", node, count);
        }
    }

    /// Verify a failed send still advances the rotation.
    #[tokio::test]
    async fn test_failed_publish_advances_cursor() {
        let broker = InMemoryPubSub::new();
        let nodes = addresses(2);
        let pool = ProducerPool::connect(&broker, &nodes).await.unwrap();
        broker.set_unreachable(&nodes[0], true);

        let first = pool
            .publish(&topic("k"), Duration::ZERO, Bytes::from_static(b"a"))
            .await;
        let second = pool
            .publish(&topic("k"), Duration::ZERO, Bytes::from_static(b"b"))
            .await;

        assert!(first.is_err());
        assert!(second.is_ok());
        assert_eq!(broker.published()[0].address, nodes[1]);
    }

    #[tokio::test]
    async fn test_concurrent_publishes_are_all_delivered() {
        let broker = InMemoryPubSub::new();
        let pool = Arc::new(ProducerPool::connect(&broker, &addresses(3)).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..30 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.publish(&topic("k"), Duration::ZERO, Bytes::from(format!("{}", i)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let published = broker.published();
        assert_eq!(published.len(), 30);
        for node in addresses(3) {
            assert_eq!(published.iter().filter(|r| r.address == node).count(), 10);
        }
    }
}

mod delayed_publish {
    use super::*;

    #[tokio::test]
    async fn test_zero_delay_uses_immediate_publish() {
        let mut producer = MockProducerConnection::new();
        producer.expect_publish().times(1).returning(|_, _| Ok(()));
        producer.expect_deferred_publish().times(0);
        let pool = ProducerPool::from_connections(vec![Arc::new(producer)]).unwrap();

        pool.publish(&topic("k"), Duration::ZERO, Bytes::from_static(b"{}"))
            .await
            .unwrap();
    }

    /// Verify a job scheduled 5m1s ahead goes out as a deferred publish of about 301s.
    #[tokio::test]
    async fn test_scheduled_job_uses_deferred_publish() {
        let job = Job::new("fill", vec![json!(1)])
            .with_queue("k")
            .with_at(Utc::now() + chrono::Duration::seconds(301));
        let payload = job.to_bytes().unwrap();
        let expected_payload = payload.clone();

        let mut producer = MockProducerConnection::new();
        producer.expect_publish().times(0);
        producer
            .expect_deferred_publish()
            .withf(move |topic, delay, body| {
                topic.as_str() == "k"
                    && *delay >= Duration::from_secs(300)
                    && *delay <= Duration::from_secs(301)
                    && body == &expected_payload
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let pool = ProducerPool::from_connections(vec![Arc::new(producer)]).unwrap();

        let delay = job.delay_from(Utc::now()).unwrap();
        pool.publish(&topic(&job.queue), delay, payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_deferred_publish_is_recorded_with_delay() {
        let broker = InMemoryPubSub::new();
        let pool = ProducerPool::connect(&broker, &addresses(1)).await.unwrap();

        pool.publish(&topic("k"), Duration::from_secs(90), Bytes::from_static(b"{}"))
            .await
            .unwrap();

        assert_eq!(broker.published()[0].delay, Duration::from_secs(90));
    }
}

#[tokio::test]
async fn test_stop_stops_every_producer() {
    let broker = InMemoryPubSub::new();
    let nodes = addresses(2);
    let pool = ProducerPool::connect(&broker, &nodes).await.unwrap();

    pool.stop().await;

    let mut stopped = broker.stopped_producers();
    stopped.sort();
    assert_eq!(stopped, nodes);
    assert!(pool
        .publish(&topic("k"), Duration::ZERO, Bytes::from_static(b"{}"))
        .await
        .is_err());
}

#[test]
fn test_empty_connection_list_is_rejected() {
    assert!(ProducerPool::from_connections(Vec::new()).is_err());
}

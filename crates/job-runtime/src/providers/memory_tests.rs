//! Tests for the in-memory brokers.

use super::*;
use serde_json::json;

fn topic(name: &str) -> TopicName {
    TopicName::new(name).unwrap()
}

fn request(topic_name: &str, channel: &str) -> SubscribeRequest {
    SubscribeRequest {
        topic: topic(topic_name),
        channel: ChannelName::new(channel).unwrap(),
        lookupd_addresses: Vec::new(),
        max_in_flight: 10,
    }
}

async fn next(subscription: &mut Box<dyn Subscription>) -> Delivery {
    tokio::time::timeout(Duration::from_secs(2), subscription.next_delivery())
        .await
        .expect("delivery within 2s")
        .expect("open subscription")
}

// ============================================================================
// Pub/Sub Broker Tests
// ============================================================================

mod pubsub_broker {
    use super::*;

    /// Verify messages published before any subscriber are kept for the first channel.
    #[tokio::test]
    async fn test_backlog_drains_to_first_channel() {
        let broker = InMemoryPubSub::new();
        let producer = broker.connect_producer("n1").await.unwrap();

        producer
            .publish(&topic("k"), Bytes::from_static(b"early"))
            .await
            .unwrap();
        let mut subscription = broker.subscribe(request("k", "workers")).await.unwrap();

        let delivery = next(&mut subscription).await;
        assert_eq!(delivery.body, Bytes::from_static(b"early"));
        assert_eq!(delivery.attempts, 1);
    }

    #[tokio::test]
    async fn test_each_channel_gets_a_copy() {
        let broker = InMemoryPubSub::new();
        let producer = broker.connect_producer("n1").await.unwrap();
        let mut first = broker.subscribe(request("k", "a")).await.unwrap();
        let mut second = broker.subscribe(request("k", "b")).await.unwrap();

        producer
            .publish(&topic("k"), Bytes::from_static(b"m"))
            .await
            .unwrap();

        assert_eq!(next(&mut first).await.body, Bytes::from_static(b"m"));
        assert_eq!(next(&mut second).await.body, Bytes::from_static(b"m"));
    }

    #[tokio::test]
    async fn test_requeue_redelivers_with_next_attempt() {
        let broker = InMemoryPubSub::new();
        let producer = broker.connect_producer("n1").await.unwrap();
        let mut subscription = broker.subscribe(request("k", "workers")).await.unwrap();
        producer
            .publish(&topic("k"), Bytes::from_static(b"m"))
            .await
            .unwrap();

        let first = next(&mut subscription).await;
        first.requeue(Duration::ZERO).await.unwrap();
        let second = next(&mut subscription).await;

        assert_eq!(second.id, first.id);
        assert_eq!(second.attempts, 2);
        assert_eq!(broker.requeued_count("k", "workers"), 1);
    }

    #[tokio::test]
    async fn test_finish_settles_message_once() {
        let broker = InMemoryPubSub::new();
        let producer = broker.connect_producer("n1").await.unwrap();
        let mut subscription = broker.subscribe(request("k", "workers")).await.unwrap();
        producer
            .publish(&topic("k"), Bytes::from_static(b"m"))
            .await
            .unwrap();

        let delivery = next(&mut subscription).await;
        delivery.touch().await.unwrap();
        delivery.finish().await.unwrap();

        assert!(delivery.finish().await.is_err());
        assert!(delivery.touch().await.is_err());
        assert_eq!(broker.finished_count("k", "workers"), 1);
    }

    #[tokio::test]
    async fn test_deferred_publish_arrives_after_delay() {
        let broker = InMemoryPubSub::new();
        let producer = broker.connect_producer("n1").await.unwrap();
        let mut subscription = broker.subscribe(request("k", "workers")).await.unwrap();
        let started = tokio::time::Instant::now();

        producer
            .deferred_publish(&topic("k"), Duration::from_millis(50), Bytes::from_static(b"later"))
            .await
            .unwrap();
        let delivery = next(&mut subscription).await;

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(delivery.body, Bytes::from_static(b"later"));
        assert_eq!(broker.published()[0].delay, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_unreachable_node_rejects_connect_and_publish() {
        let broker = InMemoryPubSub::new();
        let producer = broker.connect_producer("n1").await.unwrap();
        broker.set_unreachable("n1", true);

        assert!(broker.connect_producer("n1").await.is_err());
        assert!(producer.ping().await.is_err());
        assert!(producer
            .publish(&topic("k"), Bytes::from_static(b"m"))
            .await
            .is_err());

        broker.set_unreachable("n1", false);
        assert!(producer.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_subscription_yields_nothing() {
        let broker = InMemoryPubSub::new();
        let mut subscription = broker.subscribe(request("k", "workers")).await.unwrap();

        subscription.close().await;

        assert!(subscription.next_delivery().await.is_none());
    }
}

// ============================================================================
// Queue Service Tests
// ============================================================================

mod queue_service {
    use super::*;

    fn service_job(queue: &str, job_type: &str) -> ServiceJob {
        ServiceJob::from_job(&crate::job::Job::new(job_type, vec![json!(1)]).with_queue(queue))
    }

    /// Verify fetch walks the queue list in order and takes the first available job.
    #[tokio::test]
    async fn test_fetch_honors_queue_order() {
        let service = InMemoryQueueService::new();
        let mut conn = service.connect(None).await.unwrap();
        conn.push(&service_job("low", "a")).await.unwrap();
        conn.push(&service_job("high", "b")).await.unwrap();

        let queues = vec!["high".to_string(), "low".to_string()];
        let first = conn.fetch(&queues).await.unwrap().unwrap();
        let second = conn.fetch(&queues).await.unwrap().unwrap();

        assert_eq!(first.queue, "high");
        assert_eq!(second.queue, "low");
        assert!(conn.fetch(&queues).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scheduled_job_waits_until_due() {
        let service = InMemoryQueueService::new();
        let mut conn = service.connect(None).await.unwrap();
        let mut job = service_job("default", "a");
        job.at = Some(format_timestamp(Utc::now() + chrono::Duration::hours(1)));

        conn.push(&job).await.unwrap();

        assert_eq!(service.scheduled_len(), 1);
        assert!(conn
            .fetch(&["default".to_string()])
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_push_rejects_unparseable_schedule() {
        let service = InMemoryQueueService::new();
        let mut conn = service.connect(None).await.unwrap();
        let mut job = service_job("default", "a");
        job.at = Some("tomorrow".to_string());

        let result = conn.push(&job).await;

        assert!(matches!(result, Err(JobError::InvalidSchedule { .. })));
        assert!(service.pushed().is_empty());
    }

    #[tokio::test]
    async fn test_failed_job_retries_then_moves_to_morgue() {
        let service = InMemoryQueueService::new().with_max_retries(1);
        let mut conn = service.connect(None).await.unwrap();
        let queues = vec!["default".to_string()];
        conn.push(&service_job("default", "a")).await.unwrap();

        for _ in 0..2 {
            let job = conn.fetch(&queues).await.unwrap().unwrap();
            conn.fail(&JobFailure {
                jid: job.jid.clone(),
                errtype: "RuntimeError".to_string(),
                message: "boom".to_string(),
                backtrace: Vec::new(),
            })
            .await
            .unwrap();
        }

        assert_eq!(service.failures().len(), 2);
        assert_eq!(service.morgue().len(), 1);
        assert_eq!(service.queue_len("default"), 0);
    }

    #[tokio::test]
    async fn test_ack_and_progress_are_recorded() {
        let service = InMemoryQueueService::new();
        let mut conn = service.connect(None).await.unwrap();
        conn.push(&service_job("default", "a")).await.unwrap();
        let job = conn
            .fetch(&["default".to_string()])
            .await
            .unwrap()
            .unwrap();

        conn.track_progress(&ProgressUpdate {
            jid: job.jid.clone(),
            percent: 50,
            desc: "halfway".to_string(),
            reserve_until: None,
        })
        .await
        .unwrap();
        conn.ack(&job.jid).await.unwrap();

        assert_eq!(service.acked(), vec![job.jid.clone()]);
        assert_eq!(service.progress()[0].percent, 50);
    }

    #[tokio::test]
    async fn test_heartbeat_reports_configured_state() {
        let service = InMemoryQueueService::new();
        let mut conn = service.connect(Some("wid-1")).await.unwrap();

        assert_eq!(conn.beat().await.unwrap(), HeartbeatState::Running);
        service.set_heartbeat_state(HeartbeatState::Quiet);
        assert_eq!(conn.beat().await.unwrap(), HeartbeatState::Quiet);

        assert_eq!(service.worker_ids(), vec!["wid-1".to_string()]);
        assert_eq!(service.beats().len(), 2);
    }

    #[tokio::test]
    async fn test_connection_accounting() {
        let service = InMemoryQueueService::new();
        let mut first = service.connect(None).await.unwrap();
        let second = service.connect(None).await.unwrap();

        first.close().await;
        assert!(first.ack("x").await.is_err());
        drop(second);

        assert_eq!(service.total_connections(), 2);
        assert_eq!(service.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_service_refuses_connections() {
        let service = InMemoryQueueService::new();
        service.set_unreachable(true);

        assert!(service.connect(None).await.is_err());
    }
}

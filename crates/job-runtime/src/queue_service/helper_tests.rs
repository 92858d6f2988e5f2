use super::*;
use crate::providers::memory::InMemoryQueueService;
use serde_json::json;
use std::time::Duration;

fn helper(service: &InMemoryQueueService, job: Job) -> QueueServiceHelper {
    let sender = Arc::new(ConnectionPool::new(
        Arc::new(service.clone()),
        None,
        1,
        Duration::from_millis(100),
    ));
    QueueServiceHelper::new(&ServiceJob::from_job(&job), sender)
}

#[test]
fn test_batch_ids_come_from_custom_hash() {
    let service = InMemoryQueueService::new();
    let job = Job::new("fill", vec![])
        .with_custom("bid", json!("b-1"))
        .with_custom("_bid", json!("b-0"));

    let helper = helper(&service, job);

    assert_eq!(helper.bid().unwrap(), Some("b-1".to_string()));
    assert_eq!(helper.callback_bid().unwrap(), Some("b-0".to_string()));
    assert_eq!(helper.backend(), BackendKind::QueueService);
}

#[test]
fn test_missing_batch_ids_are_none() {
    let service = InMemoryQueueService::new();

    let helper = helper(&service, Job::new("fill", vec![]));

    assert_eq!(helper.bid().unwrap(), None);
    assert_eq!(helper.callback_bid().unwrap(), None);
}

/// Verify progress is sent with the job id, description and reservation time.
#[tokio::test]
async fn test_track_progress_sends_update() {
    let service = InMemoryQueueService::new();
    let helper = helper(&service, Job::new("fill", vec![]));
    let until = Utc::now() + chrono::Duration::minutes(10);

    helper
        .track_progress(40, "copying", Some(until))
        .await
        .unwrap();

    let progress = service.progress();
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].jid, helper.jid());
    assert_eq!(progress[0].percent, 40);
    assert_eq!(progress[0].desc, "copying");
    assert_eq!(progress[0].reserve_until, Some(format_timestamp(until)));
}

#[tokio::test]
async fn test_track_progress_rejects_percent_over_hundred() {
    let service = InMemoryQueueService::new();
    let helper = helper(&service, Job::new("fill", vec![]));

    let result = helper.track_progress(101, "too far", None).await;

    assert!(matches!(result, Err(JobError::Validation(_))));
    assert!(service.progress().is_empty());
}

#[tokio::test]
async fn test_client_pushes_through_sender_pool() {
    let service = InMemoryQueueService::new();
    let helper = helper(&service, Job::new("fill", vec![]));
    let follow_up = Job::new("notify", vec![json!(7)]).with_queue("mail");

    let client = helper.client().unwrap();
    client.push(&follow_up).await.unwrap();

    let pushed = service.pushed();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].jobtype, "notify");
    assert_eq!(pushed[0].queue, "mail");
}

#[tokio::test]
async fn test_client_rejects_invalid_job() {
    let service = InMemoryQueueService::new();
    let helper = helper(&service, Job::new("fill", vec![]));
    let follow_up = Job::new("notify", vec![]).with_queue("");

    let result = helper.client().unwrap().push(&follow_up).await;

    assert!(matches!(result, Err(JobError::Validation(_))));
    assert!(service.pushed().is_empty());
}

/// Verify a reopened batch tags pushed jobs and is committed again.
#[tokio::test]
async fn test_batch_reopens_pushes_and_commits() {
    let service = InMemoryQueueService::new();
    let job = Job::new("fill", vec![]).with_custom("bid", json!("b-9"));
    let helper = helper(&service, job);

    let batch = helper.batch().await.unwrap();
    assert_eq!(batch.bid(), "b-9");
    assert_eq!(service.opened_batches(), vec!["b-9".to_string()]);

    batch.push(&Job::new("part", vec![json!(1)])).await.unwrap();
    batch.commit().await.unwrap();

    let pushed = service.pushed();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].custom.get("bid"), Some(&json!("b-9")));
    assert_eq!(service.committed_batches(), vec!["b-9".to_string()]);
}

#[tokio::test]
async fn test_batch_without_bid_is_rejected() {
    let service = InMemoryQueueService::new();
    let helper = helper(&service, Job::new("fill", vec![]));

    let result = helper.batch().await;

    assert!(matches!(
        result,
        Err(JobError::Validation(ValidationError::Required { .. }))
    ));
    assert!(service.opened_batches().is_empty());
}

#[tokio::test]
async fn test_batch_on_unreachable_server_fails() {
    let service = InMemoryQueueService::new();
    let job = Job::new("fill", vec![]).with_custom("bid", json!("b-9"));
    let helper = helper(&service, job);
    service.set_unreachable(true);

    let result = helper.batch().await;

    assert!(result.is_err());
    assert!(service.opened_batches().is_empty());
}

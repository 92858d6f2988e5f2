//! Tests for backend configuration.

use super::*;

#[test]
fn test_backend_capabilities() {
    assert!(BackendKind::QueueService.supports_batches());
    assert!(BackendKind::QueueService.supports_progress_tracking());
    assert!(!BackendKind::QueueService.routes_dead_letters());

    assert!(!BackendKind::PubSub.supports_batches());
    assert!(!BackendKind::PubSub.supports_progress_tracking());
    assert!(BackendKind::PubSub.routes_dead_letters());
}

#[test]
fn test_default_weights() {
    let worker = PubSubWorkerConfig::default();
    assert_eq!(worker.priorities, default_priorities());
    assert_eq!(worker.concurrency_for("default"), 1);
    assert_eq!(worker.max_in_flight, 50);
}

/// Verify unconfigured channels and non-positive weights resolve to 1.
#[test]
fn test_weight_lookup_clamps_to_one() {
    let priorities = HashMap::from([
        ("critical".to_string(), 3),
        ("disabled".to_string(), 0),
        ("negative".to_string(), -4),
    ]);

    assert_eq!(weight_for(&priorities, "critical"), 3);
    assert_eq!(weight_for(&priorities, "disabled"), 1);
    assert_eq!(weight_for(&priorities, "negative"), 1);
    assert_eq!(weight_for(&priorities, "unknown"), 1);
}

#[test]
fn test_weight_lookup_caps_large_weights() {
    let priorities = HashMap::from([
        ("at_cap".to_string(), MAX_PRIORITY_WEIGHT),
        ("huge".to_string(), i64::MAX),
    ]);

    assert_eq!(weight_for(&priorities, "at_cap"), 1000);
    assert_eq!(weight_for(&priorities, "huge"), 1000);
}

/// Verify both backends reject priority weights above the maximum.
#[test]
fn test_oversized_priority_weight_is_rejected() {
    let mut queue_service = QueueServiceConfig::new("tcp://localhost:7419");
    queue_service.worker.priorities = HashMap::from([("critical".to_string(), i64::MAX)]);
    assert!(matches!(
        queue_service.validate(),
        Err(ConfigurationError::Invalid { message }) if message.contains("worker.priorities.critical")
    ));

    queue_service.worker.priorities = HashMap::from([("critical".to_string(), MAX_PRIORITY_WEIGHT)]);
    assert!(queue_service.validate().is_ok());

    let mut pub_sub = PubSubConfig::new(vec!["10.0.0.1:4150".to_string()], Vec::new());
    pub_sub.worker.priorities = HashMap::from([("workers".to_string(), MAX_PRIORITY_WEIGHT + 1)]);
    assert!(matches!(
        pub_sub.validate(),
        Err(ConfigurationError::Invalid { .. })
    ));
}

#[test]
fn test_zero_operation_timeout_is_rejected() {
    let mut config = QueueServiceConfig::new("tcp://localhost:7419");
    assert_eq!(config.operation_timeout(), Duration::from_secs(5));

    config.operation_timeout_ms = 0;

    assert!(config.validate().is_err());
}

#[test]
fn test_queue_service_defaults() {
    let config = QueueServiceConfig::new("tcp://localhost:7419");
    assert_eq!(config.sender.pool_capacity, 1);
    assert_eq!(config.worker.concurrency, 20);
    assert_eq!(config.worker.pool_size(), 22);
    assert_eq!(config.worker.priorities.get("default"), Some(&1));
    assert!(config.validate().is_ok());
}

#[test]
fn test_queue_service_url_validation() {
    assert!(QueueServiceConfig::new("").validate().is_err());
    assert!(QueueServiceConfig::new("not a url").validate().is_err());
    assert!(QueueServiceConfig::new("http://localhost:7419")
        .validate()
        .is_err());
    assert!(QueueServiceConfig::new("tcp+tls://localhost:7419")
        .validate()
        .is_err());

    let with_password = QueueServiceConfig::new("tcp://:s3cret@faktory.internal:7419");
    let url = with_password.parsed_url().unwrap();
    assert_eq!(url.password(), Some("s3cret"));
    assert_eq!(url.host_str(), Some("faktory.internal"));
}

#[test]
fn test_pub_sub_validation() {
    let missing = PubSubConfig::default();
    assert!(matches!(
        missing.validate(),
        Err(ConfigurationError::Missing { .. })
    ));

    let bad_address = PubSubConfig::new(vec!["localhost".to_string()], vec![]);
    assert!(matches!(
        bad_address.validate(),
        Err(ConfigurationError::Invalid { .. })
    ));

    let valid = PubSubConfig::new(
        vec!["127.0.0.1:4150".to_string()],
        vec!["127.0.0.1:4161".to_string()],
    );
    assert!(valid.validate().is_ok());
}

/// Verify the tagged configuration deserializes with defaults filled in.
#[test]
fn test_backend_config_deserialization() {
    let json = r#"{
        "backend": "pub_sub",
        "sender": { "nsqd_addresses": ["127.0.0.1:4150"] },
        "worker": { "lookupd_addresses": ["127.0.0.1:4161"], "priorities": { "fill": 3 } }
    }"#;

    let config: BackendConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.kind(), BackendKind::PubSub);

    match config {
        BackendConfig::PubSub(pub_sub) => {
            assert_eq!(pub_sub.worker.concurrency_for("fill"), 3);
            assert_eq!(pub_sub.worker.concurrency_for("default"), 1);
            assert_eq!(pub_sub.worker.max_attempts, 5);
            assert_eq!(pub_sub.sender.dial_timeout_ms, 1000);
        }
        BackendConfig::QueueService(_) => panic!("Expected pub/sub config"),
    }
}

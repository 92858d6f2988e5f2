//! Tests for error types.

use super::*;

#[test]
fn test_error_transience() {
    assert!(JobError::Connect {
        address: "127.0.0.1:4150".to_string(),
        message: "connection refused".to_string(),
    }
    .is_transient());

    assert!(JobError::Timeout {
        duration: Duration::from_secs(1),
    }
    .is_transient());

    assert!(!JobError::InvalidSchedule {
        value: "tomorrow".to_string(),
        message: "not RFC 3339".to_string(),
    }
    .is_transient());

    assert!(!JobError::unsupported("track_progress", BackendKind::PubSub).is_transient());

    assert!(!JobError::Lifecycle(LifecycleError::AlreadyStarted).is_transient());
}

#[test]
fn test_retry_suggestions() {
    let connect = JobError::Connect {
        address: "127.0.0.1:7419".to_string(),
        message: "refused".to_string(),
    };
    assert_eq!(connect.retry_after(), Some(Duration::from_secs(5)));

    let validation = JobError::Validation(ValidationError::Required {
        field: "queue".to_string(),
    });
    assert_eq!(validation.retry_after(), None);
}

#[test]
fn test_broken_connection_classification() {
    let io = JobError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "pipe closed",
    ));
    assert!(io.is_connection_broken());

    let broker = JobError::Broker {
        backend: BackendKind::QueueService,
        code: "ERR".to_string(),
        message: "unknown queue".to_string(),
    };
    assert!(!broker.is_connection_broken());
}

#[test]
fn test_unsupported_message_names_capability_and_backend() {
    let err = JobError::unsupported("bid", BackendKind::PubSub);
    assert_eq!(
        err.to_string(),
        "'bid' is not supported by the pub-sub backend"
    );
}

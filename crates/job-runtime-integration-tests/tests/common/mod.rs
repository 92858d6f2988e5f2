//! Common test utilities for job-runtime integration tests
//!
//! This module provides:
//! - A recording processor with scripted failures
//! - Backend builders over the in-memory brokers
//! - Polling helpers

use async_trait::async_trait;
use job_runtime::config::{PubSubConfig, QueueServiceConfig};
use job_runtime::helper::Helper;
use job_runtime::providers::{InMemoryPubSub, InMemoryQueueService};
use job_runtime::{Backend, JobProcessor, ProcessingError, PubSubAdapter, QueueServiceAdapter};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Recording Processor
// ============================================================================

/// What a processor saw in one invocation
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct Invocation {
    pub jid: String,
    pub queue: String,
    pub args: Vec<Value>,
    pub bid: Option<String>,
    pub batches_supported: bool,
}

/// Processor that records every call and fails the first `fail_first` of them
#[derive(Clone, Default)]
pub struct RecordingProcessor {
    invocations: Arc<Mutex<Vec<Invocation>>>,
    calls: Arc<AtomicUsize>,
    fail_first: usize,
    delay: Option<Duration>,
    completed: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(fail_first: usize) -> Self {
        Self {
            fail_first,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobProcessor for RecordingProcessor {
    async fn process(
        &self,
        helper: Arc<dyn Helper>,
        args: Vec<Value>,
    ) -> Result<(), ProcessingError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let bid = helper.bid();
        self.invocations.lock().unwrap().push(Invocation {
            jid: helper.jid().to_string(),
            queue: helper.job().queue.clone(),
            args,
            batches_supported: bid.is_ok(),
            bid: bid.ok().flatten(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if call <= self.fail_first {
            anyhow::bail!("scripted failure {}", call);
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Backend Builders
// ============================================================================

/// Pub/sub config with two brokers and no requeue delay
#[allow(dead_code)]
pub fn pubsub_config(max_attempts: u16) -> PubSubConfig {
    let mut config = PubSubConfig::new(
        vec!["10.0.0.1:4150".to_string(), "10.0.0.2:4150".to_string()],
        Vec::new(),
    );
    config.worker.max_attempts = max_attempts;
    config.worker.default_requeue_delay_ms = 0;
    config.worker.max_requeue_delay_ms = 0;
    config.worker.priorities = HashMap::from([("workers".to_string(), 2)]);
    config.worker.shutdown_timeout_seconds = 5;
    config
}

#[allow(dead_code)]
pub async fn pubsub_backend(broker: &InMemoryPubSub, config: PubSubConfig) -> Backend {
    PubSubAdapter::with_transport(config, Arc::new(broker.clone()))
        .await
        .expect("pub/sub adapter connects")
        .into()
}

#[allow(dead_code)]
pub fn queue_service_config() -> QueueServiceConfig {
    let mut config = QueueServiceConfig::new("tcp://localhost:7419");
    config.worker.concurrency = 2;
    config.worker.heartbeat_interval_seconds = 1;
    config.worker.shutdown_timeout_seconds = 5;
    config.sender.acquire_timeout_ms = 500;
    config
}

#[allow(dead_code)]
pub async fn queue_service_backend(service: &InMemoryQueueService) -> Backend {
    QueueServiceAdapter::with_connector(queue_service_config(), Arc::new(service.clone()))
        .await
        .expect("queue-service adapter connects")
        .into()
}

// ============================================================================
// Polling
// ============================================================================

/// Poll `condition` every 10ms, panicking after 5s
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

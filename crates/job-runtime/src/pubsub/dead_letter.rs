//! Dead-letter routing for jobs that exhausted their delivery attempts.

use crate::error::JobError;
use crate::job::{Job, TopicName};
use crate::pubsub::producer::ProducerPool;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Log target for alert-level events that need operator attention
pub const ALERT_TARGET: &str = "job_runtime::alert";

/// Destination for terminally failed jobs
#[async_trait]
pub trait DeadLetterRouter: Send + Sync {
    /// Republish `job` unchanged to its dead-letter topic
    async fn requeue_dead_job(&self, job: &Job) -> Result<(), JobError>;
}

/// Router that republishes through the adapter's producer pool
#[derive(Debug, Clone)]
pub struct ProducerDeadLetterRouter {
    producers: Arc<ProducerPool>,
}

impl ProducerDeadLetterRouter {
    pub fn new(producers: Arc<ProducerPool>) -> Self {
        Self { producers }
    }
}

#[async_trait]
impl DeadLetterRouter for ProducerDeadLetterRouter {
    async fn requeue_dead_job(&self, job: &Job) -> Result<(), JobError> {
        let payload = job.to_bytes()?;
        let destination = job.dead_letter_queue();

        error!(
            target: ALERT_TARGET,
            queue = %job.queue,
            destination = %destination,
            job = %String::from_utf8_lossy(&payload),
            "RequeueDeadJob"
        );

        let topic = TopicName::new(destination.clone()).map_err(|e| JobError::Requeue {
            topic: destination.clone(),
            message: e.to_string(),
        })?;

        self.producers
            .publish(&topic, Duration::ZERO, payload)
            .await
            .map_err(|e| JobError::Requeue {
                topic: destination,
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
#[path = "dead_letter_tests.rs"]
mod tests;

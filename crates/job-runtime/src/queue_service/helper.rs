//! Helper view over a queue-service job.

use crate::config::BackendKind;
use crate::error::{JobError, ValidationError};
use crate::helper::{custom_string, Helper, JobBatch, JobClient};
use crate::job::{format_timestamp, Job};
use crate::queue_service::pool::ConnectionPool;
use crate::queue_service::push_job;
use crate::queue_service::transport::{ProgressUpdate, ServiceJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Custom key holding the batch id
pub const BATCH_ID_KEY: &str = "bid";

/// Custom key holding the id of the batch whose callback this job is
pub const CALLBACK_BATCH_ID_KEY: &str = "_bid";

/// Helper for jobs fetched from the queue service.
///
/// Progress reports go through the adapter's sender pool, not the worker
/// connection the job was fetched on.
pub struct QueueServiceHelper {
    jid: String,
    job: Job,
    sender: Arc<ConnectionPool>,
}

impl QueueServiceHelper {
    pub fn new(service_job: &ServiceJob, sender: Arc<ConnectionPool>) -> Self {
        Self {
            jid: service_job.jid.clone(),
            job: service_job.to_job(),
            sender,
        }
    }
}

impl std::fmt::Debug for QueueServiceHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueServiceHelper")
            .field("jid", &self.jid)
            .field("job", &self.job)
            .finish_non_exhaustive()
    }
}

/// Pushes follow-up jobs over the sender pool.
struct SenderClient {
    sender: Arc<ConnectionPool>,
}

#[async_trait]
impl JobClient for SenderClient {
    async fn push(&self, job: &Job) -> Result<(), JobError> {
        push_job(&self.sender, job).await
    }
}

/// Batch reopened from inside one of its jobs.
struct QueueServiceBatch {
    bid: String,
    sender: Arc<ConnectionPool>,
}

#[async_trait]
impl JobBatch for QueueServiceBatch {
    fn bid(&self) -> &str {
        &self.bid
    }

    async fn push(&self, job: &Job) -> Result<(), JobError> {
        let mut member = job.clone();
        member
            .custom
            .insert(BATCH_ID_KEY.to_string(), self.bid.clone().into());
        push_job(&self.sender, &member).await
    }

    async fn commit(&self) -> Result<(), JobError> {
        let mut connection = self.sender.get().await?;
        let result = connection.commit_batch(&self.bid).await;
        connection.check(&result);
        result
    }
}

#[async_trait]
impl Helper for QueueServiceHelper {
    fn jid(&self) -> &str {
        &self.jid
    }

    fn job_type(&self) -> &str {
        &self.job.job_type
    }

    fn job(&self) -> &Job {
        &self.job
    }

    fn backend(&self) -> BackendKind {
        BackendKind::QueueService
    }

    fn bid(&self) -> Result<Option<String>, JobError> {
        Ok(custom_string(&self.job, BATCH_ID_KEY))
    }

    fn callback_bid(&self) -> Result<Option<String>, JobError> {
        Ok(custom_string(&self.job, CALLBACK_BATCH_ID_KEY))
    }

    fn client(&self) -> Result<Arc<dyn JobClient>, JobError> {
        Ok(Arc::new(SenderClient {
            sender: Arc::clone(&self.sender),
        }))
    }

    async fn batch(&self) -> Result<Box<dyn JobBatch>, JobError> {
        let bid = custom_string(&self.job, BATCH_ID_KEY).ok_or_else(|| {
            ValidationError::Required {
                field: format!("custom.{BATCH_ID_KEY}"),
            }
        })?;

        let mut connection = self.sender.get().await?;
        let result = connection.open_batch(&bid).await;
        connection.check(&result);
        result?;

        Ok(Box::new(QueueServiceBatch {
            bid,
            sender: Arc::clone(&self.sender),
        }))
    }

    async fn track_progress(
        &self,
        percent: u8,
        description: &str,
        reserve_until: Option<DateTime<Utc>>,
    ) -> Result<(), JobError> {
        if percent > 100 {
            return Err(ValidationError::OutOfRange {
                field: "percent".to_string(),
                message: "must be 0-100".to_string(),
            }
            .into());
        }

        let update = ProgressUpdate {
            jid: self.jid.clone(),
            percent,
            desc: description.to_string(),
            reserve_until: reserve_until.map(format_timestamp),
        };

        let mut connection = self.sender.get().await?;
        let result = connection.track_progress(&update).await;
        connection.check(&result);
        result
    }
}

#[cfg(test)]
#[path = "helper_tests.rs"]
mod tests;

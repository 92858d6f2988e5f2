//! Read-only view of the job handed to a processor invocation.

use crate::config::BackendKind;
use crate::error::JobError;
use crate::job::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

/// Direct server access from inside a running job
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Enqueue a follow-up job, honoring its schedule
    async fn push(&self, job: &Job) -> Result<(), JobError>;
}

/// A reopened batch accepting more jobs
#[async_trait]
pub trait JobBatch: Send + Sync {
    fn bid(&self) -> &str;

    /// Push `job` as a member of this batch
    async fn push(&self, job: &Job) -> Result<(), JobError>;

    /// Close the batch again once every job was added
    async fn commit(&self) -> Result<(), JobError>;
}

/// Per-invocation view of a delivered job.
///
/// Batch association, direct server access and progress tracking are
/// capabilities of the queue service only. Backends without them return
/// [`JobError::Unsupported`] from the corresponding methods, which is what the
/// default implementations do.
#[async_trait]
pub trait Helper: Send + Sync {
    /// Message or job identifier assigned by the broker
    fn jid(&self) -> &str;

    /// Declared job type
    fn job_type(&self) -> &str;

    /// Look up a value in the job's custom hash
    fn custom(&self, key: &str) -> Option<&Value> {
        self.job().custom(key)
    }

    /// The decoded job
    fn job(&self) -> &Job;

    /// Backend that delivered the job
    fn backend(&self) -> BackendKind;

    /// Batch this job belongs to
    fn bid(&self) -> Result<Option<String>, JobError> {
        Err(JobError::unsupported("bid", self.backend()))
    }

    /// Batch whose completion callback this job is
    fn callback_bid(&self) -> Result<Option<String>, JobError> {
        Err(JobError::unsupported("callback_bid", self.backend()))
    }

    /// Client for the server that delivered this job
    fn client(&self) -> Result<Arc<dyn JobClient>, JobError> {
        Err(JobError::unsupported("client", self.backend()))
    }

    /// Reopen the batch this job belongs to so more jobs can be added
    async fn batch(&self) -> Result<Box<dyn JobBatch>, JobError> {
        Err(JobError::unsupported("batch", self.backend()))
    }

    /// Report progress for a long-running job
    async fn track_progress(
        &self,
        percent: u8,
        description: &str,
        reserve_until: Option<DateTime<Utc>>,
    ) -> Result<(), JobError> {
        let _ = (percent, description, reserve_until);
        Err(JobError::unsupported("track_progress", self.backend()))
    }
}

/// Read a string entry from a custom hash
pub(crate) fn custom_string(job: &Job, key: &str) -> Option<String> {
    job.custom(key).and_then(Value::as_str).map(str::to_string)
}

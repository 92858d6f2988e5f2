//! Connection seams below the queue-service adapter, and its wire job model.

use crate::error::JobError;
use crate::job::{format_timestamp, Job, MessageId};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Job record as the queue service stores it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceJob {
    pub jid: String,
    pub jobtype: String,
    #[serde(default)]
    pub args: Vec<Value>,
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_for: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<String>,
}

impl ServiceJob {
    /// Convert a job for pushing, assigning a fresh job id
    pub fn from_job(job: &Job) -> Self {
        Self {
            jid: MessageId::new().to_string(),
            jobtype: job.job_type.clone(),
            args: job.args.clone(),
            queue: job.queue.clone(),
            at: job.at.clone(),
            custom: job.custom.clone(),
            retry: None,
            reserve_for: None,
            created_at: Some(format_timestamp(Utc::now())),
            enqueued_at: None,
        }
    }

    pub fn to_job(&self) -> Job {
        Job {
            queue: self.queue.clone(),
            job_type: self.jobtype.clone(),
            args: self.args.clone(),
            custom: self.custom.clone(),
            at: self.at.clone(),
        }
    }
}

/// Failure report sent when a processor returns an error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub jid: String,
    pub errtype: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backtrace: Vec<String>,
}

/// Progress report for a running job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub jid: String,
    pub percent: u8,
    pub desc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserve_until: Option<String>,
}

/// Worker state requested by the server in a heartbeat reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatState {
    Running,
    Quiet,
    Terminate,
}

/// Factory for queue-service connections
#[async_trait]
pub trait QueueServiceConnector: Send + Sync {
    /// Open and authenticate a connection; `worker_id` identifies worker connections
    async fn connect(
        &self,
        worker_id: Option<&str>,
    ) -> Result<Box<dyn QueueServiceConnection>, JobError>;

    /// Printable server address
    fn address(&self) -> String;
}

/// One authenticated connection to the queue service
#[async_trait]
pub trait QueueServiceConnection: Send {
    async fn push(&mut self, job: &ServiceJob) -> Result<(), JobError>;

    /// Reserve the next job from the first non-empty queue, in order
    async fn fetch(&mut self, queues: &[String]) -> Result<Option<ServiceJob>, JobError>;

    async fn ack(&mut self, jid: &str) -> Result<(), JobError>;

    async fn fail(&mut self, failure: &JobFailure) -> Result<(), JobError>;

    async fn beat(&mut self) -> Result<HeartbeatState, JobError>;

    async fn track_progress(&mut self, update: &ProgressUpdate) -> Result<(), JobError>;

    /// Reopen an existing batch so more jobs can be added to it
    async fn open_batch(&mut self, bid: &str) -> Result<(), JobError>;

    /// Mark a reopened batch complete again
    async fn commit_batch(&mut self, bid: &str) -> Result<(), JobError>;

    async fn close(&mut self);
}

//! Helper view over a pub/sub delivery.

use crate::config::BackendKind;
use crate::error::JobError;
use crate::helper::Helper;
use crate::job::{Job, MessageId};
use crate::pubsub::transport::Delivery;

/// Helper for jobs delivered by the pub/sub broker.
///
/// The broker has no batches or progress tracking, so those capabilities
/// return [`JobError::Unsupported`].
#[derive(Debug, Clone)]
pub struct PubSubHelper {
    jid: MessageId,
    job: Job,
    attempts: u16,
}

impl PubSubHelper {
    /// Decode the delivery payload into a job
    pub fn from_delivery(delivery: &Delivery) -> Result<Self, JobError> {
        Ok(Self {
            jid: delivery.id.clone(),
            job: Job::from_bytes(&delivery.body)?,
            attempts: delivery.attempts,
        })
    }

    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn into_job(self) -> Job {
        self.job
    }
}

impl Helper for PubSubHelper {
    fn jid(&self) -> &str {
        self.jid.as_str()
    }

    fn job_type(&self) -> &str {
        &self.job.job_type
    }

    fn job(&self) -> &Job {
        &self.job
    }

    fn backend(&self) -> BackendKind {
        BackendKind::PubSub
    }
}

#[cfg(test)]
#[path = "helper_tests.rs"]
mod tests;

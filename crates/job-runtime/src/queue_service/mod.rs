//! Queue-service backend: named queues on a central job server.
//!
//! Pushes go through a small bounded sender pool. Workers run under a
//! [`WorkerManager`] with its own pool of `concurrency + 2` connections that
//! identify themselves with a per-process worker id.

pub mod helper;
pub mod manager;
pub mod pool;
pub mod transport;

pub use helper::QueueServiceHelper;
pub use manager::{WeightedQueues, WorkerManager};
pub use pool::{ConnectionPool, PooledConnection};
pub use transport::{
    HeartbeatState, JobFailure, ProgressUpdate, QueueServiceConnection, QueueServiceConnector,
    ServiceJob,
};

use crate::backend::{JobBackend, ProcessorSlot};
use crate::config::{BackendKind, QueueServiceConfig};
use crate::error::JobError;
use crate::job::{Job, MessageId};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::processor::ProcessorBindings;
use crate::providers::faktory::FaktoryConnector;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

/// Backend adapter for the queue service
pub struct QueueServiceAdapter {
    config: QueueServiceConfig,
    connector: Arc<dyn QueueServiceConnector>,
    sender: Arc<ConnectionPool>,
    worker_pool: Arc<ConnectionPool>,
    worker_id: String,
    processors: ProcessorSlot,
    lifecycle: Lifecycle,
}

impl QueueServiceAdapter {
    /// Connect over TCP to the server named by `config.url`
    pub async fn connect(config: QueueServiceConfig) -> Result<Self, JobError> {
        let connector = Arc::new(FaktoryConnector::from_config(&config)?);
        Self::with_connector(config, connector).await
    }

    /// Connect through an explicit connector.
    ///
    /// One handshake is performed up front so an unreachable server fails
    /// here rather than on the first push.
    pub async fn with_connector(
        config: QueueServiceConfig,
        connector: Arc<dyn QueueServiceConnector>,
    ) -> Result<Self, JobError> {
        config.validate()?;

        let address = connector.address();
        let mut check = connector
            .connect(None)
            .await
            .map_err(|e| match e {
                JobError::Connect { .. } => e,
                other => JobError::Connect {
                    address: address.clone(),
                    message: other.to_string(),
                },
            })?;
        check.close().await;

        let worker_id = MessageId::new().to_string();
        let acquire_timeout = config.sender.acquire_timeout();
        let sender = Arc::new(ConnectionPool::new(
            Arc::clone(&connector),
            None,
            config.sender.pool_capacity,
            acquire_timeout,
        ));
        let worker_pool = Arc::new(ConnectionPool::new(
            Arc::clone(&connector),
            Some(worker_id.clone()),
            config.worker.pool_size(),
            acquire_timeout,
        ));
        let lifecycle = Lifecycle::new(config.worker.shutdown_timeout());

        info!(address = %address, wid = %worker_id, "Queue-service backend connected");

        Ok(Self {
            config,
            connector,
            sender,
            worker_pool,
            worker_id,
            processors: ProcessorSlot::new(),
            lifecycle,
        })
    }

    pub fn config(&self) -> &QueueServiceConfig {
        &self.config
    }

    /// Identifier announced by worker connections
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn sender(&self) -> &ConnectionPool {
        &self.sender
    }

    pub fn worker_pool(&self) -> &ConnectionPool {
        &self.worker_pool
    }
}

impl std::fmt::Debug for QueueServiceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueServiceAdapter")
            .field("address", &self.connector.address())
            .field("worker_id", &self.worker_id)
            .field("sender", &self.sender)
            .field("worker_pool", &self.worker_pool)
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

#[async_trait]
impl JobBackend for QueueServiceAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::QueueService
    }

    fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    fn context(&self) -> CancellationToken {
        self.lifecycle.token()
    }

    fn set_processor(&self, bindings: ProcessorBindings) -> Result<(), JobError> {
        self.processors.set(&self.lifecycle, bindings)
    }

    async fn start(&self) -> Result<(), JobError> {
        self.lifecycle
            .start(|ctx| async move {
                let bindings = self.processors.take();
                let manager = Arc::new(WorkerManager::new(
                    self.worker_id.clone(),
                    &self.config.worker,
                    Arc::clone(&self.worker_pool),
                    Arc::clone(&self.sender),
                    &bindings,
                ));
                manager.spawn(&ctx);
                Ok(())
            })
            .await
    }

    async fn stop(&self) {
        let sender = Arc::clone(&self.sender);
        let worker_pool = Arc::clone(&self.worker_pool);
        self.lifecycle
            .stop(|| async move {
                worker_pool.close().await;
                sender.close().await;
            })
            .await;
    }

    async fn push(&self, job: &Job) -> Result<(), JobError> {
        push_job(&self.sender, job).await
    }
}

/// Validate `job` and push it over a connection borrowed from `sender`
pub(crate) async fn push_job(sender: &ConnectionPool, job: &Job) -> Result<(), JobError> {
    job.validate()?;
    let service_job = ServiceJob::from_job(job);

    debug!(
        jid = %service_job.jid,
        queue = %service_job.queue,
        job_type = %service_job.jobtype,
        at = ?service_job.at,
        "Pushing job"
    );

    let mut connection = sender.get().await?;
    let result = connection.push(&service_job).await;
    connection.check(&result);
    result
}

//! Bounded pool of reusable queue-service connections.

use crate::error::JobError;
use crate::queue_service::transport::{
    HeartbeatState, JobFailure, ProgressUpdate, QueueServiceConnection, QueueServiceConnector,
    ServiceJob,
};
use async_trait::async_trait;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;

type Connection = Box<dyn QueueServiceConnection>;

struct PoolShared {
    idle: Mutex<Vec<Connection>>,
}

impl PoolShared {
    fn idle(&self) -> MutexGuard<'_, Vec<Connection>> {
        match self.idle.lock() {
            Ok(idle) => idle,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// At most `capacity` connections, created lazily and reused.
///
/// Borrowing waits for a free slot up to the acquire timeout and fails with
/// [`JobError::Timeout`] instead of blocking forever.
pub struct ConnectionPool {
    connector: Arc<dyn QueueServiceConnector>,
    worker_id: Option<String>,
    capacity: usize,
    acquire_timeout: Duration,
    permits: Arc<Semaphore>,
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn QueueServiceConnector>,
        worker_id: Option<String>,
        capacity: usize,
        acquire_timeout: Duration,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            connector,
            worker_id,
            capacity,
            acquire_timeout,
            permits: Arc::new(Semaphore::new(capacity)),
            shared: Arc::new(PoolShared {
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently borrowed
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Connections kept open and ready for reuse
    pub fn idle_count(&self) -> usize {
        self.shared.idle().len()
    }

    /// Borrow a connection, opening one if no idle connection exists
    pub async fn get(&self) -> Result<PooledConnection, JobError> {
        let timeout = JobError::Timeout {
            duration: self.acquire_timeout,
        };
        let permit = match tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Err(timeout),
        };

        let reused = self.shared.idle().pop();
        let connection = match reused {
            Some(connection) => connection,
            None => {
                debug!(address = %self.connector.address(), "Opening pooled connection");
                self.connector.connect(self.worker_id.as_deref()).await?
            }
        };

        Ok(PooledConnection {
            connection,
            shared: Arc::clone(&self.shared),
            broken: false,
            _permit: permit,
        })
    }

    /// Close every idle connection
    pub async fn close(&self) {
        let idle: Vec<Connection> = std::mem::take(&mut *self.shared.idle());
        for mut connection in idle {
            connection.close().await;
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.connector.address())
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// A borrowed connection; returned to the pool when dropped.
///
/// Connections marked broken are dropped instead of returned. The slot is
/// released either way.
pub struct PooledConnection {
    connection: Connection,
    shared: Arc<PoolShared>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Discard this connection instead of returning it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Mark the connection broken when `result` failed at the transport level
    pub fn check<T>(&mut self, result: &Result<T, JobError>) {
        if let Err(e) = result {
            if e.is_connection_broken() {
                self.broken = true;
            }
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl Deref for PooledConnection {
    type Target = dyn QueueServiceConnection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let connection = std::mem::replace(&mut self.connection, Box::new(Detached));
        if self.broken {
            debug!("Discarding broken pooled connection");
        } else {
            self.shared.idle().push(connection);
        }
    }
}

/// Placeholder left behind once a connection has been handed back
struct Detached;

fn detached() -> JobError {
    JobError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "connection returned to pool",
    ))
}

#[async_trait]
impl QueueServiceConnection for Detached {
    async fn push(&mut self, _job: &ServiceJob) -> Result<(), JobError> {
        Err(detached())
    }

    async fn fetch(&mut self, _queues: &[String]) -> Result<Option<ServiceJob>, JobError> {
        Err(detached())
    }

    async fn ack(&mut self, _jid: &str) -> Result<(), JobError> {
        Err(detached())
    }

    async fn fail(&mut self, _failure: &JobFailure) -> Result<(), JobError> {
        Err(detached())
    }

    async fn beat(&mut self) -> Result<HeartbeatState, JobError> {
        Err(detached())
    }

    async fn track_progress(&mut self, _update: &ProgressUpdate) -> Result<(), JobError> {
        Err(detached())
    }

    async fn open_batch(&mut self, _bid: &str) -> Result<(), JobError> {
        Err(detached())
    }

    async fn commit_batch(&mut self, _bid: &str) -> Result<(), JobError> {
        Err(detached())
    }

    async fn close(&mut self) {}
}

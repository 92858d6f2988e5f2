//! Start/stop lifecycle shared by every backend.
//!
//! A [`Lifecycle`] owns the cancellation token and task tracker that all of a
//! backend's receive loops and handler invocations run under. Start and stop
//! are serialized by a transition lock, so a stop issued while start is still
//! registering consumers waits for registration to finish and then tears the
//! whole set down.

use crate::error::{JobError, LifecycleError};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Observable lifecycle state of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unstarted,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unstarted => write!(f, "unstarted"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Cancellation signal and task set handed to receive loops
#[derive(Debug, Clone)]
pub struct WorkerContext {
    cancellation: CancellationToken,
    tasks: TaskTracker,
}

impl WorkerContext {
    pub fn new() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the context has been cancelled
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Spawn a task that shutdown will wait for
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(future)
    }

    /// Number of tracked tasks still running
    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn cancel(&self) {
        self.cancellation.cancel();
    }

    async fn drain(&self, timeout: Duration) -> bool {
        self.tasks.close();
        tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok()
    }
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unstarted → Running → Stopping → Stopped state machine
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
    transition: tokio::sync::Mutex<()>,
    context: WorkerContext,
    shutdown_timeout: Duration,
}

impl Lifecycle {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(LifecycleState::Unstarted),
            transition: tokio::sync::Mutex::new(()),
            context: WorkerContext::new(),
            shutdown_timeout,
        }
    }

    pub fn state(&self) -> LifecycleState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: LifecycleState) {
        match self.state.lock() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    /// Cancellation token observed by every loop of this backend
    pub fn token(&self) -> CancellationToken {
        self.context.cancellation.clone()
    }

    /// Fail unless the backend has not been started yet
    pub fn ensure_unstarted(&self) -> Result<(), JobError> {
        match self.state() {
            LifecycleState::Unstarted => Ok(()),
            LifecycleState::Stopped => Err(LifecycleError::Stopped.into()),
            LifecycleState::Running | LifecycleState::Stopping => {
                Err(LifecycleError::AlreadyStarted.into())
            }
        }
    }

    /// Run `launch` once and move to Running if it succeeds.
    ///
    /// `launch` registers consumers and spawns their loops on the given
    /// context. If it fails, everything it spawned is cancelled and awaited and
    /// the lifecycle ends in Stopped.
    pub async fn start<F, Fut>(&self, launch: F) -> Result<(), JobError>
    where
        F: FnOnce(WorkerContext) -> Fut,
        Fut: Future<Output = Result<(), JobError>>,
    {
        let _transition = self.transition.lock().await;
        self.ensure_unstarted()?;

        if let Err(e) = launch(self.context.clone()).await {
            warn!(error = %e, "Start failed, cancelling partially started workers");
            self.context.cancel();
            if !self.context.drain(self.shutdown_timeout).await {
                warn!(
                    timeout_seconds = self.shutdown_timeout.as_secs(),
                    "Workers did not finish within the shutdown timeout"
                );
            }
            self.set_state(LifecycleState::Stopped);
            return Err(e);
        }

        self.set_state(LifecycleState::Running);
        info!("Worker lifecycle started");
        Ok(())
    }

    /// Cancel, wait for in-flight work, then run `close`.
    ///
    /// Returns `false` without doing anything when the lifecycle is already
    /// stopping or stopped.
    pub async fn stop<F, Fut>(&self, close: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let _transition = self.transition.lock().await;

        match self.state() {
            LifecycleState::Stopping | LifecycleState::Stopped => return false,
            LifecycleState::Unstarted => {
                self.context.cancel();
                self.context.tasks.close();
                close().await;
                self.set_state(LifecycleState::Stopped);
                info!("Worker lifecycle stopped before start");
                return true;
            }
            LifecycleState::Running => {}
        }

        self.set_state(LifecycleState::Stopping);
        info!(
            active_tasks = self.context.active_tasks(),
            "Stopping workers"
        );

        self.context.cancel();
        if !self.context.drain(self.shutdown_timeout).await {
            warn!(
                timeout_seconds = self.shutdown_timeout.as_secs(),
                active_tasks = self.context.active_tasks(),
                "In-flight jobs did not finish within the shutdown timeout"
            );
        }

        close().await;
        self.set_state(LifecycleState::Stopped);
        info!("Worker lifecycle stopped");
        true
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;

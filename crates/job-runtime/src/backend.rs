//! Broker-agnostic backend surface.
//!
//! Applications program against [`JobBackend`]; [`Backend`] is the closed set
//! of adapters selected from a [`BackendConfig`].

use crate::config::{BackendConfig, BackendKind};
use crate::error::{JobError, LifecycleError};
use crate::job::Job;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::processor::ProcessorBindings;
use crate::pubsub::PubSubAdapter;
use crate::queue_service::QueueServiceAdapter;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[cfg(test)]
#[path = "backend_tests.rs"]
mod tests;

/// Operations shared by every backend adapter
#[async_trait]
pub trait JobBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn state(&self) -> LifecycleState;

    /// Token cancelled when the backend stops
    fn context(&self) -> CancellationToken;

    /// Install the processor table. Allowed once, before start.
    fn set_processor(&self, bindings: ProcessorBindings) -> Result<(), JobError>;

    /// Register every binding and begin consuming
    async fn start(&self) -> Result<(), JobError>;

    /// Stop consuming, wait for in-flight jobs and close connections. Idempotent.
    async fn stop(&self);

    /// Enqueue a job, honoring its schedule
    async fn push(&self, job: &Job) -> Result<(), JobError>;
}

/// A connected backend adapter
#[derive(Debug)]
pub enum Backend {
    QueueService(QueueServiceAdapter),
    PubSub(PubSubAdapter),
}

impl Backend {
    /// Validate the configuration and connect the matching adapter
    pub async fn connect(config: BackendConfig) -> Result<Self, JobError> {
        config.validate()?;
        match config {
            BackendConfig::QueueService(config) => {
                Ok(Self::QueueService(QueueServiceAdapter::connect(config).await?))
            }
            BackendConfig::PubSub(config) => Ok(Self::PubSub(PubSubAdapter::connect(config).await?)),
        }
    }

    fn inner(&self) -> &dyn JobBackend {
        match self {
            Self::QueueService(adapter) => adapter,
            Self::PubSub(adapter) => adapter,
        }
    }
}

impl From<QueueServiceAdapter> for Backend {
    fn from(adapter: QueueServiceAdapter) -> Self {
        Self::QueueService(adapter)
    }
}

impl From<PubSubAdapter> for Backend {
    fn from(adapter: PubSubAdapter) -> Self {
        Self::PubSub(adapter)
    }
}

#[async_trait]
impl JobBackend for Backend {
    fn kind(&self) -> BackendKind {
        self.inner().kind()
    }

    fn state(&self) -> LifecycleState {
        self.inner().state()
    }

    fn context(&self) -> CancellationToken {
        self.inner().context()
    }

    fn set_processor(&self, bindings: ProcessorBindings) -> Result<(), JobError> {
        self.inner().set_processor(bindings)
    }

    async fn start(&self) -> Result<(), JobError> {
        self.inner().start().await
    }

    async fn stop(&self) {
        self.inner().stop().await
    }

    async fn push(&self, job: &Job) -> Result<(), JobError> {
        self.inner().push(job).await
    }
}

// ============================================================================
// Processor Slot
// ============================================================================

#[derive(Debug, Default)]
struct SlotState {
    bindings: Option<ProcessorBindings>,
    assigned: bool,
}

/// Write-once holder for an adapter's processor table
#[derive(Debug, Default)]
pub(crate) struct ProcessorSlot {
    state: Mutex<SlotState>,
}

impl ProcessorSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store `bindings` unless a table was already set or the backend has started
    pub(crate) fn set(
        &self,
        lifecycle: &Lifecycle,
        bindings: ProcessorBindings,
    ) -> Result<(), JobError> {
        lifecycle.ensure_unstarted().map_err(|e| match e {
            JobError::Lifecycle(LifecycleError::Stopped) => {
                JobError::Lifecycle(LifecycleError::AlreadyStarted)
            }
            other => other,
        })?;

        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.assigned {
            return Err(LifecycleError::ProcessorsAlreadySet.into());
        }
        state.assigned = true;
        state.bindings = Some(bindings);
        Ok(())
    }

    /// Take the table for registration; empty when none was set
    pub(crate) fn take(&self) -> ProcessorBindings {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bindings = state.bindings.take().unwrap_or_else(ProcessorBindings::new);
        if bindings.is_empty() {
            warn!("Starting without processors; backend is push-only");
        }
        bindings
    }
}

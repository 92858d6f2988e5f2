//! # Job Runtime
//!
//! Broker-agnostic background job runtime. Applications push [`Job`]s and
//! bind processors to (topic, job type) pairs; a [`Backend`] delivers the
//! jobs over one of two broker families:
//!
//! - a queue service with named queues, server-side retries and a morgue
//!   (Faktory wire protocol)
//! - a pub/sub broker with topics, channels and deferred publish (NSQ wire
//!   protocol), where this crate owns retry counting and dead-letter routing
//!
//! ## Module Organization
//!
//! - [`job`] - The job model and validated topic/channel names
//! - [`processor`] - Processor trait and bindings
//! - [`helper`] - Per-job capabilities handed to processors
//! - [`backend`] - The [`JobBackend`] trait and [`Backend`] enum
//! - [`pubsub`] - Producer pool, consumer registry and dead-letter router
//! - [`queue_service`] - Connection pool, worker manager and heartbeat
//! - [`providers`] - Wire clients and in-memory brokers
//! - [`lifecycle`] - Start/stop state machine and worker context
//! - [`config`] - Serde configuration types
//! - [`error`] - Error types for all runtime operations
//!
//! ## Example
//!
//! ```rust,no_run
//! use job_runtime::{Backend, BackendConfig, Job, JobBackend, ProcessorBindings};
//! use job_runtime::config::PubSubConfig;
//! use job_runtime::helper::Helper;
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), job_runtime::JobError> {
//! let config = BackendConfig::PubSub(PubSubConfig::new(
//!     vec!["127.0.0.1:4150".to_string()],
//!     vec!["127.0.0.1:4161".to_string()],
//! ));
//! let backend = Backend::connect(config).await?;
//!
//! backend.set_processor(ProcessorBindings::new().bind(
//!     "reports",
//!     "workers",
//!     |helper: Arc<dyn Helper>, args: Vec<Value>| async move {
//!         tracing::info!(jid = %helper.jid(), ?args, "Building report");
//!         Ok::<(), job_runtime::ProcessingError>(())
//!     },
//! ))?;
//! backend.start().await?;
//!
//! backend.push(&Job::new("build", vec![]).with_queue("reports")).await?;
//!
//! backend.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod helper;
pub mod job;
pub mod lifecycle;
pub mod processor;
pub mod providers;
pub mod pubsub;
pub mod queue_service;
pub mod retry;

// Re-export commonly used types at crate root for convenience
pub use backend::{Backend, JobBackend};
pub use config::{BackendConfig, BackendKind, PubSubConfig, QueueServiceConfig};
pub use error::{
    ConfigurationError, JobError, LifecycleError, ProcessingError, SerializationError,
    ValidationError,
};
pub use helper::{Helper, JobBatch, JobClient};
pub use job::{ChannelName, Job, MessageId, TopicName};
pub use lifecycle::{LifecycleState, WorkerContext};
pub use processor::{JobProcessor, ProcessorBinding, ProcessorBindings};
pub use pubsub::PubSubAdapter;
pub use queue_service::QueueServiceAdapter;

//! Pub/sub backend: topics fan out to channels, consumers pull from channels.
//!
//! The adapter composes a round-robin [`ProducerPool`] for publishing, a
//! [`ConsumerRegistry`] for bound processors and a [`ProducerDeadLetterRouter`]
//! for jobs that exhaust their attempts.

pub mod consumer;
pub mod dead_letter;
pub mod helper;
pub mod producer;
pub mod transport;

pub use consumer::{ConsumerRegistration, ConsumerRegistry, ConsumerSettings, MessageHandler};
pub use dead_letter::{DeadLetterRouter, ProducerDeadLetterRouter, ALERT_TARGET};
pub use helper::PubSubHelper;
pub use producer::ProducerPool;
pub use transport::{
    Delivery, DeliveryAcker, ProducerConnection, PubSubTransport, SubscribeRequest, Subscription,
};

use crate::backend::{JobBackend, ProcessorSlot};
use crate::config::{BackendKind, PubSubConfig};
use crate::error::JobError;
use crate::job::{Job, TopicName};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::processor::ProcessorBindings;
use crate::providers::nsq::NsqTransport;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;

/// Backend adapter for the pub/sub broker
pub struct PubSubAdapter {
    config: PubSubConfig,
    producers: Arc<ProducerPool>,
    consumers: ConsumerRegistry,
    processors: ProcessorSlot,
    lifecycle: Lifecycle,
}

impl PubSubAdapter {
    /// Connect over TCP using the broker wire protocol
    pub async fn connect(config: PubSubConfig) -> Result<Self, JobError> {
        let transport = Arc::new(NsqTransport::from_config(&config));
        Self::with_transport(config, transport).await
    }

    /// Connect through an explicit transport
    pub async fn with_transport(
        config: PubSubConfig,
        transport: Arc<dyn PubSubTransport>,
    ) -> Result<Self, JobError> {
        config.validate()?;

        let producers =
            Arc::new(ProducerPool::connect(transport.as_ref(), &config.sender.nsqd_addresses).await?);
        let consumers = ConsumerRegistry::new(
            transport,
            config.worker.lookupd_addresses.clone(),
            ConsumerSettings::from(&config.worker),
        );
        let lifecycle = Lifecycle::new(config.worker.shutdown_timeout());

        info!(
            nsqd = ?config.sender.nsqd_addresses,
            lookupd = ?config.worker.lookupd_addresses,
            "Pub/sub backend connected"
        );

        Ok(Self {
            config,
            producers,
            consumers,
            processors: ProcessorSlot::new(),
            lifecycle,
        })
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    pub fn producers(&self) -> &ProducerPool {
        &self.producers
    }

    /// Consumers registered by `start`, including dead-letter companions
    pub fn registrations(&self) -> Vec<ConsumerRegistration> {
        self.consumers.registrations()
    }
}

impl std::fmt::Debug for PubSubAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubAdapter")
            .field("producers", &self.producers)
            .field("consumers", &self.consumers)
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

#[async_trait]
impl JobBackend for PubSubAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::PubSub
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
                let router: Arc<dyn DeadLetterRouter> =
                    Arc::new(ProducerDeadLetterRouter::new(Arc::clone(&self.producers)));

                for binding in bindings.bindings() {
                    let concurrency = self.config.worker.concurrency_for(&binding.channel);
                    self.consumers
                        .register_processor(
                            &ctx,
                            &binding.topic,
                            &binding.channel,
                            binding.processor,
                            concurrency,
                            Arc::clone(&router),
                        )
                        .await?;
                }
                Ok(())
            })
            .await
    }

    async fn stop(&self) {
        let producers = Arc::clone(&self.producers);
        self.lifecycle
            .stop(|| async move { producers.stop().await })
            .await;
    }

    async fn push(&self, job: &Job) -> Result<(), JobError> {
        job.validate()?;
        let delay = job.delay_from(Utc::now())?;
        let topic = TopicName::new(job.queue.clone())?;
        let payload = job.to_bytes()?;

        debug!(
            topic = %topic,
            job_type = %job.job_type,
            delay_ms = delay.as_millis() as u64,
            "Pushing job"
        );
        self.producers.publish(&topic, delay, payload).await
    }
}

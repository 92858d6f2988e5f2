//! Consumer registration, bounded dispatch and terminal-failure handling.

use crate::config::PubSubWorkerConfig;
use crate::error::{JobError, ProcessingError};
use crate::helper::Helper;
use crate::job::{ChannelName, TopicName};
use crate::lifecycle::WorkerContext;
use crate::processor::SharedProcessor;
use crate::pubsub::dead_letter::DeadLetterRouter;
use crate::pubsub::helper::PubSubHelper;
use crate::pubsub::transport::{Delivery, PubSubTransport, SubscribeRequest, Subscription};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

/// Retry and flow-control settings shared by all consumers of an adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub max_in_flight: u32,
    /// Zero disables the attempt limit
    pub max_attempts: u16,
    pub default_requeue_delay: Duration,
    pub max_requeue_delay: Duration,
}

impl ConsumerSettings {
    /// Requeue delay grows linearly with attempts up to the maximum
    pub fn requeue_delay(&self, attempts: u16) -> Duration {
        self.default_requeue_delay
            .saturating_mul(u32::from(attempts.max(1)))
            .min(self.max_requeue_delay)
    }

    pub fn is_exhausted(&self, attempts: u16) -> bool {
        self.max_attempts > 0 && attempts > self.max_attempts
    }
}

impl From<&PubSubWorkerConfig> for ConsumerSettings {
    fn from(config: &PubSubWorkerConfig) -> Self {
        Self {
            max_in_flight: config.max_in_flight,
            max_attempts: config.max_attempts,
            default_requeue_delay: config.default_requeue_delay(),
            max_requeue_delay: config.max_requeue_delay(),
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self::from(&PubSubWorkerConfig::default())
    }
}

/// A consumer bound by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRegistration {
    pub topic: TopicName,
    pub channel: ChannelName,
    pub concurrency: usize,
}

// ============================================================================
// Message Handler
// ============================================================================

/// Decodes deliveries and runs the bound processor
pub struct MessageHandler {
    topic: TopicName,
    channel: ChannelName,
    processor: SharedProcessor,
    dead_letter: Arc<dyn DeadLetterRouter>,
    settings: ConsumerSettings,
}

impl MessageHandler {
    pub fn new(
        topic: TopicName,
        channel: ChannelName,
        processor: SharedProcessor,
        dead_letter: Arc<dyn DeadLetterRouter>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            topic,
            channel,
            processor,
            dead_letter,
            settings,
        }
    }

    /// Process one delivery and acknowledge it according to the outcome
    pub async fn dispatch(&self, delivery: Delivery) {
        if self.settings.is_exhausted(delivery.attempts) {
            warn!(
                topic = %self.topic,
                channel = %self.channel,
                id = %delivery.id,
                attempts = delivery.attempts,
                max_attempts = self.settings.max_attempts,
                "Message exceeded max attempts, routing to dead letter"
            );
            self.log_failed_message(&delivery).await;
            if let Err(e) = delivery.finish().await {
                warn!(id = %delivery.id, error = %e, "Failed to finish dead-lettered message");
            }
            return;
        }

        match self.handle_message(&delivery).await {
            Ok(()) => {
                if let Err(e) = delivery.finish().await {
                    warn!(id = %delivery.id, error = %e, "Failed to finish message");
                }
            }
            Err(e) => {
                let delay = self.settings.requeue_delay(delivery.attempts);
                warn!(
                    topic = %self.topic,
                    channel = %self.channel,
                    id = %delivery.id,
                    attempts = delivery.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Job failed, requeueing"
                );
                if let Err(e) = delivery.requeue(delay).await {
                    warn!(id = %delivery.id, error = %e, "Failed to requeue message");
                }
            }
        }
    }

    /// Decode the job and invoke the processor with its args
    pub async fn handle_message(&self, delivery: &Delivery) -> Result<(), ProcessingError> {
        let helper = PubSubHelper::from_delivery(delivery)?;
        info!("Working on job {}", helper.jid());

        let span = info_span!(
            "job",
            jid = %helper.jid(),
            job_type = %helper.job_type(),
            topic = %self.topic,
            channel = %self.channel,
            attempts = delivery.attempts,
        );
        let args = helper.job().args.clone();
        let processor = Arc::clone(&self.processor);
        let helper: Arc<dyn Helper> = Arc::new(helper);

        let invocation =
            tokio::spawn(async move { processor.process(helper, args).await }.instrument(span));
        match invocation.await {
            Ok(result) => result,
            Err(join) if join.is_panic() => Err(anyhow::anyhow!("processor panicked")),
            Err(join) => Err(anyhow::anyhow!("processor task failed: {}", join)),
        }
    }

    /// Terminal-failure callback: hand the job to the dead-letter router
    pub async fn log_failed_message(&self, delivery: &Delivery) {
        let helper = match PubSubHelper::from_delivery(delivery) {
            Ok(helper) => helper,
            Err(e) => {
                error!(
                    topic = %self.topic,
                    id = %delivery.id,
                    error = %e,
                    "Dead-letter parse error, dropping message"
                );
                return;
            }
        };

        if let Err(e) = self.dead_letter.requeue_dead_job(helper.job()).await {
            error!(
                topic = %self.topic,
                id = %delivery.id,
                error = %e,
                "Dead-letter requeue failed"
            );
        }
    }
}

// ============================================================================
// Consumer Registry
// ============================================================================

/// Binds (topic, channel) pairs to processors with bounded concurrency
pub struct ConsumerRegistry {
    transport: Arc<dyn PubSubTransport>,
    lookupd_addresses: Vec<String>,
    settings: ConsumerSettings,
    registrations: Mutex<Vec<ConsumerRegistration>>,
}

impl ConsumerRegistry {
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        lookupd_addresses: Vec<String>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            transport,
            lookupd_addresses,
            settings,
            registrations: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Consumers registered so far, in registration order
    pub fn registrations(&self) -> Vec<ConsumerRegistration> {
        match self.registrations.lock() {
            Ok(registrations) => registrations.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Register a processor for (topic, channel) and its dead-letter companion.
    ///
    /// The primary consumer runs `concurrency` handlers at once (zero is
    /// treated as one). The companion consumes `topic-dlq` on the same
    /// channel with exactly one handler, so dead-letter replay is serialized.
    pub async fn register_processor(
        &self,
        ctx: &WorkerContext,
        topic: &str,
        channel: &str,
        processor: SharedProcessor,
        concurrency: usize,
        dead_letter: Arc<dyn DeadLetterRouter>,
    ) -> Result<(), JobError> {
        let topic = TopicName::new(topic)?;
        let channel = ChannelName::new(channel)?;
        let dead_letter_topic = topic.dead_letter()?;

        self.register_consumer(
            ctx,
            topic,
            channel.clone(),
            Arc::clone(&processor),
            concurrency.max(1),
            Arc::clone(&dead_letter),
        )
        .await?;

        self.register_consumer(ctx, dead_letter_topic, channel, processor, 1, dead_letter)
            .await
    }

    async fn register_consumer(
        &self,
        ctx: &WorkerContext,
        topic: TopicName,
        channel: ChannelName,
        processor: SharedProcessor,
        concurrency: usize,
        dead_letter: Arc<dyn DeadLetterRouter>,
    ) -> Result<(), JobError> {
        let subscription = self
            .transport
            .subscribe(SubscribeRequest {
                topic: topic.clone(),
                channel: channel.clone(),
                lookupd_addresses: self.lookupd_addresses.clone(),
                max_in_flight: self.settings.max_in_flight,
            })
            .await?;

        let handler = Arc::new(MessageHandler::new(
            topic.clone(),
            channel.clone(),
            processor,
            dead_letter,
            self.settings.clone(),
        ));

        match self.registrations.lock() {
            Ok(mut registrations) => registrations.push(ConsumerRegistration {
                topic: topic.clone(),
                channel: channel.clone(),
                concurrency,
            }),
            Err(poisoned) => poisoned.into_inner().push(ConsumerRegistration {
                topic: topic.clone(),
                channel: channel.clone(),
                concurrency,
            }),
        }

        info!(topic = %topic, channel = %channel, concurrency, "Consumer registered");
        ctx.spawn(run_consumer(ctx.clone(), subscription, handler, concurrency));
        Ok(())
    }
}

impl std::fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistry")
            .field("lookupd_addresses", &self.lookupd_addresses)
            .field("settings", &self.settings)
            .field("registrations", &self.registrations())
            .finish()
    }
}

/// Receive loop for one consumer.
///
/// Each delivery waits for a semaphore permit before its handler task is
/// spawned. A delivery taken after cancellation is requeued immediately.
async fn run_consumer(
    ctx: WorkerContext,
    mut subscription: Box<dyn Subscription>,
    handler: Arc<MessageHandler>,
    concurrency: usize,
) {
    let semaphore = Arc::new(Semaphore::new(concurrency));

    loop {
        let delivery = tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            delivery = subscription.next_delivery() => match delivery {
                Some(delivery) => delivery,
                None => {
                    warn!(topic = %handler.topic, channel = %handler.channel, "Subscription closed");
                    break;
                }
            },
        };

        let permit = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                if let Err(e) = delivery.requeue(Duration::ZERO).await {
                    debug!(id = %delivery.id, error = %e, "Failed to return message during shutdown");
                }
                break;
            }
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let handler = Arc::clone(&handler);
        ctx.spawn(async move {
            let _permit = permit;
            handler.dispatch(delivery).await;
        });
    }

    subscription.close().await;
    debug!(topic = %handler.topic, channel = %handler.channel, "Consumer loop exited");
}

//! Connection seams below the pub/sub adapter.
//!
//! The NSQ wire client and the in-memory broker both implement these traits;
//! the producer pool and consumer registry only ever see the traits.

use crate::error::JobError;
use crate::job::{ChannelName, MessageId, TopicName};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// One outbound connection to a single broker node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProducerConnection: Send + Sync {
    /// Broker address this connection targets
    fn address(&self) -> &str;

    /// Verify the broker is reachable
    async fn ping(&self) -> Result<(), JobError>;

    /// Publish for immediate delivery
    async fn publish(&self, topic: &TopicName, payload: Bytes) -> Result<(), JobError>;

    /// Publish for delivery after `delay`
    async fn deferred_publish(
        &self,
        topic: &TopicName,
        delay: Duration,
        payload: Bytes,
    ) -> Result<(), JobError>;

    /// Close the connection; further publishes fail
    async fn stop(&self);
}

/// Parameters for a consumer subscription
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub topic: TopicName,
    pub channel: ChannelName,
    pub lookupd_addresses: Vec<String>,
    pub max_in_flight: u32,
}

/// Factory for broker connections
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn connect_producer(
        &self,
        address: &str,
    ) -> Result<Arc<dyn ProducerConnection>, JobError>;

    async fn subscribe(&self, request: SubscribeRequest) -> Result<Box<dyn Subscription>, JobError>;
}

/// Stream of deliveries for one (topic, channel) consumer
#[async_trait]
pub trait Subscription: Send {
    /// Next delivery, or `None` once the subscription has closed
    async fn next_delivery(&mut self) -> Option<Delivery>;

    /// Stop receiving and release broker connections
    async fn close(&mut self);
}

/// Acknowledgement channel back to the node that sent a delivery
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn finish(&self, id: &MessageId) -> Result<(), JobError>;

    async fn requeue(&self, id: &MessageId, delay: Duration) -> Result<(), JobError>;

    /// Extend the in-flight timeout of a message
    async fn touch(&self, id: &MessageId) -> Result<(), JobError>;
}

/// A message received by a subscription
pub struct Delivery {
    pub id: MessageId,
    pub body: Bytes,
    /// Delivery attempt count, starting at 1
    pub attempts: u16,
    /// Broker timestamp in nanoseconds since the epoch
    pub timestamp: i64,
    acker: Arc<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(
        id: MessageId,
        body: Bytes,
        attempts: u16,
        timestamp: i64,
        acker: Arc<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            id,
            body,
            attempts,
            timestamp,
            acker,
        }
    }

    pub async fn finish(&self) -> Result<(), JobError> {
        self.acker.finish(&self.id).await
    }

    pub async fn requeue(&self, delay: Duration) -> Result<(), JobError> {
        self.acker.requeue(&self.id, delay).await
    }

    pub async fn touch(&self) -> Result<(), JobError> {
        self.acker.touch(&self.id).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("attempts", &self.attempts)
            .field("len", &self.body.len())
            .finish_non_exhaustive()
    }
}

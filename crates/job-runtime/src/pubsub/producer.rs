//! Round-robin pool of producer connections.

use crate::error::{ConfigurationError, JobError};
use crate::job::TopicName;
use crate::pubsub::transport::{ProducerConnection, PubSubTransport};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "producer_tests.rs"]
mod tests;

/// Fixed set of producer connections used in strict cyclic order.
///
/// Selection advances an atomic cursor modulo the pool size; the network call
/// happens after selection, so concurrent publishes never wait on each other.
pub struct ProducerPool {
    producers: Vec<Arc<dyn ProducerConnection>>,
    cursor: AtomicUsize,
}

impl ProducerPool {
    /// Connect to and ping every address.
    ///
    /// Any failure stops the connections made so far and is returned as a
    /// connect error; a pool never starts with an unreachable node.
    pub async fn connect(
        transport: &dyn PubSubTransport,
        addresses: &[String],
    ) -> Result<Self, JobError> {
        if addresses.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "sender.nsqd_addresses".to_string(),
            }
            .into());
        }

        let mut producers: Vec<Arc<dyn ProducerConnection>> = Vec::with_capacity(addresses.len());
        for address in addresses {
            let outcome = match transport.connect_producer(address).await {
                Ok(producer) => match producer.ping().await {
                    Ok(()) => Ok(producer),
                    Err(e) => {
                        producer.stop().await;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };

            match outcome {
                Ok(producer) => {
                    debug!(address = %address, "Producer connected");
                    producers.push(producer);
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Producer ping failed");
                    for producer in &producers {
                        producer.stop().await;
                    }
                    return Err(JobError::Connect {
                        address: address.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(count = producers.len(), "Producer pool ready");
        Self::from_connections(producers)
    }

    /// Build a pool from already established connections
    pub fn from_connections(producers: Vec<Arc<dyn ProducerConnection>>) -> Result<Self, JobError> {
        if producers.is_empty() {
            return Err(ConfigurationError::Invalid {
                message: "producer pool requires at least one connection".to_string(),
            }
            .into());
        }

        Ok(Self {
            producers,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Index the next publish will use
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    fn next_producer(&self) -> &Arc<dyn ProducerConnection> {
        let count = self.producers.len();
        let index = match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some((current + 1) % count)
            }) {
            Ok(previous) | Err(previous) => previous,
        };
        &self.producers[index]
    }

    /// Publish through the next connection in rotation.
    ///
    /// A positive delay uses the broker's deferred publish. Errors are
    /// returned as-is; the rotation advances whether or not the send succeeds.
    pub async fn publish(
        &self,
        topic: &TopicName,
        delay: Duration,
        payload: Bytes,
    ) -> Result<(), JobError> {
        let producer = self.next_producer();

        if delay > Duration::ZERO {
            debug!(topic = %topic, delay_ms = delay.as_millis() as u64, "Deferred publish");
            producer.deferred_publish(topic, delay, payload).await
        } else {
            debug!(topic = %topic, "Publish");
            producer.publish(topic, payload).await
        }
    }

    /// Stop every connection in the pool
    pub async fn stop(&self) {
        for producer in &self.producers {
            producer.stop().await;
        }
        info!(count = self.producers.len(), "Producer pool stopped");
    }
}

impl std::fmt::Debug for ProducerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let addresses: Vec<&str> = self.producers.iter().map(|p| p.address()).collect();
        f.debug_struct("ProducerPool")
            .field("addresses", &addresses)
            .field("cursor", &self.cursor())
            .finish()
    }
}

//! In-memory brokers for testing and development.
//!
//! This module provides in-process stand-ins for both broker families that
//! plug into the same transport seams as the wire clients:
//! - [`InMemoryPubSub`]: topics fan out to channels, deferred publish,
//!   attempt counting, finish/requeue, simulated unreachable nodes
//! - [`InMemoryQueueService`]: named queues, scheduled jobs, fetch/ack/fail,
//!   server-side retries, heartbeat state, progress tracking
//!
//! Both record every interaction so tests can assert on exactly what the
//! runtime sent.

use crate::config::BackendKind;
use crate::error::JobError;
use crate::job::{format_timestamp, parse_timestamp, ChannelName, MessageId, TopicName};
use crate::pubsub::transport::{
    Delivery, DeliveryAcker, ProducerConnection, PubSubTransport, SubscribeRequest, Subscription,
};
use crate::queue_service::transport::{
    HeartbeatState, JobFailure, ProgressUpdate, QueueServiceConnection, QueueServiceConnector,
    ServiceJob,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn unreachable_error(address: &str) -> JobError {
    JobError::Connect {
        address: address.to_string(),
        message: "node unreachable".to_string(),
    }
}

// ============================================================================
// Pub/Sub Broker
// ============================================================================

/// A publish observed by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRecord {
    pub address: String,
    pub topic: String,
    pub delay: Duration,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: MessageId,
    body: Bytes,
    attempts: u16,
    timestamp: i64,
}

struct ChannelState {
    sender: mpsc::UnboundedSender<StoredMessage>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<StoredMessage>>>,
    finished: usize,
    requeued: usize,
}

impl ChannelState {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            finished: 0,
            requeued: 0,
        }
    }
}

#[derive(Default)]
struct TopicState {
    channels: HashMap<String, ChannelState>,
    /// Messages published before any channel existed
    pending: VecDeque<StoredMessage>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicState>,
    unreachable: HashSet<String>,
    published: Vec<PublishRecord>,
    stopped_producers: Vec<String>,
    subscriptions: Vec<(String, String)>,
}

impl BrokerState {
    fn deliver(&mut self, topic: &str, message: StoredMessage) {
        let state = self.topics.entry(topic.to_string()).or_default();
        if state.channels.is_empty() {
            state.pending.push_back(message);
            return;
        }

        for channel in state.channels.values() {
            let _ = channel.sender.send(message.clone());
        }
    }

    /// Channel state, created on first use; the first channel drains the topic backlog
    fn channel(&mut self, topic: &str, channel: &str) -> &mut ChannelState {
        let state = self.topics.entry(topic.to_string()).or_default();
        let pending = &mut state.pending;
        state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                let created = ChannelState::new();
                while let Some(message) = pending.pop_front() {
                    let _ = created.sender.send(message);
                }
                created
            })
    }
}

/// In-process topic/channel broker
#[derive(Clone, Default)]
pub struct InMemoryPubSub {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation against `address` fail
    pub fn set_unreachable(&self, address: &str, unreachable: bool) {
        let mut state = lock(&self.state);
        if unreachable {
            state.unreachable.insert(address.to_string());
        } else {
            state.unreachable.remove(address);
        }
    }

    fn is_unreachable(&self, address: &str) -> bool {
        lock(&self.state).unreachable.contains(address)
    }

    /// Every publish received, in order
    pub fn published(&self) -> Vec<PublishRecord> {
        lock(&self.state).published.clone()
    }

    /// Publishes received for one topic
    pub fn published_to(&self, topic: &str) -> Vec<PublishRecord> {
        lock(&self.state)
            .published
            .iter()
            .filter(|record| record.topic == topic)
            .cloned()
            .collect()
    }

    /// Addresses of producers that have been stopped
    pub fn stopped_producers(&self) -> Vec<String> {
        lock(&self.state).stopped_producers.clone()
    }

    /// (topic, channel) pairs subscribed so far
    pub fn subscriptions(&self) -> Vec<(String, String)> {
        lock(&self.state).subscriptions.clone()
    }

    pub fn finished_count(&self, topic: &str, channel: &str) -> usize {
        lock(&self.state)
            .topics
            .get(topic)
            .and_then(|t| t.channels.get(channel))
            .map_or(0, |c| c.finished)
    }

    pub fn requeued_count(&self, topic: &str, channel: &str) -> usize {
        lock(&self.state)
            .topics
            .get(topic)
            .and_then(|t| t.channels.get(channel))
            .map_or(0, |c| c.requeued)
    }

    /// Publish on behalf of a producer at `address`
    fn publish_from(&self, address: &str, topic: &str, delay: Duration, body: Bytes) {
        let message = StoredMessage {
            id: MessageId::new(),
            body: body.clone(),
            attempts: 0,
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        };

        let mut state = lock(&self.state);
        state.published.push(PublishRecord {
            address: address.to_string(),
            topic: topic.to_string(),
            delay,
            body,
        });

        if delay.is_zero() {
            state.deliver(topic, message);
            return;
        }
        drop(state);

        let broker = self.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            lock(&broker.state).deliver(&topic, message);
        });
    }

    fn redeliver(&self, topic: &str, channel: &str, message: StoredMessage, delay: Duration) {
        if delay.is_zero() {
            let mut state = lock(&self.state);
            let _ = state.channel(topic, channel).sender.send(message);
            return;
        }

        let broker = self.clone();
        let topic = topic.to_string();
        let channel = channel.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = lock(&broker.state);
            let _ = state.channel(&topic, &channel).sender.send(message);
        });
    }
}

impl std::fmt::Debug for InMemoryPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("InMemoryPubSub")
            .field("topics", &state.topics.keys().collect::<Vec<_>>())
            .field("published", &state.published.len())
            .finish()
    }
}

#[async_trait]
impl PubSubTransport for InMemoryPubSub {
    async fn connect_producer(
        &self,
        address: &str,
    ) -> Result<Arc<dyn ProducerConnection>, JobError> {
        if self.is_unreachable(address) {
            return Err(unreachable_error(address));
        }

        Ok(Arc::new(InMemoryProducer {
            address: address.to_string(),
            broker: self.clone(),
            stopped: Mutex::new(false),
        }))
    }

    async fn subscribe(&self, request: SubscribeRequest) -> Result<Box<dyn Subscription>, JobError> {
        let receiver = {
            let mut state = lock(&self.state);
            state.subscriptions.push((
                request.topic.as_str().to_string(),
                request.channel.as_str().to_string(),
            ));
            Arc::clone(
                &state
                    .channel(request.topic.as_str(), request.channel.as_str())
                    .receiver,
            )
        };

        Ok(Box::new(InMemorySubscription {
            receiver,
            acker: Arc::new(InMemoryAcker {
                broker: self.clone(),
                topic: request.topic,
                channel: request.channel,
                in_flight: Mutex::new(HashMap::new()),
            }),
            closed: false,
        }))
    }
}

/// Producer bound to one simulated node
pub struct InMemoryProducer {
    address: String,
    broker: InMemoryPubSub,
    stopped: Mutex<bool>,
}

impl InMemoryProducer {
    fn check(&self, topic: &TopicName) -> Result<(), JobError> {
        if *lock(&self.stopped) {
            return Err(JobError::Publish {
                topic: topic.to_string(),
                message: "producer stopped".to_string(),
            });
        }
        if self.broker.is_unreachable(&self.address) {
            return Err(unreachable_error(&self.address));
        }
        Ok(())
    }
}

#[async_trait]
impl ProducerConnection for InMemoryProducer {
    fn address(&self) -> &str {
        &self.address
    }

    async fn ping(&self) -> Result<(), JobError> {
        if self.broker.is_unreachable(&self.address) {
            return Err(unreachable_error(&self.address));
        }
        Ok(())
    }

    async fn publish(&self, topic: &TopicName, payload: Bytes) -> Result<(), JobError> {
        self.check(topic)?;
        self.broker
            .publish_from(&self.address, topic.as_str(), Duration::ZERO, payload);
        Ok(())
    }

    async fn deferred_publish(
        &self,
        topic: &TopicName,
        delay: Duration,
        payload: Bytes,
    ) -> Result<(), JobError> {
        self.check(topic)?;
        self.broker
            .publish_from(&self.address, topic.as_str(), delay, payload);
        Ok(())
    }

    async fn stop(&self) {
        let mut stopped = lock(&self.stopped);
        if !*stopped {
            *stopped = true;
            lock(&self.broker.state)
                .stopped_producers
                .push(self.address.clone());
        }
    }
}

struct InMemoryAcker {
    broker: InMemoryPubSub,
    topic: TopicName,
    channel: ChannelName,
    in_flight: Mutex<HashMap<MessageId, StoredMessage>>,
}

impl InMemoryAcker {
    fn take(&self, id: &MessageId) -> Result<StoredMessage, JobError> {
        lock(&self.in_flight)
            .remove(id)
            .ok_or_else(|| JobError::Broker {
                backend: BackendKind::PubSub,
                code: "E_FIN_FAILED".to_string(),
                message: format!("message {} is not in flight", id),
            })
    }
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn finish(&self, id: &MessageId) -> Result<(), JobError> {
        self.take(id)?;
        let mut state = lock(&self.broker.state);
        state
            .channel(self.topic.as_str(), self.channel.as_str())
            .finished += 1;
        Ok(())
    }

    async fn requeue(&self, id: &MessageId, delay: Duration) -> Result<(), JobError> {
        let message = self.take(id)?;
        lock(&self.broker.state)
            .channel(self.topic.as_str(), self.channel.as_str())
            .requeued += 1;
        self.broker
            .redeliver(self.topic.as_str(), self.channel.as_str(), message, delay);
        Ok(())
    }

    async fn touch(&self, id: &MessageId) -> Result<(), JobError> {
        if lock(&self.in_flight).contains_key(id) {
            Ok(())
        } else {
            Err(JobError::Broker {
                backend: BackendKind::PubSub,
                code: "E_TOUCH_FAILED".to_string(),
                message: format!("message {} is not in flight", id),
            })
        }
    }
}

struct InMemorySubscription {
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<StoredMessage>>>,
    acker: Arc<InMemoryAcker>,
    closed: bool,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        if self.closed {
            return None;
        }

        let mut message = self.receiver.lock().await.recv().await?;
        message.attempts = message.attempts.saturating_add(1);
        lock(&self.acker.in_flight).insert(message.id.clone(), message.clone());

        let acker: Arc<dyn DeliveryAcker> = self.acker.clone();
        Some(Delivery::new(
            message.id,
            message.body,
            message.attempts,
            message.timestamp,
            acker,
        ))
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

// ============================================================================
// Queue Service
// ============================================================================

struct ServiceState {
    queues: HashMap<String, VecDeque<ServiceJob>>,
    scheduled: Vec<ServiceJob>,
    in_flight: HashMap<String, ServiceJob>,
    retries: HashMap<String, u32>,
    max_retries: u32,
    pushed: Vec<ServiceJob>,
    acked: Vec<String>,
    failures: Vec<JobFailure>,
    morgue: Vec<ServiceJob>,
    progress: Vec<ProgressUpdate>,
    opened_batches: Vec<String>,
    committed_batches: Vec<String>,
    heartbeat: HeartbeatState,
    beats: Vec<String>,
    worker_ids: Vec<String>,
    connections: usize,
    closed_connections: usize,
    unreachable: bool,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            queues: HashMap::new(),
            scheduled: Vec::new(),
            in_flight: HashMap::new(),
            retries: HashMap::new(),
            max_retries: 0,
            pushed: Vec::new(),
            acked: Vec::new(),
            failures: Vec::new(),
            morgue: Vec::new(),
            progress: Vec::new(),
            opened_batches: Vec::new(),
            committed_batches: Vec::new(),
            heartbeat: HeartbeatState::Running,
            beats: Vec::new(),
            worker_ids: Vec::new(),
            connections: 0,
            closed_connections: 0,
            unreachable: false,
        }
    }
}

impl ServiceState {
    fn enqueue(&mut self, job: ServiceJob) {
        self.queues.entry(job.queue.clone()).or_default().push_back(job);
    }

    fn promote_due(&mut self) {
        let now = Utc::now();
        let (due, waiting): (Vec<ServiceJob>, Vec<ServiceJob>) =
            self.scheduled.drain(..).partition(|job| {
                job.at
                    .as_deref()
                    .map(|at| parse_timestamp(at).map_or(true, |at| at <= now))
                    .unwrap_or(true)
            });
        self.scheduled = waiting;
        for job in due {
            self.enqueue(job);
        }
    }

    fn reserve(&mut self, queues: &[String]) -> Option<ServiceJob> {
        self.promote_due();
        for queue in queues {
            if let Some(job) = self.queues.get_mut(queue).and_then(VecDeque::pop_front) {
                self.in_flight.insert(job.jid.clone(), job.clone());
                return Some(job);
            }
        }
        None
    }
}

/// In-process job server
#[derive(Clone, Default)]
pub struct InMemoryQueueService {
    state: Arc<Mutex<ServiceState>>,
    notify: Arc<Notify>,
}

impl InMemoryQueueService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry failed jobs up to `max_retries` times before moving them to the morgue
    pub fn with_max_retries(self, max_retries: u32) -> Self {
        lock(&self.state).max_retries = max_retries;
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// State returned to the next heartbeats
    pub fn set_heartbeat_state(&self, heartbeat: HeartbeatState) {
        lock(&self.state).heartbeat = heartbeat;
    }

    pub fn pushed(&self) -> Vec<ServiceJob> {
        lock(&self.state).pushed.clone()
    }

    pub fn acked(&self) -> Vec<String> {
        lock(&self.state).acked.clone()
    }

    pub fn failures(&self) -> Vec<JobFailure> {
        lock(&self.state).failures.clone()
    }

    pub fn morgue(&self) -> Vec<ServiceJob> {
        lock(&self.state).morgue.clone()
    }

    pub fn progress(&self) -> Vec<ProgressUpdate> {
        lock(&self.state).progress.clone()
    }

    /// Batch ids reopened through `open_batch`, in order
    pub fn opened_batches(&self) -> Vec<String> {
        lock(&self.state).opened_batches.clone()
    }

    pub fn committed_batches(&self) -> Vec<String> {
        lock(&self.state).committed_batches.clone()
    }

    /// Worker ids that sent a heartbeat, one entry per beat
    pub fn beats(&self) -> Vec<String> {
        lock(&self.state).beats.clone()
    }

    /// Worker ids announced by worker connections
    pub fn worker_ids(&self) -> Vec<String> {
        lock(&self.state).worker_ids.clone()
    }

    pub fn open_connections(&self) -> usize {
        let state = lock(&self.state);
        state.connections - state.closed_connections
    }

    pub fn total_connections(&self) -> usize {
        lock(&self.state).connections
    }

    /// Jobs waiting in `queue`, excluding scheduled ones
    pub fn queue_len(&self, queue: &str) -> usize {
        lock(&self.state).queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn scheduled_len(&self) -> usize {
        lock(&self.state).scheduled.len()
    }
}

impl std::fmt::Debug for InMemoryQueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("InMemoryQueueService")
            .field("queues", &state.queues.keys().collect::<Vec<_>>())
            .field("pushed", &state.pushed.len())
            .finish()
    }
}

#[async_trait]
impl QueueServiceConnector for InMemoryQueueService {
    async fn connect(
        &self,
        worker_id: Option<&str>,
    ) -> Result<Box<dyn QueueServiceConnection>, JobError> {
        let mut state = lock(&self.state);
        if state.unreachable {
            return Err(unreachable_error("memory"));
        }
        state.connections += 1;
        if let Some(wid) = worker_id {
            state.worker_ids.push(wid.to_string());
        }

        Ok(Box::new(InMemoryServiceConnection {
            service: self.clone(),
            worker_id: worker_id.map(str::to_string),
            closed: false,
        }))
    }

    fn address(&self) -> String {
        "memory".to_string()
    }
}

struct InMemoryServiceConnection {
    service: InMemoryQueueService,
    worker_id: Option<String>,
    closed: bool,
}

impl InMemoryServiceConnection {
    fn state(&self) -> Result<MutexGuard<'_, ServiceState>, JobError> {
        let state = lock(&self.service.state);
        if self.closed || state.unreachable {
            return Err(JobError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection closed",
            )));
        }
        Ok(state)
    }
}

#[async_trait]
impl QueueServiceConnection for InMemoryServiceConnection {
    async fn push(&mut self, job: &ServiceJob) -> Result<(), JobError> {
        let scheduled = match job.at.as_deref() {
            Some(at) => parse_timestamp(at)? > Utc::now(),
            None => false,
        };

        let mut state = self.state()?;
        let mut job = job.clone();
        job.enqueued_at = Some(format_timestamp(Utc::now()));
        state.pushed.push(job.clone());

        if scheduled {
            state.scheduled.push(job);
        } else {
            state.enqueue(job);
        }
        drop(state);

        self.service.notify.notify_waiters();
        Ok(())
    }

    async fn fetch(&mut self, queues: &[String]) -> Result<Option<ServiceJob>, JobError> {
        let reserved = self.state()?.reserve(queues);
        if reserved.is_some() {
            return Ok(reserved);
        }

        let notified = self.service.notify.notified();
        let _ = tokio::time::timeout(Duration::from_millis(50), notified).await;
        Ok(self.state()?.reserve(queues))
    }

    async fn ack(&mut self, jid: &str) -> Result<(), JobError> {
        let mut state = self.state()?;
        state.in_flight.remove(jid);
        state.acked.push(jid.to_string());
        Ok(())
    }

    async fn fail(&mut self, failure: &JobFailure) -> Result<(), JobError> {
        let mut state = self.state()?;
        state.failures.push(failure.clone());

        let max_retries = state.max_retries;
        if let Some(job) = state.in_flight.remove(&failure.jid) {
            let retries = {
                let count = state.retries.entry(job.jid.clone()).or_insert(0);
                *count += 1;
                *count
            };
            if retries > max_retries {
                state.morgue.push(job);
            } else {
                state.enqueue(job);
            }
        }
        drop(state);

        self.service.notify.notify_waiters();
        Ok(())
    }

    async fn beat(&mut self) -> Result<HeartbeatState, JobError> {
        let mut state = self.state()?;
        let wid = self.worker_id.clone().unwrap_or_default();
        state.beats.push(wid);
        Ok(state.heartbeat)
    }

    async fn track_progress(&mut self, update: &ProgressUpdate) -> Result<(), JobError> {
        self.state()?.progress.push(update.clone());
        Ok(())
    }

    async fn open_batch(&mut self, bid: &str) -> Result<(), JobError> {
        self.state()?.opened_batches.push(bid.to_string());
        Ok(())
    }

    async fn commit_batch(&mut self, bid: &str) -> Result<(), JobError> {
        let mut state = self.state()?;
        if !state.opened_batches.iter().any(|opened| opened == bid) {
            return Err(JobError::Broker {
                backend: BackendKind::QueueService,
                code: "ERR".to_string(),
                message: format!("batch {} is not open", bid),
            });
        }
        state.committed_batches.push(bid.to_string());
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            lock(&self.service.state).closed_connections += 1;
        }
    }
}

impl Drop for InMemoryServiceConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            lock(&self.service.state).closed_connections += 1;
        }
    }
}

//! TCP client for NSQ-compatible brokers and HTTP discovery through the
//! lookup service.
//!
//! Every connection opens with the `"  V2"` magic and an `IDENTIFY`. Commands
//! are newline-terminated text, optionally followed by a length-prefixed
//! body. The broker answers with frames:
//!
//! ```text
//! [u32 size][u32 frame type][data ...]
//! ```
//!
//! Message frames carry `[i64 timestamp][u16 attempts][16-byte id][body]`.

use crate::config::{BackendKind, PubSubConfig};
use crate::error::{JobError, SerializationError};
use crate::job::{MessageId, TopicName};
use crate::pubsub::transport::{
    Delivery, DeliveryAcker, ProducerConnection, PubSubTransport, SubscribeRequest, Subscription,
};
use crate::retry::Backoff;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufStream};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "nsq_tests.rs"]
mod tests;

/// Protocol magic sent first on every connection
pub const MAGIC_V2: &[u8] = b"  V2";

pub const FRAME_TYPE_RESPONSE: u32 = 0;
pub const FRAME_TYPE_ERROR: u32 = 1;
pub const FRAME_TYPE_MESSAGE: u32 = 2;

/// Largest frame accepted from the broker
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEARTBEAT: &[u8] = b"_heartbeat_";
const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";
const MESSAGE_HEADER_LEN: usize = 26;
const MESSAGE_ID_LEN: usize = 16;

/// Reader reconnect attempts before the node is left to the next discovery poll
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

// ============================================================================
// Frame Codec
// ============================================================================

/// A decoded broker frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(RawMessage),
}

/// Message frame contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Nanoseconds since the epoch
    pub timestamp: i64,
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

fn protocol_error(message: impl Into<String>) -> JobError {
    JobError::Protocol {
        backend: BackendKind::PubSub,
        message: message.into(),
    }
}

/// Turn an error frame such as `E_BAD_TOPIC invalid name` into a broker error
fn broker_error(data: &[u8]) -> JobError {
    let text = String::from_utf8_lossy(data);
    let (code, message) = match text.split_once(' ') {
        Some((code, message)) => (code.to_string(), message.to_string()),
        None => (text.to_string(), String::new()),
    };
    JobError::Broker {
        backend: BackendKind::PubSub,
        code,
        message,
    }
}

/// Read one frame
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, JobError>
where
    R: AsyncRead + Unpin,
{
    let size = reader.read_u32().await? as usize;
    if size < 4 {
        return Err(protocol_error(format!("frame size {} below header size", size)));
    }
    if size > MAX_FRAME_SIZE {
        return Err(SerializationError::FrameTooLarge {
            size,
            max_size: MAX_FRAME_SIZE,
        }
        .into());
    }

    let frame_type = reader.read_u32().await?;
    let mut data = vec![0u8; size - 4];
    reader.read_exact(&mut data).await?;
    let data = Bytes::from(data);

    match frame_type {
        FRAME_TYPE_RESPONSE => Ok(Frame::Response(data)),
        FRAME_TYPE_ERROR => Ok(Frame::Error(data)),
        FRAME_TYPE_MESSAGE => Ok(Frame::Message(decode_message(data)?)),
        other => Err(protocol_error(format!("unknown frame type {}", other))),
    }
}

/// Decode the payload of a message frame
pub fn decode_message(mut data: Bytes) -> Result<RawMessage, JobError> {
    if data.len() < MESSAGE_HEADER_LEN {
        return Err(SerializationError::MalformedFrame {
            message: format!(
                "message frame of {} bytes is shorter than its {} byte header",
                data.len(),
                MESSAGE_HEADER_LEN
            ),
        }
        .into());
    }

    let timestamp = data.get_i64();
    let attempts = data.get_u16();
    let id = data.split_to(MESSAGE_ID_LEN);

    Ok(RawMessage {
        timestamp,
        attempts,
        id: MessageId::from_bytes(&id),
        body: data,
    })
}

/// Encode `NAME p1 p2\n`, followed by `[u32 size][body]` when a body is given
pub fn encode_command(name: &str, params: &[&str], body: Option<&[u8]>) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + body.map_or(0, <[u8]>::len));
    buf.put_slice(name.as_bytes());
    for param in params {
        buf.put_u8(b' ');
        buf.put_slice(param.as_bytes());
    }
    buf.put_u8(b'\n');

    if let Some(body) = body {
        buf.put_u32(body.len() as u32);
        buf.put_slice(body);
    }
    buf.freeze()
}

fn not_connected(message: &str) -> JobError {
    JobError::Io(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        message.to_string(),
    ))
}

// ============================================================================
// Options and Handshake
// ============================================================================

/// Connection settings derived from [`PubSubConfig`]
#[derive(Debug, Clone)]
pub struct NsqOptions {
    pub nsqd_addresses: Vec<String>,
    pub dial_timeout: Duration,
    pub operation_timeout: Duration,
    pub lookupd_poll_interval: Duration,
    /// Consumer heartbeat interval requested in `IDENTIFY`
    pub heartbeat_interval: Duration,
    pub hostname: String,
    pub user_agent: String,
}

impl NsqOptions {
    pub fn from_config(config: &PubSubConfig) -> Self {
        Self {
            nsqd_addresses: config.sender.nsqd_addresses.clone(),
            dial_timeout: config.sender.dial_timeout(),
            operation_timeout: config.sender.operation_timeout(),
            lookupd_poll_interval: config.worker.lookupd_poll_interval(),
            heartbeat_interval: Duration::from_secs(30),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            user_agent: format!("job-runtime/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    fn identify(&self, heartbeats: bool) -> Identify<'_> {
        let heartbeat_interval = if heartbeats {
            self.heartbeat_interval.as_millis() as i64
        } else {
            -1
        };
        Identify {
            client_id: self.hostname.split('.').next().unwrap_or(&self.hostname),
            hostname: &self.hostname,
            user_agent: &self.user_agent,
            heartbeat_interval,
            feature_negotiation: false,
        }
    }
}

/// `IDENTIFY` body
#[derive(Debug, Serialize)]
struct Identify<'a> {
    client_id: &'a str,
    hostname: &'a str,
    user_agent: &'a str,
    /// Milliseconds; -1 disables heartbeats
    heartbeat_interval: i64,
    feature_negotiation: bool,
}

/// Read frames until a response, answering heartbeats along the way
async fn expect_response<S>(stream: &mut S) -> Result<Bytes, JobError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match read_frame(stream).await? {
            Frame::Response(data) if data.as_ref() == HEARTBEAT => {
                stream.write_all(&encode_command("NOP", &[], None)).await?;
                stream.flush().await?;
            }
            Frame::Response(data) => return Ok(data),
            Frame::Error(data) => return Err(broker_error(&data)),
            Frame::Message(_) => return Err(protocol_error("unexpected message frame")),
        }
    }
}

/// Send a command and wait for its response
async fn request<S>(stream: &mut S, command: &[u8]) -> Result<Bytes, JobError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(command).await?;
    stream.flush().await?;
    expect_response(stream).await
}

/// Send the magic and `IDENTIFY`
async fn handshake<S>(stream: &mut S, identify: &Identify<'_>) -> Result<(), JobError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(MAGIC_V2).await?;
    let body = serde_json::to_vec(identify).map_err(SerializationError::from)?;
    request(stream, &encode_command("IDENTIFY", &[], Some(&body))).await?;
    Ok(())
}

/// Open a TCP connection and identify, both bounded by the dial timeout
async fn dial(address: &str, options: &NsqOptions, heartbeats: bool) -> Result<TcpStream, JobError> {
    let connect_error = |message: String| JobError::Connect {
        address: address.to_string(),
        message,
    };

    let mut stream = tokio::time::timeout(options.dial_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| connect_error(format!("timed out after {:?}", options.dial_timeout)))?
        .map_err(|e| connect_error(e.to_string()))?;
    let _ = stream.set_nodelay(true);

    tokio::time::timeout(
        options.dial_timeout,
        handshake(&mut stream, &options.identify(heartbeats)),
    )
    .await
    .map_err(|_| connect_error("IDENTIFY timed out".to_string()))?
    .map_err(|e| connect_error(e.to_string()))?;

    Ok(stream)
}

// ============================================================================
// Producer
// ============================================================================

/// Publishing connection to one broker node, dialed on first use
pub struct NsqProducer {
    address: String,
    options: Arc<NsqOptions>,
    stream: tokio::sync::Mutex<Option<BufStream<TcpStream>>>,
    stopped: AtomicBool,
}

impl NsqProducer {
    pub fn new(address: impl Into<String>, options: Arc<NsqOptions>) -> Self {
        Self {
            address: address.into(),
            options,
            stream: tokio::sync::Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    async fn ensure_connected(
        &self,
        slot: &mut Option<BufStream<TcpStream>>,
    ) -> Result<(), JobError> {
        if slot.is_none() {
            let stream = dial(&self.address, &self.options, false).await?;
            debug!(address = %self.address, "Producer connected");
            *slot = Some(BufStream::new(stream));
        }
        Ok(())
    }

    /// Send one command and wait for `OK`; any failure drops the connection
    async fn round_trip(&self, command: Bytes) -> Result<(), JobError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(not_connected("producer stopped"));
        }

        let timeout = self.options.operation_timeout;
        let mut slot = self.stream.lock().await;
        let outcome = tokio::time::timeout(timeout, async {
            self.ensure_connected(&mut slot).await?;
            match slot.as_mut() {
                Some(stream) => request(stream, &command).await.map(|_| ()),
                None => Err(not_connected("producer connection missing")),
            }
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout { duration: timeout }),
        };
        if result.is_err() {
            *slot = None;
        }
        result
    }
}

impl std::fmt::Debug for NsqProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NsqProducer")
            .field("address", &self.address)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl ProducerConnection for NsqProducer {
    fn address(&self) -> &str {
        &self.address
    }

    async fn ping(&self) -> Result<(), JobError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(not_connected("producer stopped"));
        }
        let mut slot = self.stream.lock().await;
        self.ensure_connected(&mut slot).await
    }

    async fn publish(&self, topic: &TopicName, payload: Bytes) -> Result<(), JobError> {
        self.round_trip(encode_command("PUB", &[topic.as_str()], Some(&payload)))
            .await
    }

    async fn deferred_publish(
        &self,
        topic: &TopicName,
        delay: Duration,
        payload: Bytes,
    ) -> Result<(), JobError> {
        let millis = delay.as_millis().to_string();
        self.round_trip(encode_command(
            "DPUB",
            &[topic.as_str(), millis.as_str()],
            Some(&payload),
        ))
        .await
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let mut slot = self.stream.lock().await;
        if let Some(mut stream) = slot.take() {
            let _ = stream.shutdown().await;
            debug!(address = %self.address, "Producer stopped");
        }
    }
}

// ============================================================================
// Lookup Service
// ============================================================================

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Vec<LookupProducer>,
}

#[derive(Debug, Deserialize)]
struct LookupProducer {
    broadcast_address: String,
    tcp_port: u16,
}

/// Parse a `/lookup` body into `host:port` broker addresses.
///
/// Older lookup services wrap the payload in `{"data": ...}`.
pub fn parse_lookup_response(body: &[u8]) -> Result<Vec<String>, JobError> {
    let value: serde_json::Value = serde_json::from_slice(body).map_err(SerializationError::from)?;
    let payload = match value.get("data") {
        Some(data) if data.is_object() => data.clone(),
        _ => value,
    };
    let response: LookupResponse =
        serde_json::from_value(payload).map_err(SerializationError::from)?;

    Ok(response
        .producers
        .into_iter()
        .map(|p| format!("{}:{}", p.broadcast_address, p.tcp_port))
        .collect())
}

/// HTTP client for the lookup service
#[derive(Debug, Clone)]
pub struct LookupClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl LookupClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }

    /// Brokers currently producing `topic`; a 404 means none yet
    pub async fn lookup(&self, lookupd: &str, topic: &TopicName) -> Result<Vec<String>, JobError> {
        let base = if lookupd.starts_with("http://") || lookupd.starts_with("https://") {
            lookupd.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", lookupd)
        };
        let url = format!("{}/lookup", base);

        let response = self
            .http
            .get(&url)
            .query(&[("topic", topic.as_str())])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| JobError::Connect {
                address: lookupd.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(JobError::Broker {
                backend: BackendKind::PubSub,
                code: status.as_u16().to_string(),
                message: format!("lookup of '{}' failed", topic),
            });
        }

        let body = response.bytes().await.map_err(|e| JobError::Connect {
            address: lookupd.to_string(),
            message: e.to_string(),
        })?;
        parse_lookup_response(&body)
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// Sends `FIN`, `REQ` and `TOUCH` back over the connection a message came from
#[derive(Debug)]
struct NsqAcker {
    commands: mpsc::Sender<Bytes>,
}

impl NsqAcker {
    async fn send(&self, command: Bytes) -> Result<(), JobError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| not_connected("consumer connection closed"))
    }
}

#[async_trait]
impl DeliveryAcker for NsqAcker {
    async fn finish(&self, id: &MessageId) -> Result<(), JobError> {
        self.send(encode_command("FIN", &[id.as_str()], None)).await
    }

    async fn requeue(&self, id: &MessageId, delay: Duration) -> Result<(), JobError> {
        let millis = delay.as_millis().to_string();
        self.send(encode_command("REQ", &[id.as_str(), millis.as_str()], None))
            .await
    }

    async fn touch(&self, id: &MessageId) -> Result<(), JobError> {
        self.send(encode_command("TOUCH", &[id.as_str()], None)).await
    }
}

/// Drain queued commands onto the socket until every sender is gone
async fn write_commands(mut writer: OwnedWriteHalf, mut commands: mpsc::Receiver<Bytes>) {
    while let Some(command) = commands.recv().await {
        if let Err(e) = writer.write_all(&command).await {
            debug!(error = %e, "Consumer connection write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Shared state of one subscription's discovery and reader tasks
struct Discovery {
    request: SubscribeRequest,
    options: Arc<NsqOptions>,
    lookup: LookupClient,
    deliveries: mpsc::Sender<Delivery>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    connected: Mutex<HashSet<String>>,
    backoff: Backoff,
}

impl Discovery {
    async fn run(self: Arc<Self>) {
        loop {
            for address in self.producer_addresses().await {
                if self.claim(&address) {
                    self.tasks.spawn(Arc::clone(&self).read_node(address));
                }
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.options.lookupd_poll_interval) => {}
            }
        }
    }

    /// Brokers to read from: lookup results, or the configured brokers when
    /// no lookup service is configured
    async fn producer_addresses(&self) -> BTreeSet<String> {
        if self.request.lookupd_addresses.is_empty() {
            return self.options.nsqd_addresses.iter().cloned().collect();
        }

        let mut addresses = BTreeSet::new();
        for lookupd in &self.request.lookupd_addresses {
            match self.lookup.lookup(lookupd, &self.request.topic).await {
                Ok(found) => addresses.extend(found),
                Err(e) => warn!(
                    lookupd = %lookupd,
                    topic = %self.request.topic,
                    error = %e,
                    "Lookup failed"
                ),
            }
        }
        addresses
    }

    fn claim(&self, address: &str) -> bool {
        match self.connected.lock() {
            Ok(mut connected) => connected.insert(address.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(address.to_string()),
        }
    }

    fn release(&self, address: &str) {
        match self.connected.lock() {
            Ok(mut connected) => connected.remove(address),
            Err(poisoned) => poisoned.into_inner().remove(address),
        };
    }

    /// Keep one connection to `address` alive until shutdown, reconnecting
    /// with backoff
    async fn read_node(self: Arc<Self>, address: String) {
        let mut failures: u32 = 0;

        while !self.shutdown.is_cancelled() {
            match self.session(&address).await {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    warn!(
                        address = %address,
                        topic = %self.request.topic,
                        channel = %self.request.channel,
                        attempt = failures,
                        error = %e,
                        "Consumer connection lost"
                    );
                    if failures >= MAX_RECONNECT_ATTEMPTS {
                        break;
                    }
                }
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.backoff.delay(failures)) => {}
            }
        }

        self.release(&address);
        debug!(address = %address, topic = %self.request.topic, "Consumer reader exited");
    }

    /// One connection: subscribe, then forward messages until shutdown or error
    async fn session(&self, address: &str) -> Result<(), JobError> {
        let mut stream = dial(address, &self.options, true).await?;
        tokio::time::timeout(
            self.options.operation_timeout,
            request(
                &mut stream,
                &encode_command(
                    "SUB",
                    &[self.request.topic.as_str(), self.request.channel.as_str()],
                    None,
                ),
            ),
        )
        .await
        .map_err(|_| JobError::Timeout {
            duration: self.options.operation_timeout,
        })??;

        let (reader, writer) = stream.into_split();
        let (commands, queued) = mpsc::channel(self.request.max_in_flight as usize + 8);
        tokio::spawn(write_commands(writer, queued));
        let acker: Arc<dyn DeliveryAcker> = Arc::new(NsqAcker {
            commands: commands.clone(),
        });

        let rdy = self.request.max_in_flight.max(1).to_string();
        send_command(&commands, encode_command("RDY", &[rdy.as_str()], None)).await?;
        info!(
            address = %address,
            topic = %self.request.topic,
            channel = %self.request.channel,
            "Consumer connected"
        );

        let mut reader = BufReader::new(reader);
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    let _ = commands.send(encode_command("CLS", &[], None)).await;
                    return Ok(());
                }
                frame = read_frame(&mut reader) => frame?,
            };

            match frame {
                Frame::Response(data) if data.as_ref() == HEARTBEAT => {
                    send_command(&commands, encode_command("NOP", &[], None)).await?;
                }
                Frame::Response(data) if data.as_ref() == CLOSE_WAIT => return Ok(()),
                Frame::Response(_) => {}
                Frame::Error(data) => {
                    warn!(address = %address, error = %broker_error(&data), "Broker reported error");
                }
                Frame::Message(message) => {
                    let delivery = Delivery::new(
                        message.id,
                        message.body,
                        message.attempts,
                        message.timestamp,
                        Arc::clone(&acker),
                    );
                    if let Err(mpsc::error::SendError(delivery)) =
                        self.deliveries.send(delivery).await
                    {
                        let _ = delivery.requeue(Duration::ZERO).await;
                        let _ = commands.send(encode_command("CLS", &[], None)).await;
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn send_command(commands: &mpsc::Sender<Bytes>, command: Bytes) -> Result<(), JobError> {
    commands
        .send(command)
        .await
        .map_err(|_| not_connected("consumer connection closed"))
}

/// Deliveries for one (topic, channel) from every discovered broker
pub struct NsqSubscription {
    deliveries: mpsc::Receiver<Delivery>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for NsqSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NsqSubscription")
            .field("closed", &self.shutdown.is_cancelled())
            .field("readers", &self.tasks.len())
            .finish()
    }
}

#[async_trait]
impl Subscription for NsqSubscription {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }

    async fn close(&mut self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.deliveries.close();

        // Hand back anything received but not yet dispatched
        while let Ok(delivery) = self.deliveries.try_recv() {
            if let Err(e) = delivery.requeue(Duration::ZERO).await {
                debug!(id = %delivery.id, error = %e, "Failed to return undispatched message");
            }
        }
        self.tasks.wait().await;
    }
}

impl Drop for NsqSubscription {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Transport
// ============================================================================

/// [`PubSubTransport`] over NSQ TCP connections
#[derive(Debug, Clone)]
pub struct NsqTransport {
    options: Arc<NsqOptions>,
    lookup: LookupClient,
}

impl NsqTransport {
    pub fn from_config(config: &PubSubConfig) -> Self {
        Self::new(NsqOptions::from_config(config))
    }

    pub fn new(options: NsqOptions) -> Self {
        let lookup = LookupClient::new(options.operation_timeout);
        Self {
            options: Arc::new(options),
            lookup,
        }
    }

    pub fn options(&self) -> &NsqOptions {
        &self.options
    }
}

#[async_trait]
impl PubSubTransport for NsqTransport {
    async fn connect_producer(
        &self,
        address: &str,
    ) -> Result<Arc<dyn ProducerConnection>, JobError> {
        Ok(Arc::new(NsqProducer::new(address, Arc::clone(&self.options))))
    }

    async fn subscribe(&self, request: SubscribeRequest) -> Result<Box<dyn Subscription>, JobError> {
        let (deliveries, receiver) = mpsc::channel(request.max_in_flight.max(1) as usize);
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        debug!(
            topic = %request.topic,
            channel = %request.channel,
            lookupd = ?request.lookupd_addresses,
            "Subscribing"
        );

        let discovery = Arc::new(Discovery {
            request,
            options: Arc::clone(&self.options),
            lookup: self.lookup.clone(),
            deliveries,
            shutdown: shutdown.clone(),
            tasks: tasks.clone(),
            connected: Mutex::new(HashSet::new()),
            backoff: Backoff::default(),
        });
        tasks.spawn(discovery.run());

        Ok(Box::new(NsqSubscription {
            deliveries: receiver,
            shutdown,
            tasks,
        }))
    }
}

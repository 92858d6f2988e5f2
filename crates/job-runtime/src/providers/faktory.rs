//! TCP client for Faktory-compatible queue servers.
//!
//! The protocol is line oriented with RESP-style replies:
//! - `+text` simple string
//! - `-ERR text` error
//! - `$n` followed by `n` bytes, or `$-1` for nil
//!
//! Connections start with a `+HI {json}` greeting answered by `HELLO {json}`;
//! when the server requires a password the greeting carries a salt and an
//! iteration count for the password hash.

use crate::config::{BackendKind, QueueServiceConfig};
use crate::error::{ConfigurationError, JobError, SerializationError};
use crate::queue_service::transport::{
    HeartbeatState, JobFailure, ProgressUpdate, QueueServiceConnection, QueueServiceConnector,
    ServiceJob,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "faktory_tests.rs"]
mod tests;

/// Port used when the URL does not name one
pub const DEFAULT_PORT: u16 = 7419;

/// Protocol version announced in `HELLO`
pub const PROTOCOL_VERSION: u32 = 2;

/// Largest bulk reply accepted from the server
pub const MAX_BULK_SIZE: usize = 16 * 1024 * 1024;

/// Round-trip bound used until [`FaktoryConnection::with_operation_timeout`] overrides it
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Reply Parsing
// ============================================================================

/// A successful server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Bulk(Option<Vec<u8>>),
}

impl Reply {
    /// Payload bytes of a simple or non-nil bulk reply
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Self::Simple(text) => Some(text.into_bytes()),
            Self::Bulk(bytes) => bytes,
        }
    }
}

fn protocol_error(message: impl Into<String>) -> JobError {
    JobError::Protocol {
        backend: BackendKind::QueueService,
        message: message.into(),
    }
}

/// Split `ERR message` into its code and message
fn server_error(text: &str) -> JobError {
    let (code, message) = match text.split_once(' ') {
        Some((code, message)) => (code, message),
        None => (text, ""),
    };
    JobError::Broker {
        backend: BackendKind::QueueService,
        code: code.to_string(),
        message: message.to_string(),
    }
}

/// Read one reply; server `-` errors are returned as [`JobError::Broker`]
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply, JobError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(JobError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "server closed the connection",
        )));
    }
    let line = line.trim_end_matches(['\r', '\n']);

    match line.as_bytes().first() {
        Some(b'+') | Some(b':') => Ok(Reply::Simple(line[1..].to_string())),
        Some(b'-') => Err(server_error(&line[1..])),
        Some(b'$') => {
            let length: i64 = line[1..]
                .parse()
                .map_err(|_| protocol_error(format!("invalid bulk length '{}'", &line[1..])))?;
            if length < 0 {
                return Ok(Reply::Bulk(None));
            }

            let length = usize::try_from(length).map_err(|_| protocol_error("bulk length overflow"))?;
            if length > MAX_BULK_SIZE {
                return Err(SerializationError::FrameTooLarge {
                    size: length,
                    max_size: MAX_BULK_SIZE,
                }
                .into());
            }

            let mut payload = vec![0u8; length + 2];
            reader.read_exact(&mut payload).await?;
            if !payload.ends_with(b"\r\n") {
                return Err(protocol_error("bulk reply not terminated by CRLF"));
            }
            payload.truncate(length);
            Ok(Reply::Bulk(Some(payload)))
        }
        _ => Err(protocol_error(format!("unexpected reply '{}'", line))),
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Server greeting sent with `+HI`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerHello {
    #[serde(rename = "v")]
    pub version: u32,
    /// Password hash iterations, present when a password is required
    #[serde(rename = "i", default)]
    pub iterations: Option<u32>,
    /// Password salt, present when a password is required
    #[serde(rename = "s", default)]
    pub salt: Option<String>,
}

/// Client identification sent with `HELLO`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientHello {
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wid: Option<String>,
    pub pid: u32,
    pub labels: Vec<String>,
    pub v: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pwdhash: Option<String>,
}

/// Hex of SHA-256 applied `iterations` times to `password + salt`
pub fn password_hash(password: &str, salt: &str, iterations: u32) -> String {
    let mut digest = Sha256::digest(format!("{}{}", password, salt).as_bytes());
    for _ in 1..iterations.max(1) {
        digest = Sha256::digest(digest);
    }
    hex::encode(digest)
}

#[derive(Debug, Deserialize)]
struct BeatReply {
    state: String,
}

// ============================================================================
// Connection
// ============================================================================

/// One authenticated connection over any byte stream
pub struct FaktoryConnection<S> {
    stream: BufStream<S>,
    worker_id: Option<String>,
    operation_timeout: Duration,
    closed: bool,
}

impl<S> FaktoryConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Read the greeting and answer it with `hello`, hashing `password` if asked
    pub async fn handshake(
        stream: S,
        mut hello: ClientHello,
        password: Option<&str>,
    ) -> Result<Self, JobError> {
        let mut stream = BufStream::new(stream);

        let greeting = match read_reply(&mut stream).await? {
            Reply::Simple(text) => text,
            Reply::Bulk(_) => return Err(protocol_error("expected +HI greeting")),
        };
        let body = greeting
            .strip_prefix("HI ")
            .ok_or_else(|| protocol_error(format!("expected +HI greeting, got '{}'", greeting)))?;
        let server: ServerHello = serde_json::from_str(body).map_err(SerializationError::from)?;

        if server.version > PROTOCOL_VERSION {
            warn!(
                server_version = server.version,
                client_version = PROTOCOL_VERSION,
                "Server speaks a newer protocol version"
            );
        }

        if let (Some(iterations), Some(salt)) = (server.iterations, server.salt.as_deref()) {
            let password = password.ok_or_else(|| ConfigurationError::Missing {
                key: "url password".to_string(),
            })?;
            hello.pwdhash = Some(password_hash(password, salt, iterations));
        }

        let worker_id = hello.wid.clone();
        let mut connection = Self {
            stream,
            worker_id,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            closed: false,
        };
        let payload = serde_json::to_string(&hello).map_err(SerializationError::from)?;
        connection.command_ok(&format!("HELLO {}", payload)).await?;
        Ok(connection)
    }

    /// Bound every later command round trip by `timeout`
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    async fn send(&mut self, line: &str) -> Result<(), JobError> {
        if self.closed {
            return Err(JobError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection closed",
            )));
        }
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send one command and read its reply within the operation timeout.
    ///
    /// A timed-out connection is closed; a partial reply may still be in flight.
    async fn command(&mut self, line: &str) -> Result<Reply, JobError> {
        let duration = self.operation_timeout;
        let round_trip = async {
            self.send(line).await?;
            read_reply(&mut self.stream).await
        };
        let outcome = tokio::time::timeout(duration, round_trip).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                self.closed = true;
                Err(JobError::Timeout { duration })
            }
        }
    }

    async fn command_ok(&mut self, line: &str) -> Result<(), JobError> {
        match self.command(line).await? {
            Reply::Simple(text) if text == "OK" => Ok(()),
            other => Err(protocol_error(format!("expected +OK, got {:?}", other))),
        }
    }

    async fn command_json<T: Serialize + ?Sized>(
        &mut self,
        verb: &str,
        body: &T,
    ) -> Result<(), JobError> {
        let payload = serde_json::to_string(body).map_err(SerializationError::from)?;
        self.command_ok(&format!("{} {}", verb, payload)).await
    }
}

#[async_trait]
impl<S> QueueServiceConnection for FaktoryConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn push(&mut self, job: &ServiceJob) -> Result<(), JobError> {
        self.command_json("PUSH", job).await
    }

    async fn fetch(&mut self, queues: &[String]) -> Result<Option<ServiceJob>, JobError> {
        let line = if queues.is_empty() {
            "FETCH".to_string()
        } else {
            format!("FETCH {}", queues.join(" "))
        };

        match self.command(&line).await?.into_bytes() {
            Some(bytes) if !bytes.is_empty() => {
                let job = serde_json::from_slice(&bytes).map_err(SerializationError::from)?;
                Ok(Some(job))
            }
            _ => Ok(None),
        }
    }

    async fn ack(&mut self, jid: &str) -> Result<(), JobError> {
        self.command_json("ACK", &serde_json::json!({ "jid": jid })).await
    }

    async fn fail(&mut self, failure: &JobFailure) -> Result<(), JobError> {
        self.command_json("FAIL", failure).await
    }

    async fn beat(&mut self) -> Result<HeartbeatState, JobError> {
        let wid = self.worker_id.clone().unwrap_or_default();
        let line = format!("BEAT {}", serde_json::json!({ "wid": wid }));

        match self.command(&line).await? {
            Reply::Simple(text) if text == "OK" => Ok(HeartbeatState::Running),
            reply => {
                let bytes = reply
                    .into_bytes()
                    .ok_or_else(|| protocol_error("empty heartbeat reply"))?;
                let beat: BeatReply =
                    serde_json::from_slice(&bytes).map_err(SerializationError::from)?;
                match beat.state.as_str() {
                    "quiet" => Ok(HeartbeatState::Quiet),
                    "terminate" => Ok(HeartbeatState::Terminate),
                    _ => Ok(HeartbeatState::Running),
                }
            }
        }
    }

    async fn track_progress(&mut self, update: &ProgressUpdate) -> Result<(), JobError> {
        self.command_json("TRACK SET", update).await
    }

    async fn open_batch(&mut self, bid: &str) -> Result<(), JobError> {
        // The server answers with the batch id or OK depending on version
        self.command(&format!("BATCH OPEN {}", bid)).await.map(|_| ())
    }

    async fn commit_batch(&mut self, bid: &str) -> Result<(), JobError> {
        self.command_ok(&format!("BATCH COMMIT {}", bid)).await
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.send("END").await {
            debug!(error = %e, "Failed to send END");
        }
        self.closed = true;
        let _ = self.stream.shutdown().await;
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Opens TCP connections to the server named by a `tcp://` URL
#[derive(Debug, Clone)]
pub struct FaktoryConnector {
    address: String,
    password: Option<String>,
    hostname: String,
    labels: Vec<String>,
    connect_timeout: Duration,
    operation_timeout: Duration,
}

impl FaktoryConnector {
    pub fn from_config(config: &QueueServiceConfig) -> Result<Self, JobError> {
        let url = config.parsed_url()?;
        let host = url.host_str().ok_or_else(|| ConfigurationError::Invalid {
            message: format!("url '{}' has no host", config.url),
        })?;
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let password = url.password().filter(|p| !p.is_empty()).map(str::to_string);

        Ok(Self {
            address: format!("{}:{}", host, port),
            password,
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            labels: config.worker.labels.clone(),
            connect_timeout: config.connect_timeout(),
            operation_timeout: config.operation_timeout(),
        })
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    fn hello(&self, worker_id: Option<&str>) -> ClientHello {
        ClientHello {
            hostname: self.hostname.clone(),
            wid: worker_id.map(str::to_string),
            pid: std::process::id(),
            labels: self.labels.clone(),
            v: PROTOCOL_VERSION,
            pwdhash: None,
        }
    }
}

#[async_trait]
impl QueueServiceConnector for FaktoryConnector {
    async fn connect(
        &self,
        worker_id: Option<&str>,
    ) -> Result<Box<dyn QueueServiceConnection>, JobError> {
        let connect_error = |message: String| JobError::Connect {
            address: self.address.clone(),
            message,
        };

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| connect_error(format!("timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| connect_error(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let handshake = FaktoryConnection::handshake(
            stream,
            self.hello(worker_id),
            self.password.as_deref(),
        );
        let connection = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| connect_error("handshake timed out".to_string()))??
            .with_operation_timeout(self.operation_timeout);

        debug!(address = %self.address, wid = ?worker_id, "Connected to queue service");
        Ok(Box::new(connection))
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}

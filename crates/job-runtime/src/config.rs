//! Backend kinds and configuration.
//!
//! Configuration is plain serde data. Loading it from files or the environment
//! is the caller's concern; the runtime only consumes and validates it.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Name of the queue/channel used when the configuration supplies no weights
pub const DEFAULT_PRIORITY_KEY: &str = "default";

/// Enumeration of supported broker families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Job server with direct push and server-side retries (Faktory protocol)
    QueueService,
    /// Topic/channel broker with lookup-based discovery (NSQ protocol)
    PubSub,
}

impl BackendKind {
    /// Check if the backend can associate jobs with batches
    pub fn supports_batches(&self) -> bool {
        match self {
            Self::QueueService => true,
            Self::PubSub => false,
        }
    }

    /// Check if the backend can record job progress
    pub fn supports_progress_tracking(&self) -> bool {
        match self {
            Self::QueueService => true,
            Self::PubSub => false,
        }
    }

    /// Check if the broker schedules `at` jobs itself rather than via deferred publish
    pub fn schedules_natively(&self) -> bool {
        match self {
            Self::QueueService => true,
            Self::PubSub => false,
        }
    }

    /// Check if terminally failed jobs are routed by the runtime (rather than the server)
    pub fn routes_dead_letters(&self) -> bool {
        match self {
            Self::QueueService => false,
            Self::PubSub => true,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueService => write!(f, "queue-service"),
            Self::PubSub => write!(f, "pub-sub"),
        }
    }
}

/// Backend selection plus its settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum BackendConfig {
    QueueService(QueueServiceConfig),
    PubSub(PubSubConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::QueueService(_) => BackendKind::QueueService,
            Self::PubSub(_) => BackendKind::PubSub,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self {
            Self::QueueService(config) => config.validate(),
            Self::PubSub(config) => config.validate(),
        }
    }
}

// ============================================================================
// Priority Weights
// ============================================================================

/// Default weight map: `{"default": 1}`
pub fn default_priorities() -> HashMap<String, i64> {
    HashMap::from([(DEFAULT_PRIORITY_KEY.to_string(), 1)])
}

/// Largest accepted priority weight
pub const MAX_PRIORITY_WEIGHT: i64 = 1000;

/// Look up a weight, treating missing and non-positive entries as 1.
///
/// Weights above [`MAX_PRIORITY_WEIGHT`] are clamped to it.
pub fn weight_for(priorities: &HashMap<String, i64>, name: &str) -> usize {
    match priorities.get(name) {
        Some(weight) if *weight > 0 => {
            usize::try_from((*weight).min(MAX_PRIORITY_WEIGHT)).unwrap_or(1)
        }
        _ => 1,
    }
}

/// Reject weights above [`MAX_PRIORITY_WEIGHT`]
fn validate_priorities(
    priorities: &HashMap<String, i64>,
    key: &str,
) -> Result<(), ConfigurationError> {
    match priorities
        .iter()
        .find(|(_, weight)| **weight > MAX_PRIORITY_WEIGHT)
    {
        Some((name, weight)) => Err(ConfigurationError::Invalid {
            message: format!(
                "{}.{} = {} exceeds the maximum weight {}",
                key, name, weight, MAX_PRIORITY_WEIGHT
            ),
        }),
        None => Ok(()),
    }
}

// ============================================================================
// Queue Service
// ============================================================================

/// Queue-service (Faktory-compatible) configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueServiceConfig {
    /// Server URL, e.g. `tcp://:password@localhost:7419`
    pub url: String,

    #[serde(default = "QueueServiceConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bound on one command round trip; must exceed the server's blocking FETCH
    #[serde(default = "QueueServiceConfig::default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    #[serde(default)]
    pub sender: QueueServiceSenderConfig,

    #[serde(default)]
    pub worker: QueueServiceWorkerConfig,
}

impl QueueServiceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            operation_timeout_ms: Self::default_operation_timeout_ms(),
            sender: QueueServiceSenderConfig::default(),
            worker: QueueServiceWorkerConfig::default(),
        }
    }

    fn default_connect_timeout_ms() -> u64 {
        5000
    }

    fn default_operation_timeout_ms() -> u64 {
        5000
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Parse and check the server URL
    pub fn parsed_url(&self) -> Result<Url, ConfigurationError> {
        if self.url.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "url".to_string(),
            });
        }

        let url = Url::parse(&self.url).map_err(|e| ConfigurationError::Invalid {
            message: format!("url '{}' is not a valid URL: {}", self.url, e),
        })?;

        match url.scheme() {
            "tcp" => {}
            "tcp+tls" => {
                return Err(ConfigurationError::Invalid {
                    message: "TLS connections (tcp+tls) are not supported".to_string(),
                })
            }
            other => {
                return Err(ConfigurationError::Invalid {
                    message: format!("url scheme '{}' is not supported, expected 'tcp'", other),
                })
            }
        }

        if url.host_str().is_none() {
            return Err(ConfigurationError::Invalid {
                message: format!("url '{}' has no host", self.url),
            });
        }

        Ok(url)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.parsed_url()?;

        if self.sender.pool_capacity == 0 {
            return Err(ConfigurationError::Invalid {
                message: "sender.pool_capacity must be at least 1".to_string(),
            });
        }

        if self.worker.concurrency == 0 {
            return Err(ConfigurationError::Invalid {
                message: "worker.concurrency must be at least 1".to_string(),
            });
        }

        if self.worker.heartbeat_interval_seconds == 0 {
            return Err(ConfigurationError::Invalid {
                message: "worker.heartbeat_interval_seconds must be at least 1".to_string(),
            });
        }

        if self.operation_timeout_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "operation_timeout_ms must be at least 1".to_string(),
            });
        }

        validate_priorities(&self.worker.priorities, "worker.priorities")
    }
}

/// Outbound connection pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueServiceSenderConfig {
    pub pool_capacity: usize,
    pub acquire_timeout_ms: u64,
}

impl QueueServiceSenderConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for QueueServiceSenderConfig {
    fn default() -> Self {
        Self {
            pool_capacity: 1,
            acquire_timeout_ms: 5000,
        }
    }
}

/// Worker manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueServiceWorkerConfig {
    /// Number of concurrent fetchers; the worker pool holds two more connections
    pub concurrency: usize,
    /// Queue name to weight, e.g. `{"critical": 3, "default": 2, "bulk": 1}`
    pub priorities: HashMap<String, i64>,
    pub heartbeat_interval_seconds: u64,
    pub shutdown_timeout_seconds: u64,
    pub labels: Vec<String>,
}

impl QueueServiceWorkerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    /// Size of the worker connection pool
    pub fn pool_size(&self) -> usize {
        self.concurrency.max(1) + 2
    }
}

impl Default for QueueServiceWorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            priorities: default_priorities(),
            heartbeat_interval_seconds: 15,
            shutdown_timeout_seconds: 30,
            labels: vec!["rust".to_string()],
        }
    }
}

// ============================================================================
// Pub/Sub
// ============================================================================

/// Pub/sub (NSQ-compatible) configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PubSubConfig {
    #[serde(default)]
    pub sender: PubSubSenderConfig,

    #[serde(default)]
    pub worker: PubSubWorkerConfig,
}

impl PubSubConfig {
    pub fn new(nsqd_addresses: Vec<String>, lookupd_addresses: Vec<String>) -> Self {
        Self {
            sender: PubSubSenderConfig {
                nsqd_addresses,
                ..Default::default()
            },
            worker: PubSubWorkerConfig {
                lookupd_addresses,
                ..Default::default()
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.sender.nsqd_addresses.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "sender.nsqd_addresses".to_string(),
            });
        }

        for address in &self.sender.nsqd_addresses {
            validate_host_port(address, "sender.nsqd_addresses")?;
        }

        if self.worker.max_in_flight == 0 {
            return Err(ConfigurationError::Invalid {
                message: "worker.max_in_flight must be at least 1".to_string(),
            });
        }

        if self.worker.max_requeue_delay_ms < self.worker.default_requeue_delay_ms {
            return Err(ConfigurationError::Invalid {
                message: "worker.max_requeue_delay_ms must not be below default_requeue_delay_ms"
                    .to_string(),
            });
        }

        validate_priorities(&self.worker.priorities, "worker.priorities")
    }
}

/// Producer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubSenderConfig {
    /// Broker TCP addresses, e.g. `["127.0.0.1:4150"]`
    pub nsqd_addresses: Vec<String>,
    pub dial_timeout_ms: u64,
    pub operation_timeout_ms: u64,
}

impl PubSubSenderConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for PubSubSenderConfig {
    fn default() -> Self {
        Self {
            nsqd_addresses: Vec::new(),
            dial_timeout_ms: 1000,
            operation_timeout_ms: 5000,
        }
    }
}

/// Consumer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubWorkerConfig {
    /// Lookup service HTTP addresses, e.g. `["127.0.0.1:4161"]`
    pub lookupd_addresses: Vec<String>,
    pub max_in_flight: u32,
    /// Channel name to concurrency weight
    pub priorities: HashMap<String, i64>,
    /// Deliveries beyond this many attempts go to the dead-letter topic
    pub max_attempts: u16,
    pub default_requeue_delay_ms: u64,
    pub max_requeue_delay_ms: u64,
    pub lookupd_poll_interval_seconds: u64,
    pub shutdown_timeout_seconds: u64,
}

impl PubSubWorkerConfig {
    pub fn concurrency_for(&self, channel: &str) -> usize {
        weight_for(&self.priorities, channel)
    }

    pub fn default_requeue_delay(&self) -> Duration {
        Duration::from_millis(self.default_requeue_delay_ms)
    }

    pub fn max_requeue_delay(&self) -> Duration {
        Duration::from_millis(self.max_requeue_delay_ms)
    }

    pub fn lookupd_poll_interval(&self) -> Duration {
        Duration::from_secs(self.lookupd_poll_interval_seconds.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

impl Default for PubSubWorkerConfig {
    fn default() -> Self {
        Self {
            lookupd_addresses: Vec::new(),
            max_in_flight: 50,
            priorities: default_priorities(),
            max_attempts: 5,
            default_requeue_delay_ms: 90_000,
            max_requeue_delay_ms: 900_000,
            lookupd_poll_interval_seconds: 60,
            shutdown_timeout_seconds: 30,
        }
    }
}

fn validate_host_port(address: &str, key: &str) -> Result<(), ConfigurationError> {
    let valid = match address.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    };

    if !valid {
        return Err(ConfigurationError::Invalid {
            message: format!("{} entry '{}' must be host:port", key, address),
        });
    }

    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

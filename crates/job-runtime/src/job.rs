//! Job model and core domain identifiers.

use crate::error::{JobError, SerializationError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Queue assigned to jobs created without an explicit queue
pub const DEFAULT_QUEUE: &str = "default";

/// Suffix appended to a topic to form its dead-letter topic
pub const DEAD_LETTER_SUFFIX: &str = "-dlq";

const EPHEMERAL_SUFFIX: &str = "#ephemeral";
const MAX_NAME_LENGTH: usize = 64;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

fn validate_name(field: &str, name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            message: format!("must be 1-{} characters", MAX_NAME_LENGTH),
        });
    }

    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    if base.is_empty()
        || !base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            message: "only ASCII alphanumeric, '.', '_' and '-' allowed, with an optional '#ephemeral' suffix".to_string(),
        });
    }

    Ok(())
}

/// Validated pub/sub topic name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicName(String);

impl TopicName {
    /// Create new topic name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_name("topic", &name)?;
        Ok(Self(name))
    }

    /// Topic that receives this topic's terminally failed jobs
    pub fn dead_letter(&self) -> Result<Self, ValidationError> {
        Self::new(format!("{}{}", self.0, DEAD_LETTER_SUFFIX))
    }

    pub fn is_dead_letter(&self) -> bool {
        self.0.ends_with(DEAD_LETTER_SUFFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TopicName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TopicName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Validated pub/sub channel name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelName(String);

impl ChannelName {
    /// Create new channel name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        validate_name("channel", &name)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChannelName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identifier of a delivered message or a pushed job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random identifier
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Build an identifier from raw broker bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

// ============================================================================
// Timestamps and Delays
// ============================================================================

/// Format a timestamp the way jobs carry it on the wire
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a wire timestamp; any RFC 3339 offset is accepted
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, JobError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| JobError::InvalidSchedule {
            value: value.to_string(),
            message: e.to_string(),
        })
}

/// Delay until `at`, with absent and past times meaning "now"
pub fn compute_delay(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    match at {
        Some(at) => (at - now).to_std().unwrap_or(Duration::ZERO),
        None => Duration::ZERO,
    }
}

// ============================================================================
// Job
// ============================================================================

/// Canonical unit of work exchanged with every backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub queue: String,

    #[serde(rename = "type")]
    pub job_type: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<Value>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub custom: HashMap<String, Value>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_as_none"
    )]
    pub at: Option<String>,
}

impl Job {
    /// Create a job on the default queue
    pub fn new(job_type: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            job_type: job_type.into(),
            args,
            custom: HashMap::new(),
            at: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom.insert(key.into(), value);
        self
    }

    /// Schedule the job for an absolute time
    pub fn with_at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(format_timestamp(at));
        self
    }

    /// Schedule the job relative to now
    pub fn with_delay(self, delay: chrono::Duration) -> Self {
        self.with_at(Utc::now() + delay)
    }

    /// Look up a custom value
    pub fn custom(&self, key: &str) -> Option<&Value> {
        self.custom.get(key)
    }

    /// Parsed schedule time, if any
    pub fn scheduled_at(&self) -> Result<Option<DateTime<Utc>>, JobError> {
        self.at.as_deref().map(parse_timestamp).transpose()
    }

    /// Delay before delivery relative to `now`
    pub fn delay_from(&self, now: DateTime<Utc>) -> Result<Duration, JobError> {
        Ok(compute_delay(self.scheduled_at()?, now))
    }

    /// Queue receiving this job once it has failed terminally
    pub fn dead_letter_queue(&self) -> String {
        format!("{}{}", self.queue, DEAD_LETTER_SUFFIX)
    }

    /// Check the invariants that must hold before publishing
    pub fn validate(&self) -> Result<(), JobError> {
        if self.queue.is_empty() {
            return Err(ValidationError::Required {
                field: "queue".to_string(),
            }
            .into());
        }

        self.scheduled_at()?;
        Ok(())
    }

    /// Serialize to the broker payload
    pub fn to_bytes(&self) -> Result<Bytes, JobError> {
        let bytes = serde_json::to_vec(self).map_err(SerializationError::from)?;
        Ok(Bytes::from(bytes))
    }

    /// Reconstruct a job from a broker payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, JobError> {
        let job = serde_json::from_slice(bytes).map_err(SerializationError::from)?;
        Ok(job)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;

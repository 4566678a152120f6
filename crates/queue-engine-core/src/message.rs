//! Message types and core domain identifiers.

use crate::error::ValidationError;
use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue identifier
///
/// Used as the persistence key suffix and as a file name by the filesystem
/// store, so only ASCII alphanumerics, hyphens, underscores and dots are
/// accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueId(String);

impl QueueId {
    /// Create new queue id with validation
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();

        if id.is_empty() || id.len() > 128 {
            return Err(ValidationError::OutOfRange {
                field: "queue_id".to_string(),
                message: "must be 1-128 characters".to_string(),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_id".to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores and dots allowed"
                    .to_string(),
            });
        }

        if id.starts_with('.') {
            return Err(ValidationError::InvalidFormat {
                field: "queue_id".to_string(),
                message: "must not start with a dot".to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Get queue id as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key under which this queue's snapshot is persisted
    pub fn storage_key(&self) -> String {
        format!("queue-{}", self.0)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for QueueId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueId> for String {
    fn from(id: QueueId) -> Self {
        id.0
    }
}

/// Identifier of a message, unique within one queue instance
///
/// Callers may assign their own ids to get idempotent enqueues; otherwise the
/// engine's [`IdGenerator`](crate::identity::IdGenerator) produces one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Create message id from caller input, rejecting empty ids
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Wrap an id produced by a trusted generator
    pub(crate) fn generated(id: String) -> Self {
        Self(id)
    }

    /// Get message id as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Borrow<str> for MessageId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current wall-clock time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Timestamp `delay` later than this one, clamped to the representable range
    pub fn saturating_add(&self, delay: Duration) -> Self {
        let delta = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
        Self(
            self.0
                .checked_add_signed(delta)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    /// Time elapsed from `earlier` to this timestamp, zero if `earlier` is later
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        (self.0 - earlier.0).to_std().unwrap_or(Duration::ZERO)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// Lifecycle state of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Eligible for dequeue
    Pending,
    /// Dequeued, awaiting complete or fail
    Processing,
    Completed,
    /// Retries exhausted with dead-lettering disabled
    Failed,
    /// Holding until `delay_until` elapses
    Delayed,
    DeadLetter,
}

impl MessageStatus {
    /// Check if no further automatic transition can happen from this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Get status name as used in snapshots
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounds every payload type must satisfy
///
/// Payloads are cloned when copies are handed out, moved into background
/// tasks, and serialized into snapshots.
pub trait Payload: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Payload for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A message and its processing metadata
///
/// The payload is owned by the message and never inspected by the engine.
/// Messages handed out by the engine are copies; mutating them has no effect
/// on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message<T> {
    pub id: MessageId,
    pub payload: T,
    pub status: MessageStatus,
    pub priority: i32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<Timestamp>,
    #[serde(default)]
    pub processing_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl<T> Message<T> {
    /// Create a message as enqueue would, Delayed when `delay_until` is set
    pub(crate) fn new(
        id: MessageId,
        payload: T,
        priority: i32,
        now: Timestamp,
        delay_until: Option<Timestamp>,
    ) -> Self {
        let status = if delay_until.is_some() {
            MessageStatus::Delayed
        } else {
            MessageStatus::Pending
        };

        Self {
            id,
            payload,
            status,
            priority,
            created_at: now,
            updated_at: now,
            delay_until,
            processing_started_at: None,
            processing_attempts: 0,
            failure_reason: None,
        }
    }

    /// Check if the message can be handed to a consumer
    pub fn is_pending(&self) -> bool {
        self.status == MessageStatus::Pending
    }

    /// Check if the message's delay has elapsed at `now`
    pub fn is_due(&self, now: Timestamp) -> bool {
        match self.delay_until {
            Some(until) => until <= now,
            None => true,
        }
    }
}

/// Options for a single enqueue call
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Higher values are dequeued first
    pub priority: i32,
    /// Hold the message back for this long; zero means no delay
    pub delay: Option<Duration>,
    /// Caller-assigned id; enqueueing an existing id is a no-op
    pub id: Option<MessageId>,
}

impl EnqueueOptions {
    /// Create new enqueue options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set message priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set delivery delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set caller-assigned message id
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    /// Delay that actually applies, `None` for absent or zero delays
    pub(crate) fn effective_delay(&self) -> Option<Duration> {
        self.delay.filter(|d| !d.is_zero())
    }
}

/// Result of an enqueue, distinguishing new messages from idempotent repeats
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued<T> {
    /// A new message was created and stored
    Created(Message<T>),
    /// A message with the requested id already existed and was left unchanged
    Existing(Message<T>),
}

impl<T> Enqueued<T> {
    /// Check if the enqueue created a new message
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    /// Borrow the message regardless of outcome
    pub fn message(&self) -> &Message<T> {
        match self {
            Self::Created(m) | Self::Existing(m) => m,
        }
    }

    /// Take the message regardless of outcome
    pub fn into_message(self) -> Message<T> {
        match self {
            Self::Created(m) | Self::Existing(m) => m,
        }
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

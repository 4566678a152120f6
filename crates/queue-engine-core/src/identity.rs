//! Message id generation.
//!
//! Ids only need to be unique within one queue instance's lifetime. They are
//! not cryptographically strong and must not be used as security tokens.

use crate::message::{MessageId, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use ulid::Ulid;

/// Produces ids for messages enqueued without a caller-assigned id
pub trait IdGenerator: Send + Sync {
    /// Generate a new id; `now` is the engine clock's current time
    fn generate(&self, now: Timestamp) -> MessageId;
}

/// ULID ids: a 48-bit millisecond timestamp followed by 80 random bits
///
/// The timestamp part comes from the engine clock, so ids sort by creation
/// time (within one millisecond the order is random).
#[derive(Debug, Clone, Copy, Default)]
pub struct UlidIdGenerator;

impl IdGenerator for UlidIdGenerator {
    fn generate(&self, now: Timestamp) -> MessageId {
        let ulid = Ulid::from_datetime(SystemTime::from(now.as_datetime()));
        MessageId::generated(ulid.to_string())
    }
}

/// Monotonic counter ids with a random per-generator suffix
///
/// Produces `{prefix}-{counter:012}-{suffix:08x}`. The counter guarantees
/// uniqueness within the generator, the suffix keeps ids from different
/// generators apart.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    counter: AtomicU64,
    suffix: u32,
}

impl SequentialIdGenerator {
    /// Create generator with the given prefix
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
            suffix: rand::random::<u32>(),
        }
    }
}

impl Default for SequentialIdGenerator {
    fn default() -> Self {
        Self::new("msg")
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn generate(&self, _now: Timestamp) -> MessageId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        MessageId::generated(format!("{}-{:012}-{:08x}", self.prefix, n, self.suffix))
    }
}

#[cfg(test)]
#[path = "identity_tests.rs"]
mod tests;

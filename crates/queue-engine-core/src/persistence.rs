//! # Persistence
//!
//! Whole-state snapshots of a queue saved through a pluggable key-value
//! backend.
//!
//! The engine never persists incrementally: a snapshot holds all three
//! collections and is written under `"queue-" + queue_id`. The JSON layout is
//!
//! ```json
//! {
//!   "messages": [ ... ],
//!   "delayedMessages": [ ... ],
//!   "deadLetterMessages": [ ... ],
//!   "queueId": "orders"
//! }
//! ```

use crate::adapters::{FilesystemStorage, InMemoryStorage};
use crate::config::{QueueOptions, StorageDriver};
use crate::error::{SnapshotError, StorageError};
use crate::message::{Message, QueueId};
use crate::observer::{Diagnostic, QueueObserver};
use crate::store::{Collection, MessageStore};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Core Trait
// ============================================================================

/// Key-value capability a storage backend must provide
///
/// Values are opaque strings; the engine stores JSON snapshots.
///
/// # Examples
///
/// ```
/// use queue_engine_core::adapters::InMemoryStorage;
/// use queue_engine_core::persistence::StorageBackend;
/// # tokio_test::block_on(async {
/// let storage = InMemoryStorage::new();
/// storage.save("queue-orders", "{}".to_string()).await?;
/// assert_eq!(storage.load("queue-orders").await?, Some("{}".to_string()));
/// # Ok::<(), queue_engine_core::StorageError>(())
/// # }).unwrap();
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store `value` under `key`, replacing any previous value
    async fn save(&self, key: &str, value: String) -> Result<(), StorageError>;

    /// Read the value under `key`, `None` if absent
    async fn load(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Remove the value under `key`; removing an absent key succeeds
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Remove every value this backend holds
    async fn clear(&self) -> Result<(), StorageError>;

    /// Driver this backend implements
    fn driver(&self) -> StorageDriver;
}

/// Build the backend selected by `options`
///
/// Drivers the host cannot provide are reported to the observer and replaced
/// by the volatile in-memory store.
pub fn storage_for_options(
    options: &QueueOptions,
    observer: &dyn QueueObserver,
) -> Arc<dyn StorageBackend> {
    if options.persistence_driver.parse::<StorageDriver>().is_err() {
        observer.on_diagnostic(&Diagnostic::CapabilityUnavailable {
            capability: format!("storage driver '{}'", options.persistence_driver),
            fallback: StorageDriver::Memory.to_string(),
        });
    }

    match options.storage_driver() {
        StorageDriver::Memory => Arc::new(InMemoryStorage::new()),
        StorageDriver::Filesystem => {
            Arc::new(FilesystemStorage::new(options.persistence_path.clone()))
        }
        unavailable @ (StorageDriver::LocalStorage | StorageDriver::IndexedDb) => {
            observer.on_diagnostic(&Diagnostic::CapabilityUnavailable {
                capability: format!("storage driver '{}'", unavailable),
                fallback: StorageDriver::Memory.to_string(),
            });
            Arc::new(InMemoryStorage::new())
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Serialized state of all three collections of one queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot<T> {
    /// Ready collection, in dequeue order
    pub messages: Vec<Message<T>>,
    pub delayed_messages: Vec<Message<T>>,
    pub dead_letter_messages: Vec<Message<T>>,
    pub queue_id: QueueId,
}

impl<T: Clone> Snapshot<T> {
    /// Copy the current contents of a store
    pub fn capture(queue_id: &QueueId, store: &MessageStore<T>) -> Self {
        Self {
            messages: store.messages(Collection::Ready),
            delayed_messages: store.messages(Collection::Delayed),
            dead_letter_messages: store.messages(Collection::DeadLetter),
            queue_id: queue_id.clone(),
        }
    }
}

impl<T> Snapshot<T> {
    /// Number of messages across all collections
    pub fn len(&self) -> usize {
        self.messages.len() + self.delayed_messages.len() + self.dead_letter_messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild a store, returning it with the number of duplicate ids dropped
    pub fn into_store(self) -> (MessageStore<T>, usize) {
        MessageStore::from_collections(
            self.messages,
            self.delayed_messages,
            self.dead_letter_messages,
        )
    }
}

impl<T: Serialize> Snapshot<T> {
    /// Encode as JSON
    pub fn encode(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl<T: DeserializeOwned> Snapshot<T> {
    /// Decode JSON and check it belongs to `expected`
    pub fn decode(raw: &str, expected: &QueueId) -> Result<Self, SnapshotError> {
        let snapshot: Self = serde_json::from_str(raw)?;
        if &snapshot.queue_id != expected {
            return Err(SnapshotError::QueueMismatch {
                expected: expected.to_string(),
                found: snapshot.queue_id.to_string(),
            });
        }

        Ok(snapshot)
    }
}

#[cfg(test)]
#[path = "persistence_tests.rs"]
mod tests;

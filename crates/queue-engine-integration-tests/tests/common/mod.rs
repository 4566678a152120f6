//! Common test utilities for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use queue_engine_core::adapters::InMemoryStorage;
use queue_engine_core::{
    Clock, CollectingObserver, IdGenerator, ManualClock, Payload, QueueEngine, QueueId,
    QueueOptions, SequentialIdGenerator, StorageBackend, StorageDriver, StorageError, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// Test Payloads
// ============================================================================

/// Typed payload used by the scenario tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub attempts_to_succeed: u32,
}

impl Job {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            attempts_to_succeed: 1,
        }
    }

    pub fn flaky(name: &str, attempts_to_succeed: u32) -> Self {
        Self {
            name: name.to_string(),
            attempts_to_succeed,
        }
    }
}

// ============================================================================
// Engine Fixtures
// ============================================================================

/// Fixed starting point so timestamps in assertions are stable
pub fn epoch() -> Timestamp {
    Timestamp::from_datetime(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
}

/// Engine wired to a manual clock and a collecting observer
pub struct TestQueue<T> {
    pub clock: Arc<ManualClock>,
    pub observer: Arc<CollectingObserver>,
    pub engine: QueueEngine<T>,
}

pub fn test_queue<T: Payload>(
    queue_id: &str,
    options: QueueOptions,
) -> TestQueue<T> {
    test_queue_with_storage(queue_id, options, None)
}

pub fn test_queue_with_storage<T: Payload>(
    queue_id: &str,
    options: QueueOptions,
    storage: Option<Arc<dyn StorageBackend>>,
) -> TestQueue<T> {
    let clock = Arc::new(ManualClock::starting_at(epoch()));
    let observer = Arc::new(CollectingObserver::new());
    let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIdGenerator::new(queue_id));

    let mut builder = QueueEngine::builder(QueueId::new(queue_id).unwrap())
        .options(options)
        .clock(clock.clone() as Arc<dyn Clock>)
        .id_generator(ids)
        .observer(observer.clone());
    if let Some(storage) = storage {
        builder = builder.storage(storage);
    }

    TestQueue {
        clock,
        observer,
        engine: builder.build().unwrap(),
    }
}

/// Default options: no persistence, delayed messages swept only on demand
pub fn manual_options() -> QueueOptions {
    QueueOptions::default()
}

// ============================================================================
// Storage Doubles
// ============================================================================

/// In-memory backend that counts the calls it receives
#[derive(Default)]
pub struct RecordingStorage {
    inner: InMemoryStorage,
    saves: AtomicUsize,
    loads: AtomicUsize,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for RecordingStorage {
    async fn save(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(key, value).await
    }

    async fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear().await
    }

    fn driver(&self) -> StorageDriver {
        StorageDriver::Memory
    }
}

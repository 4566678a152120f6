//! # Queue Engine Core
//!
//! Embeddable, single-process message queue engine.
//!
//! The engine layers priority ordering, delayed delivery, retries with
//! backoff, dead-lettering and idempotent enqueue on top of three ordered
//! collections, and can snapshot its whole state through a pluggable
//! key-value backend.
//!
//! ## Architecture
//!
//! - [`engine::QueueEngine`] owns the state and runs the optional background
//!   sweep and persistence tasks
//! - Time, id generation and diagnostics are injected through the
//!   [`clock::Clock`], [`identity::IdGenerator`] and
//!   [`observer::QueueObserver`] traits
//! - Storage backends implement [`persistence::StorageBackend`]; the memory
//!   and filesystem backends live in [`adapters`]
//! - [`broadcast::BroadcastingQueue`] decorates an engine to announce new
//!   messages on a [`broadcast::BroadcastChannel`]
//!
//! ## Usage
//!
//! ```rust
//! use queue_engine_core::{EnqueueOptions, MessageStatus, QueueEngine, QueueId, QueueOptions};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = QueueOptions::default().with_max_retries(1);
//! let queue = QueueEngine::new(QueueId::new("jobs")?, options)?;
//!
//! queue.enqueue(serde_json::json!({ "task": "resize" }), EnqueueOptions::new());
//!
//! let job = queue.dequeue().unwrap();
//! queue.fail(job.id.as_str(), Some("image too large"));
//!
//! let dead = queue.get_dead_letter_messages();
//! assert_eq!(dead[0].status, MessageStatus::DeadLetter);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

pub mod adapters;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod message;
pub mod observer;
pub mod ordering;
pub mod persistence;
pub mod retry;
pub mod store;

pub use broadcast::{BroadcastChannel, BroadcastingQueue, MessageHandler, Subscription};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{QueueOptions, StorageDriver};
pub use engine::{QueueEngine, QueueEngineBuilder};
pub use error::{
    ConfigurationError, PersistenceError, SnapshotError, StorageError, ValidationError,
};
pub use identity::{IdGenerator, SequentialIdGenerator, UlidIdGenerator};
pub use message::{
    EnqueueOptions, Enqueued, Message, MessageId, MessageStatus, Payload, QueueId, Timestamp,
};
pub use observer::{CollectingObserver, Diagnostic, QueueObserver, TracingObserver};
pub use persistence::{Snapshot, StorageBackend};
pub use retry::{FailureDisposition, RetryPolicy};
pub use store::QueueStats;

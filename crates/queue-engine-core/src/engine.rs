//! # Queue Engine
//!
//! The advanced queue: priority ordering, delayed delivery, retries with
//! backoff, dead-lettering, idempotent enqueue and snapshot persistence.
//!
//! Foreground operations are synchronous. State lives behind one mutex that
//! is shared with the background tasks:
//!
//! - a delayed-message sweep every `delayed_check_interval_ms` when
//!   `auto_check_delayed` is set
//! - a persistence task that restores the last snapshot once, then saves
//!   every `persistence_interval_ms`
//!
//! Background tasks are tokio tasks. They are aborted by
//! [`QueueEngine::dispose`] and when the engine is dropped. An engine built
//! outside a tokio runtime runs without them and reports
//! [`Diagnostic::CapabilityUnavailable`].
//!
//! The initial restore replaces the whole store when it completes, so
//! operations performed before [`QueueEngine::wait_restored`] resolves may be
//! lost.

use crate::clock::{Clock, SystemClock};
use crate::config::QueueOptions;
use crate::error::{ConfigurationError, PersistenceError, SnapshotError};
use crate::identity::{IdGenerator, UlidIdGenerator};
use crate::message::{EnqueueOptions, Enqueued, Message, MessageId, Payload, QueueId, Timestamp};
use crate::observer::{Diagnostic, QueueObserver, TracingObserver};
use crate::persistence::{storage_for_options, Snapshot, StorageBackend};
use crate::retry::{FailureDisposition, RetryPolicy};
use crate::store::{Collection, MessageStore, QueueStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`QueueEngine`]
///
/// Every collaborator has a default: wall-clock time, ULID ids, diagnostics
/// forwarded to `tracing`, and the storage backend selected by the options.
pub struct QueueEngineBuilder<T> {
    queue_id: QueueId,
    options: QueueOptions,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    observer: Option<Arc<dyn QueueObserver>>,
    storage: Option<Arc<dyn StorageBackend>>,
    _payload: std::marker::PhantomData<fn() -> T>,
}

impl<T: Payload> QueueEngineBuilder<T> {
    fn new(queue_id: QueueId) -> Self {
        Self {
            queue_id,
            options: QueueOptions::default(),
            clock: None,
            ids: None,
            observer: None,
            storage: None,
            _payload: std::marker::PhantomData,
        }
    }

    /// Set queue options
    pub fn options(mut self, options: QueueOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the generator used for messages enqueued without an id
    ///
    /// The generator must not repeat ids.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Set the diagnostic observer
    pub fn observer(mut self, observer: Arc<dyn QueueObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Use `storage` instead of the backend selected by
    /// `options.persistence_driver`
    ///
    /// An explicit backend enables [`QueueEngine::save_now`] and
    /// [`QueueEngine::restore`] even when `persistence_enabled` is false; the
    /// background persistence task still only runs when it is true.
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validate the options, then create the engine and start its background
    /// tasks
    pub fn build(self) -> Result<QueueEngine<T>, ConfigurationError> {
        self.options.validate()?;

        let observer: Arc<dyn QueueObserver> =
            self.observer.unwrap_or_else(|| Arc::new(TracingObserver));

        let storage = match self.storage {
            Some(storage) => Some(storage),
            None if self.options.persistence_enabled => {
                Some(storage_for_options(&self.options, observer.as_ref()))
            }
            None => None,
        };

        let (restored, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            policy: RetryPolicy::from_options(&self.options),
            queue_id: self.queue_id,
            options: self.options,
            store: Mutex::new(MessageStore::new()),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            ids: self.ids.unwrap_or_else(|| Arc::new(UlidIdGenerator)),
            observer,
            storage,
            disposed: AtomicBool::new(false),
            restored,
        });

        let tasks = start_background_tasks(&shared);

        info!(
            queue_id = %shared.queue_id,
            persistence = shared.options.persistence_enabled,
            auto_check_delayed = shared.options.auto_check_delayed,
            background_tasks = tasks.len(),
            "Queue engine started"
        );

        Ok(QueueEngine {
            shared,
            tasks: Mutex::new(tasks),
        })
    }
}

// ============================================================================
// Engine
// ============================================================================

struct Shared<T> {
    queue_id: QueueId,
    options: QueueOptions,
    policy: RetryPolicy,
    store: Mutex<MessageStore<T>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    observer: Arc<dyn QueueObserver>,
    storage: Option<Arc<dyn StorageBackend>>,
    disposed: AtomicBool,
    restored: watch::Sender<bool>,
}

impl<T: Payload> Shared<T> {
    fn store(&self) -> MutexGuard<'_, MessageStore<T>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now();
        let promoted = self.store().promote_due(now);
        if promoted > 0 {
            debug!(queue_id = %self.queue_id, promoted = promoted, "Promoted delayed messages");
        }
        promoted
    }

    async fn save_to(&self, storage: &dyn StorageBackend) -> Result<(), PersistenceError> {
        // Snapshot under the lock, write without it
        let encoded = {
            let store = self.store();
            Snapshot::capture(&self.queue_id, &store).encode()?
        };

        storage.save(&self.queue_id.storage_key(), encoded).await?;
        debug!(queue_id = %self.queue_id, "Saved queue snapshot");
        Ok(())
    }

    async fn restore_from(&self, storage: &dyn StorageBackend) -> Result<bool, PersistenceError> {
        let Some(raw) = storage.load(&self.queue_id.storage_key()).await? else {
            debug!(queue_id = %self.queue_id, "No stored snapshot");
            return Ok(false);
        };

        let snapshot: Snapshot<T> = match Snapshot::decode(&raw, &self.queue_id) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.report_malformed(&e);
                return Ok(false);
            }
        };

        let messages = snapshot.len();
        let (restored, duplicates) = snapshot.into_store();

        let promoted = {
            let mut store = self.store();
            // dispose clears under this lock; checking here keeps it cleared
            if self.is_disposed() {
                return Ok(false);
            }
            *store = restored;
            store.promote_due(self.clock.now())
        };

        if duplicates > 0 {
            warn!(
                queue_id = %self.queue_id,
                duplicates = duplicates,
                "Dropped duplicate message ids from snapshot"
            );
        }

        self.observer.on_diagnostic(&Diagnostic::SnapshotRestored {
            queue_id: self.queue_id.clone(),
            messages: messages - duplicates,
            promoted,
        });
        Ok(true)
    }

    fn report_malformed(&self, error: &SnapshotError) {
        self.observer.on_diagnostic(&Diagnostic::SnapshotMalformed {
            queue_id: self.queue_id.clone(),
            message: error.to_string(),
        });
    }

    fn mark_restored(&self) {
        self.restored.send_replace(true);
    }
}

/// Embeddable message queue engine
///
/// # Examples
///
/// ```
/// use queue_engine_core::{EnqueueOptions, QueueEngine, QueueId};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let queue = QueueEngine::builder(QueueId::new("orders")?).build()?;
///
/// queue.enqueue("low".to_string(), EnqueueOptions::new().with_priority(1));
/// queue.enqueue("high".to_string(), EnqueueOptions::new().with_priority(10));
///
/// let message = queue.dequeue().unwrap();
/// assert_eq!(message.payload, "high");
/// assert!(queue.complete(message.id.as_str()));
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
pub struct QueueEngine<T> {
    shared: Arc<Shared<T>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Payload> QueueEngine<T> {
    /// Start building an engine for `queue_id`
    pub fn builder(queue_id: QueueId) -> QueueEngineBuilder<T> {
        QueueEngineBuilder::new(queue_id)
    }

    /// Build an engine with default collaborators
    pub fn new(queue_id: QueueId, options: QueueOptions) -> Result<Self, ConfigurationError> {
        Self::builder(queue_id).options(options).build()
    }

    pub fn queue_id(&self) -> &QueueId {
        &self.shared.queue_id
    }

    pub fn options(&self) -> &QueueOptions {
        &self.shared.options
    }

    /// Check if [`QueueEngine::dispose`] has been called
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    // ------------------------------------------------------------------------
    // Producer side
    // ------------------------------------------------------------------------

    /// Add a message, or return the existing one if `options.id` is taken
    pub fn enqueue(&self, payload: T, options: EnqueueOptions) -> Message<T> {
        self.enqueue_with_outcome(payload, options).into_message()
    }

    /// Add a message, reporting whether it was created or already existed
    ///
    /// A repeated id leaves the stored message untouched and drops `payload`.
    pub fn enqueue_with_outcome(&self, payload: T, options: EnqueueOptions) -> Enqueued<T> {
        let now = self.shared.clock.now();
        let mut store = self.shared.store();

        if let Some(id) = &options.id {
            if let Some(existing) = store.get(id.as_str()) {
                debug!(
                    queue_id = %self.shared.queue_id,
                    message_id = %id,
                    "Message id already enqueued"
                );
                return Enqueued::Existing(existing.clone());
            }
        }

        let id = match options.id.clone() {
            Some(id) => id,
            None => self.generate_id(&store, now),
        };
        let delay_until = options.effective_delay().map(|d| now.saturating_add(d));
        let message = Message::new(id, payload, options.priority, now, delay_until);

        store.insert(message.clone());
        debug!(
            queue_id = %self.shared.queue_id,
            message_id = %message.id,
            priority = message.priority,
            status = %message.status,
            "Enqueued message"
        );

        Enqueued::Created(message)
    }

    fn generate_id(&self, store: &MessageStore<T>, now: Timestamp) -> MessageId {
        loop {
            let id = self.shared.ids.generate(now);
            if !store.contains(id.as_str()) {
                return id;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Consumer side
    // ------------------------------------------------------------------------

    /// Copy of the message [`QueueEngine::dequeue`] would return
    pub fn peek(&self) -> Option<Message<T>> {
        let now = self.shared.clock.now();
        let mut store = self.shared.store();
        store.promote_due(now);
        store.head_pending().cloned()
    }

    /// Take the highest-ranked Pending message and mark it Processing
    pub fn dequeue(&self) -> Option<Message<T>> {
        let now = self.shared.clock.now();
        let mut store = self.shared.store();
        store.promote_due(now);

        let message = store.dequeue(now)?;
        debug!(
            queue_id = %self.shared.queue_id,
            message_id = %message.id,
            "Dequeued message"
        );
        Some(message)
    }

    /// Mark a message Completed; false if the id is unknown
    pub fn complete(&self, id: &str) -> bool {
        let now = self.shared.clock.now();
        let completed = self.shared.store().complete(id, now);
        if completed {
            debug!(queue_id = %self.shared.queue_id, message_id = %id, "Completed message");
        }
        completed
    }

    /// Record a failed attempt; false if the id is unknown
    ///
    /// Below `max_retries` attempts the message is delayed for the retry
    /// delay. After that it is dead-lettered, or parked as Failed when
    /// dead-lettering is disabled.
    pub fn fail(&self, id: &str, reason: Option<&str>) -> bool {
        let now = self.shared.clock.now();
        let disposition = self.shared.store().fail(
            id,
            reason.map(str::to_string),
            now,
            &self.shared.policy,
            self.shared.options.dead_letter_enabled,
        );

        let Some(disposition) = disposition else {
            return false;
        };

        match disposition {
            FailureDisposition::Retry { delay } => debug!(
                queue_id = %self.shared.queue_id,
                message_id = %id,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Message failed; retry scheduled"
            ),
            FailureDisposition::DeadLetter => debug!(
                queue_id = %self.shared.queue_id,
                message_id = %id,
                "Message failed; moved to dead-letter"
            ),
            FailureDisposition::Park => debug!(
                queue_id = %self.shared.queue_id,
                message_id = %id,
                "Message failed; retries exhausted"
            ),
        }

        if self.shared.options.auto_check_delayed {
            self.shared.sweep();
        }
        true
    }

    // ------------------------------------------------------------------------
    // Management
    // ------------------------------------------------------------------------

    /// Copy of the message with `id` from any collection
    pub fn find_message_by_id(&self, id: &str) -> Option<Message<T>> {
        self.shared.store().get(id).cloned()
    }

    /// Remove a message that is still waiting in the delayed collection
    pub fn cancel_delayed(&self, id: &str) -> bool {
        let cancelled = self.shared.store().cancel_delayed(id).is_some();
        if cancelled {
            debug!(queue_id = %self.shared.queue_id, message_id = %id, "Cancelled delayed message");
        }
        cancelled
    }

    /// Move a dead-lettered message back to the ready collection as Pending
    /// with attempts and failure details reset
    pub fn retry_dead_letter(&self, id: &str) -> bool {
        let now = self.shared.clock.now();
        let retried = self.shared.store().retry_dead_letter(id, now);
        if retried {
            debug!(
                queue_id = %self.shared.queue_id,
                message_id = %id,
                "Retrying dead-lettered message"
            );
        }
        retried
    }

    /// Promote every delayed message whose wait has elapsed, returning how
    /// many moved
    pub fn check_delayed_messages(&self) -> usize {
        self.shared.sweep()
    }

    /// Drop Completed and Failed messages, returning how many were removed
    pub fn purge_finished(&self) -> usize {
        let purged = self.shared.store().purge_finished();
        debug!(queue_id = %self.shared.queue_id, purged = purged, "Purged finished messages");
        purged
    }

    /// Drop every message
    pub fn clear(&self) {
        self.shared.store().clear();
        debug!(queue_id = %self.shared.queue_id, "Cleared queue");
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn get_delayed_messages(&self) -> Vec<Message<T>> {
        self.shared.store().messages(Collection::Delayed)
    }

    pub fn get_dead_letter_messages(&self) -> Vec<Message<T>> {
        self.shared.store().messages(Collection::DeadLetter)
    }

    /// Copies of every message: ready, then delayed, then dead-letter
    pub fn get_all_messages(&self) -> Vec<Message<T>> {
        let store = self.shared.store();
        let mut messages = Vec::with_capacity(store.len());
        for collection in Collection::ALL {
            messages.extend(store.iter(collection).cloned());
        }
        messages
    }

    /// Copies of the Pending messages in dequeue order
    pub fn to_array(&self) -> Vec<Message<T>> {
        self.shared.store().pending_messages()
    }

    /// Number of Pending messages
    pub fn size(&self) -> usize {
        self.shared.store().pending_count()
    }

    /// Number of messages in all three collections
    pub fn total_size(&self) -> usize {
        self.shared.store().len()
    }

    /// Check if no message is Pending
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn stats(&self) -> QueueStats {
        self.shared.store().stats()
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Write a snapshot now
    pub async fn save_now(&self) -> Result<(), PersistenceError> {
        let storage = self.storage()?;
        self.shared.save_to(storage.as_ref()).await
    }

    /// Replace the current state with the stored snapshot
    ///
    /// Returns `Ok(false)` when nothing usable is stored; a malformed snapshot
    /// is reported to the observer and ignored.
    pub async fn restore(&self) -> Result<bool, PersistenceError> {
        let storage = self.storage()?;
        self.shared.restore_from(storage.as_ref()).await
    }

    /// Wait until the initial background restore has finished
    ///
    /// Resolves immediately when persistence is disabled, when no runtime
    /// was available, or after [`QueueEngine::dispose`].
    pub async fn wait_restored(&self) {
        let mut restored = self.shared.restored.subscribe();
        // The sender lives in `shared`, which `self` keeps alive
        let _ = restored.wait_for(|done| *done).await;
    }

    /// Report a diagnostic through this engine's observer
    pub(crate) fn report(&self, diagnostic: &Diagnostic) {
        self.shared.observer.on_diagnostic(diagnostic);
    }

    fn storage(&self) -> Result<Arc<dyn StorageBackend>, PersistenceError> {
        self.shared
            .storage
            .clone()
            .ok_or_else(|| PersistenceError::NotConfigured {
                queue_id: self.shared.queue_id.to_string(),
            })
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Stop background tasks and drop every message
    ///
    /// Calling it again is a no-op.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.abort_tasks();
        self.shared.store().clear();
        self.shared.mark_restored();

        info!(queue_id = %self.shared.queue_id, "Queue engine disposed");
    }

    fn abort_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }
}

impl<T> Drop for QueueEngine<T> {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

// ============================================================================
// Background Tasks
// ============================================================================

fn start_background_tasks<T: Payload>(shared: &Arc<Shared<T>>) -> Vec<JoinHandle<()>> {
    let persistence = shared
        .storage
        .clone()
        .filter(|_| shared.options.persistence_enabled);
    let sweep = shared.options.auto_check_delayed;

    if persistence.is_none() && !sweep {
        shared.mark_restored();
        return Vec::new();
    }

    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            shared.observer.on_diagnostic(&Diagnostic::CapabilityUnavailable {
                capability: "tokio runtime for background tasks".to_string(),
                fallback: "manual check_delayed_messages and save_now".to_string(),
            });
            shared.mark_restored();
            return Vec::new();
        }
    };

    let mut tasks = Vec::new();

    match persistence {
        Some(storage) => tasks.push(handle.spawn(run_persistence(Arc::clone(shared), storage))),
        None => shared.mark_restored(),
    }

    if sweep {
        tasks.push(handle.spawn(run_delayed_sweep(Arc::clone(shared))));
    }

    tasks
}

async fn run_persistence<T: Payload>(shared: Arc<Shared<T>>, storage: Arc<dyn StorageBackend>) {
    if let Err(e) = shared.restore_from(storage.as_ref()).await {
        shared.observer.on_diagnostic(&Diagnostic::PersistenceLoadFailed {
            queue_id: shared.queue_id.clone(),
            message: e.to_string(),
        });
    }
    shared.mark_restored();

    let mut interval = tokio::time::interval(shared.options.persistence_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        if shared.is_disposed() {
            break;
        }

        if let Err(e) = shared.save_to(storage.as_ref()).await {
            shared.observer.on_diagnostic(&Diagnostic::PersistenceSaveFailed {
                queue_id: shared.queue_id.clone(),
                message: e.to_string(),
            });
        }
    }
}

async fn run_delayed_sweep<T: Payload>(shared: Arc<Shared<T>>) {
    let mut interval = tokio::time::interval(shared.options.delayed_check_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        interval.tick().await;
        if shared.is_disposed() {
            break;
        }
        shared.sweep();
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

//! Tests for the queue engine.

use super::*;
use crate::adapters::InMemoryStorage;
use crate::clock::ManualClock;
use crate::config::StorageDriver;
use crate::error::StorageError;
use crate::identity::SequentialIdGenerator;
use crate::message::MessageStatus;
use crate::observer::CollectingObserver;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

// ============================================================================
// Test Helpers
// ============================================================================

struct Harness {
    clock: Arc<ManualClock>,
    observer: Arc<CollectingObserver>,
    engine: QueueEngine<String>,
}

fn queue_id() -> QueueId {
    QueueId::new("orders").unwrap()
}

fn harness(options: QueueOptions) -> Harness {
    harness_with(options, |builder| builder)
}

fn harness_with(
    options: QueueOptions,
    configure: impl FnOnce(QueueEngineBuilder<String>) -> QueueEngineBuilder<String>,
) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let observer = Arc::new(CollectingObserver::new());
    let builder = QueueEngine::builder(queue_id())
        .options(options)
        .clock(clock.clone())
        .observer(observer.clone())
        .id_generator(Arc::new(SequentialIdGenerator::default()));
    let engine = configure(builder).build().unwrap();

    Harness {
        clock,
        observer,
        engine,
    }
}

fn opts() -> EnqueueOptions {
    EnqueueOptions::new()
}

fn with_id(id: &str) -> EnqueueOptions {
    EnqueueOptions::new().with_id(MessageId::new(id).unwrap())
}

fn payloads(messages: &[Message<String>]) -> Vec<&str> {
    messages.iter().map(|m| m.payload.as_str()).collect()
}

/// Storage backend whose every operation fails
struct FailingStorage;

#[async_trait]
impl StorageBackend for FailingStorage {
    async fn save(&self, key: &str, _value: String) -> Result<(), StorageError> {
        Err(StorageError::Io {
            key: key.to_string(),
            message: "disk full".to_string(),
        })
    }

    async fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        Err(StorageError::Io {
            key: key.to_string(),
            message: "permission denied".to_string(),
        })
    }

    async fn delete(&self, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn driver(&self) -> StorageDriver {
        StorageDriver::Filesystem
    }
}

// ============================================================================
// Ordering Tests
// ============================================================================

mod ordering {
    use super::*;

    #[test]
    fn test_dequeue_by_priority() {
        let h = harness(QueueOptions::default());

        h.engine.enqueue("p1".into(), opts().with_priority(1));
        h.engine.enqueue("p10".into(), opts().with_priority(10));
        h.engine.enqueue("p5".into(), opts().with_priority(5));

        let order: Vec<String> = std::iter::from_fn(|| h.engine.dequeue())
            .map(|m| m.payload)
            .collect();
        assert_eq!(order, vec!["p10", "p5", "p1"]);
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        let h = harness(QueueOptions::default());

        h.engine.enqueue("first".into(), opts());
        h.clock.advance(Duration::from_millis(1));
        h.engine.enqueue("second".into(), opts());
        // Same timestamp as "second": insertion order breaks the tie
        h.engine.enqueue("third".into(), opts());

        assert_eq!(
            payloads(&h.engine.to_array()),
            vec!["first", "second", "third"]
        );
        assert_eq!(h.engine.dequeue().unwrap().payload, "first");
    }

    #[test]
    fn test_negative_priority_sorts_last() {
        let h = harness(QueueOptions::default());

        h.engine.enqueue("low".into(), opts().with_priority(-5));
        h.engine.enqueue("default".into(), opts());

        assert_eq!(h.engine.peek().unwrap().payload, "default");
    }
}

// ============================================================================
// Enqueue / Dequeue Tests
// ============================================================================

mod enqueue_dequeue {
    use super::*;

    #[test]
    fn test_enqueue_creates_pending_message() {
        let h = harness(QueueOptions::default());

        let message = h.engine.enqueue("hello".into(), opts().with_priority(3));

        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.priority, 3);
        assert_eq!(message.processing_attempts, 0);
        assert_eq!(message.created_at, h.clock.now());
        assert_eq!(message.updated_at, h.clock.now());
        assert!(message.delay_until.is_none());
        assert_eq!(h.engine.size(), 1);
        assert!(!h.engine.is_empty());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let h = harness(QueueOptions::default());

        let a = h.engine.enqueue("a".into(), opts());
        let b = h.engine.enqueue("b".into(), opts());

        assert_ne!(a.id, b.id);
        assert_eq!(h.engine.total_size(), 2);
    }

    #[test]
    fn test_duplicate_id_returns_existing_message() {
        let h = harness(QueueOptions::default());

        let first = h.engine.enqueue("first".into(), with_id("order-1"));
        h.clock.advance(Duration::from_millis(5));
        let outcome = h
            .engine
            .enqueue_with_outcome("second".into(), with_id("order-1").with_priority(9));

        assert!(!outcome.is_created());
        assert_eq!(outcome.message(), &first);
        assert_eq!(outcome.message().payload, "first");
        assert_eq!(h.engine.total_size(), 1);
    }

    #[test]
    fn test_duplicate_id_does_not_touch_processing_message() {
        let h = harness(QueueOptions::default());

        h.engine.enqueue("job".into(), with_id("job-1"));
        h.engine.dequeue().unwrap();

        let repeat = h.engine.enqueue("job".into(), with_id("job-1"));
        assert_eq!(repeat.status, MessageStatus::Processing);
        assert!(h.engine.dequeue().is_none());
    }

    #[test]
    fn test_dequeue_marks_processing_once() {
        let h = harness(QueueOptions::default());
        h.engine.enqueue("only".into(), opts());

        h.clock.advance(Duration::from_millis(7));
        let message = h.engine.dequeue().unwrap();

        assert_eq!(message.status, MessageStatus::Processing);
        assert_eq!(message.processing_started_at, Some(h.clock.now()));
        assert_eq!(message.updated_at, h.clock.now());
        assert!(h.engine.dequeue().is_none());
        assert_eq!(h.engine.size(), 0);
        assert_eq!(h.engine.total_size(), 1);
    }

    #[test]
    fn test_peek_does_not_mutate() {
        let h = harness(QueueOptions::default());
        h.engine.enqueue("a".into(), opts());

        let first = h.engine.peek().unwrap();
        let second = h.engine.peek().unwrap();

        assert_eq!(first, second);
        assert_eq!(first.status, MessageStatus::Pending);
        assert_eq!(h.engine.size(), 1);
    }

    #[test]
    fn test_empty_queue() {
        let h = harness(QueueOptions::default());

        assert!(h.engine.peek().is_none());
        assert!(h.engine.dequeue().is_none());
        assert!(h.engine.is_empty());
        assert_eq!(h.engine.total_size(), 0);
    }

    #[test]
    fn test_returned_messages_are_copies() {
        let h = harness(QueueOptions::default());
        let mut message = h.engine.enqueue("original".into(), opts());

        message.payload = "changed".into();
        message.priority = 100;

        let stored = h.engine.find_message_by_id(message.id.as_str()).unwrap();
        assert_eq!(stored.payload, "original");
        assert_eq!(stored.priority, 0);
    }
}

// ============================================================================
// Delay Tests
// ============================================================================

mod delays {
    use super::*;

    #[test]
    fn test_delayed_message_becomes_visible_after_delay() {
        let h = harness(QueueOptions::default());

        let message = h
            .engine
            .enqueue("later".into(), opts().with_delay(Duration::from_millis(100)));
        assert_eq!(message.status, MessageStatus::Delayed);
        assert_eq!(
            message.delay_until,
            Some(h.clock.now().saturating_add(Duration::from_millis(100)))
        );
        assert_eq!(h.engine.size(), 0);

        h.clock.advance(Duration::from_millis(50));
        assert_eq!(h.engine.check_delayed_messages(), 0);
        assert_eq!(h.engine.size(), 0);

        h.clock.advance(Duration::from_millis(60));
        assert_eq!(h.engine.check_delayed_messages(), 1);
        assert_eq!(h.engine.size(), 1);

        let promoted = h.engine.find_message_by_id(message.id.as_str()).unwrap();
        assert_eq!(promoted.status, MessageStatus::Pending);
        assert!(promoted.delay_until.is_none());
        assert_eq!(promoted.updated_at, h.clock.now());
    }

    #[test]
    fn test_delay_elapses_exactly_at_deadline() {
        let h = harness(QueueOptions::default());

        h.engine
            .enqueue("later".into(), opts().with_delay(Duration::from_millis(100)));
        h.clock.advance(Duration::from_millis(100));

        assert_eq!(h.engine.check_delayed_messages(), 1);
    }

    #[test]
    fn test_zero_delay_is_pending() {
        let h = harness(QueueOptions::default());

        let message = h.engine.enqueue("now".into(), opts().with_delay(Duration::ZERO));

        assert_eq!(message.status, MessageStatus::Pending);
        assert!(message.delay_until.is_none());
        assert_eq!(h.engine.size(), 1);
    }

    #[test]
    fn test_dequeue_sweeps_first() {
        let h = harness(QueueOptions::default());

        h.engine.enqueue(
            "urgent-later".into(),
            opts().with_priority(10).with_delay(Duration::from_millis(10)),
        );
        h.engine.enqueue("normal".into(), opts());
        h.clock.advance(Duration::from_millis(10));

        assert_eq!(h.engine.peek().unwrap().payload, "urgent-later");
        assert_eq!(h.engine.dequeue().unwrap().payload, "urgent-later");
    }

    #[test]
    fn test_delayed_listing_order() {
        let h = harness(QueueOptions::default());

        h.engine
            .enqueue("late".into(), opts().with_delay(Duration::from_millis(300)));
        h.engine
            .enqueue("early".into(), opts().with_delay(Duration::from_millis(100)));
        h.engine.enqueue(
            "early-high".into(),
            opts().with_priority(5).with_delay(Duration::from_millis(100)),
        );

        assert_eq!(
            payloads(&h.engine.get_delayed_messages()),
            vec!["early-high", "early", "late"]
        );
    }

    #[test]
    fn test_completed_delayed_message_is_not_promoted() {
        let h = harness(QueueOptions::default());
        let message = h
            .engine
            .enqueue("early".into(), opts().with_delay(Duration::from_secs(100)));

        assert!(h.engine.complete(message.id.as_str()));
        assert_eq!(h.engine.check_delayed_messages(), 0);
        assert_eq!(h.engine.get_delayed_messages().len(), 1);

        h.clock.advance(Duration::from_secs(200));
        assert_eq!(h.engine.check_delayed_messages(), 0);
        assert!(h.engine.dequeue().is_none());
        assert_eq!(
            h.engine.get_delayed_messages()[0].status,
            MessageStatus::Completed
        );
    }

    #[test]
    fn test_cancel_delayed() {
        let h = harness(QueueOptions::default());

        let waiting = h
            .engine
            .enqueue("waiting".into(), opts().with_delay(Duration::from_millis(100)));
        let promoted = h
            .engine
            .enqueue("promoted".into(), opts().with_delay(Duration::from_millis(10)));
        let ready = h.engine.enqueue("ready".into(), opts());

        h.clock.advance(Duration::from_millis(20));
        h.engine.check_delayed_messages();

        assert!(h.engine.cancel_delayed(waiting.id.as_str()));
        assert!(!h.engine.cancel_delayed(waiting.id.as_str()));
        assert!(!h.engine.cancel_delayed(promoted.id.as_str()));
        assert!(!h.engine.cancel_delayed(ready.id.as_str()));
        assert!(!h.engine.cancel_delayed("missing"));
        assert_eq!(h.engine.total_size(), 2);
        assert!(h.engine.find_message_by_id(waiting.id.as_str()).is_none());
    }

    #[test]
    fn test_no_runtime_reports_unavailable_but_fail_still_sweeps() {
        let h = harness(
            QueueOptions::default()
                .with_retry_delay(Duration::ZERO)
                .with_auto_check_delayed(Duration::from_millis(100)),
        );

        assert_eq!(
            h.observer
                .count(|d| matches!(d, Diagnostic::CapabilityUnavailable { .. })),
            1
        );

        h.engine.enqueue("job".into(), opts());
        let message = h.engine.dequeue().unwrap();
        assert!(h.engine.fail(message.id.as_str(), Some("flaky")));

        let retried = h.engine.find_message_by_id(message.id.as_str()).unwrap();
        assert_eq!(retried.status, MessageStatus::Pending);
        assert_eq!(retried.processing_attempts, 1);
        assert_eq!(h.engine.size(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_promotes_due_messages() {
        let h = harness(
            QueueOptions::default().with_auto_check_delayed(Duration::from_millis(100)),
        );

        h.engine
            .enqueue("later".into(), opts().with_delay(Duration::from_millis(100)));
        h.clock.advance(Duration::from_millis(110));

        // Let the sweep task tick without touching the queue
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(h.engine.get_delayed_messages().len(), 0);
        assert_eq!(h.engine.size(), 1);
        assert_eq!(
            h.observer
                .count(|d| matches!(d, Diagnostic::CapabilityUnavailable { .. })),
            0
        );
    }
}

// ============================================================================
// Retry and Dead-Letter Tests
// ============================================================================

mod retries {
    use super::*;

    fn dequeue_and_fail(h: &Harness, reason: &str) -> Message<String> {
        let message = h.engine.dequeue().expect("message should be pending");
        assert!(h.engine.fail(message.id.as_str(), Some(reason)));
        h.engine.find_message_by_id(message.id.as_str()).unwrap()
    }

    #[test]
    fn test_three_failures_dead_letter() {
        let h = harness(QueueOptions::default());
        h.engine.enqueue("job".into(), opts());

        let after_one = dequeue_and_fail(&h, "first");
        assert_eq!(after_one.status, MessageStatus::Delayed);
        assert_eq!(after_one.processing_attempts, 1);
        assert_eq!(after_one.failure_reason.as_deref(), Some("first"));
        assert_eq!(
            after_one.delay_until,
            Some(h.clock.now().saturating_add(Duration::from_millis(1000)))
        );

        h.clock.advance(Duration::from_millis(1000));
        let after_two = dequeue_and_fail(&h, "second");
        assert_eq!(after_two.status, MessageStatus::Delayed);
        assert_eq!(after_two.processing_attempts, 2);

        h.clock.advance(Duration::from_millis(1000));
        let after_three = dequeue_and_fail(&h, "third");
        assert_eq!(after_three.status, MessageStatus::DeadLetter);
        assert_eq!(after_three.processing_attempts, 3);
        assert_eq!(after_three.failure_reason.as_deref(), Some("third"));

        assert_eq!(h.engine.get_dead_letter_messages().len(), 1);
        assert_eq!(h.engine.size(), 0);
        assert_eq!(h.engine.total_size(), 1);
    }

    #[test]
    fn test_two_failures_with_max_two() {
        let h = harness(QueueOptions::default().with_max_retries(2));
        h.engine.enqueue("job".into(), opts());

        let failed = dequeue_and_fail(&h, "boom");
        assert_eq!(failed.status, MessageStatus::Delayed);

        h.clock.advance(Duration::from_millis(1000));
        assert_eq!(h.engine.check_delayed_messages(), 1);
        let pending = h.engine.find_message_by_id(failed.id.as_str()).unwrap();
        assert_eq!(pending.status, MessageStatus::Pending);
        assert_eq!(pending.processing_attempts, 1);

        let dead = dequeue_and_fail(&h, "boom again");
        assert_eq!(dead.status, MessageStatus::DeadLetter);
        assert_eq!(dead.processing_attempts, 2);
    }

    #[test]
    fn test_retry_not_visible_before_delay() {
        let h = harness(QueueOptions::default());
        h.engine.enqueue("job".into(), opts());

        dequeue_and_fail(&h, "boom");
        h.clock.advance(Duration::from_millis(999));

        assert!(h.engine.dequeue().is_none());
    }

    #[test]
    fn test_exponential_backoff() {
        let h = harness(
            QueueOptions::default()
                .with_max_retries(5)
                .with_backoff(2.0, Duration::from_millis(3000)),
        );
        h.engine.enqueue("job".into(), opts());

        let expected = [1000, 2000, 3000, 3000];
        for delay_ms in expected {
            let failed = dequeue_and_fail(&h, "boom");
            assert_eq!(
                failed.delay_until,
                Some(h.clock.now().saturating_add(Duration::from_millis(delay_ms)))
            );
            h.clock.advance(Duration::from_millis(delay_ms));
        }
    }

    #[test]
    fn test_exhausted_without_dead_letter_parks_failed() {
        let h = harness(
            QueueOptions::default()
                .with_max_retries(1)
                .with_dead_letter(false),
        );
        h.engine.enqueue("job".into(), opts());

        let parked = dequeue_and_fail(&h, "fatal");

        assert_eq!(parked.status, MessageStatus::Failed);
        assert_eq!(parked.processing_attempts, 1);
        assert!(h.engine.get_dead_letter_messages().is_empty());
        assert_eq!(h.engine.size(), 0);
        assert_eq!(h.engine.total_size(), 1);
        assert!(h.engine.dequeue().is_none());

        assert_eq!(h.engine.purge_finished(), 1);
        assert_eq!(h.engine.total_size(), 0);
    }

    #[test]
    fn test_fail_unknown_id() {
        let h = harness(QueueOptions::default());
        assert!(!h.engine.fail("missing", None));
    }

    #[test]
    fn test_fail_without_reason_clears_previous_reason() {
        let h = harness(QueueOptions::default());
        h.engine.enqueue("job".into(), opts());

        dequeue_and_fail(&h, "boom");
        h.clock.advance(Duration::from_millis(1000));
        let message = h.engine.dequeue().unwrap();
        h.engine.fail(message.id.as_str(), None);

        let stored = h.engine.find_message_by_id(message.id.as_str()).unwrap();
        assert!(stored.failure_reason.is_none());
        assert_eq!(stored.processing_attempts, 2);
    }

    #[test]
    fn test_retry_dead_letter_resets_metadata() {
        let h = harness(QueueOptions::default().with_max_retries(1));
        h.engine.enqueue("job".into(), opts());
        let dead = dequeue_and_fail(&h, "fatal");
        assert_eq!(dead.status, MessageStatus::DeadLetter);

        h.clock.advance(Duration::from_millis(5));
        assert!(h.engine.retry_dead_letter(dead.id.as_str()));

        let revived = h.engine.find_message_by_id(dead.id.as_str()).unwrap();
        assert_eq!(revived.status, MessageStatus::Pending);
        assert_eq!(revived.processing_attempts, 0);
        assert!(revived.failure_reason.is_none());
        assert!(revived.delay_until.is_none());
        assert!(revived.processing_started_at.is_none());
        assert_eq!(revived.updated_at, h.clock.now());
        assert!(h.engine.get_dead_letter_messages().is_empty());
        assert_eq!(h.engine.size(), 1);
    }

    #[test]
    fn test_retry_dead_letter_rejects_other_collections() {
        let h = harness(QueueOptions::default());
        let ready = h.engine.enqueue("ready".into(), opts());

        assert!(!h.engine.retry_dead_letter(ready.id.as_str()));
        assert!(!h.engine.retry_dead_letter("missing"));
    }
}

// ============================================================================
// Management and Inspection Tests
// ============================================================================

mod management {
    use super::*;

    #[test]
    fn test_complete() {
        let h = harness(QueueOptions::default());
        h.engine.enqueue("job".into(), opts());
        let message = h.engine.dequeue().unwrap();

        h.clock.advance(Duration::from_millis(3));
        assert!(h.engine.complete(message.id.as_str()));

        let done = h.engine.find_message_by_id(message.id.as_str()).unwrap();
        assert_eq!(done.status, MessageStatus::Completed);
        assert_eq!(done.updated_at, h.clock.now());
        assert_eq!(h.engine.total_size(), 1);
        assert!(!h.engine.complete("missing"));
    }

    #[test]
    fn test_find_message_by_id_in_every_collection() {
        let h = harness(QueueOptions::default().with_max_retries(1));

        let ready = h.engine.enqueue("ready".into(), opts().with_priority(1));
        let delayed = h
            .engine
            .enqueue("delayed".into(), opts().with_delay(Duration::from_secs(1)));
        h.engine.enqueue("dead".into(), with_id("dead-1"));
        h.engine.dequeue();
        let dead = h.engine.dequeue().unwrap();
        h.engine.fail(dead.id.as_str(), None);

        assert!(h.engine.find_message_by_id(ready.id.as_str()).is_some());
        assert!(h.engine.find_message_by_id(delayed.id.as_str()).is_some());
        assert_eq!(
            h.engine.find_message_by_id("dead-1").unwrap().status,
            MessageStatus::DeadLetter
        );
        assert!(h.engine.find_message_by_id("missing").is_none());
    }

    #[test]
    fn test_listings_and_stats() {
        let h = harness(QueueOptions::default().with_max_retries(1));

        h.engine.enqueue("dead".into(), opts().with_priority(9));
        let dead = h.engine.dequeue().unwrap();
        h.engine.fail(dead.id.as_str(), None);

        h.engine.enqueue("done".into(), opts().with_priority(8));
        let done = h.engine.dequeue().unwrap();
        h.engine.complete(done.id.as_str());

        h.engine.enqueue("working".into(), opts().with_priority(7));
        h.engine.dequeue().unwrap();

        h.engine.enqueue("b".into(), opts().with_priority(1));
        h.engine.enqueue("a".into(), opts().with_priority(2));
        h.engine
            .enqueue("later".into(), opts().with_delay(Duration::from_secs(1)));

        assert_eq!(payloads(&h.engine.to_array()), vec!["a", "b"]);
        assert_eq!(
            payloads(&h.engine.get_all_messages()),
            vec!["done", "working", "a", "b", "later", "dead"]
        );

        let stats = h.engine.stats();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.ready_collection, 4);
        assert_eq!(stats.delayed_collection, 1);
        assert_eq!(stats.dead_letter_collection, 1);
        assert_eq!(stats.total(), h.engine.total_size());
        assert_eq!(h.engine.size(), 2);
    }

    #[test]
    fn test_clear() {
        let h = harness(QueueOptions::default());

        h.engine.enqueue("a".into(), opts());
        h.engine
            .enqueue("b".into(), opts().with_delay(Duration::from_secs(1)));
        h.engine.clear();

        assert_eq!(h.engine.total_size(), 0);
        assert!(h.engine.get_all_messages().is_empty());

        // Ids are free again after a clear
        let again = h.engine.enqueue_with_outcome("a".into(), with_id("a-1"));
        assert!(again.is_created());
    }

    #[test]
    fn test_purge_finished_keeps_live_messages() {
        let h = harness(QueueOptions::default());

        h.engine.enqueue("done".into(), opts().with_priority(1));
        let done = h.engine.dequeue().unwrap();
        h.engine.complete(done.id.as_str());
        h.engine.enqueue("pending".into(), opts());

        assert_eq!(h.engine.purge_finished(), 1);
        assert_eq!(payloads(&h.engine.get_all_messages()), vec!["pending"]);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let result = QueueEngine::<String>::new(
            queue_id(),
            QueueOptions::default().with_backoff(0.5, Duration::from_secs(1)),
        );

        assert!(matches!(result, Err(ConfigurationError::Invalid { .. })));
    }

    #[tokio::test]
    async fn test_dispose_clears_and_is_idempotent() {
        let h = harness(
            QueueOptions::default().with_auto_check_delayed(Duration::from_millis(10)),
        );
        h.engine.enqueue("a".into(), opts());

        h.engine.dispose();
        h.engine.dispose();

        assert!(h.engine.is_disposed());
        assert_eq!(h.engine.total_size(), 0);
        h.engine.wait_restored().await;
    }
}

// ============================================================================
// Persistence Tests
// ============================================================================

mod persistence {
    use super::*;

    fn persistent(interval_ms: u64) -> QueueOptions {
        QueueOptions::default()
            .with_persistence(StorageDriver::Memory, Duration::from_millis(interval_ms))
    }

    /// Storage whose loads wait until the gate is opened
    struct GatedStorage {
        inner: InMemoryStorage,
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl StorageBackend for GatedStorage {
        async fn save(&self, key: &str, value: String) -> Result<(), StorageError> {
            self.inner.save(key, value).await
        }

        async fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.gate.notified().await;
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

    #[tokio::test]
    async fn test_restore_finishing_after_dispose_is_discarded() {
        let storage = InMemoryStorage::new();
        let writer = harness_with(QueueOptions::default(), |b| {
            b.storage(Arc::new(storage.clone()))
        });
        writer.engine.enqueue("a".into(), with_id("a"));
        writer.engine.save_now().await.unwrap();

        let gate = Arc::new(tokio::sync::Notify::new());
        let gated = GatedStorage {
            inner: storage.clone(),
            gate: Arc::clone(&gate),
        };
        let h = harness_with(QueueOptions::default(), |b| b.storage(Arc::new(gated)));

        let (restored, ()) = tokio::join!(h.engine.restore(), async {
            h.engine.dispose();
            gate.notify_one();
        });

        assert!(!restored.unwrap());
        assert!(h.engine.is_disposed());
        assert_eq!(h.engine.total_size(), 0);
        assert_eq!(
            h.observer
                .count(|d| matches!(d, Diagnostic::SnapshotRestored { .. })),
            0
        );
    }

    #[tokio::test]
    async fn test_save_now_requires_storage() {
        let h = harness(QueueOptions::default());

        let result = h.engine.save_now().await;
        assert!(matches!(
            result,
            Err(PersistenceError::NotConfigured { .. })
        ));
        assert!(matches!(
            h.engine.restore().await,
            Err(PersistenceError::NotConfigured { .. })
        ));
    }

    #[tokio::test]
    async fn test_save_now_and_restore_with_explicit_storage() {
        let storage = InMemoryStorage::new();
        let first = harness_with(QueueOptions::default(), |b| {
            b.storage(Arc::new(storage.clone()))
        });

        first.engine.enqueue("a".into(), with_id("a").with_priority(4));
        first
            .engine
            .enqueue("b".into(), with_id("b").with_delay(Duration::from_secs(10)));
        first.engine.save_now().await.unwrap();
        assert!(storage.load("queue-orders").await.unwrap().is_some());

        let second = harness_with(QueueOptions::default(), |b| {
            b.storage(Arc::new(storage.clone()))
        });
        assert!(second.engine.restore().await.unwrap());

        let restored = second.engine.find_message_by_id("a").unwrap();
        assert_eq!(restored.priority, 4);
        assert_eq!(restored.status, MessageStatus::Pending);
        assert_eq!(
            second.engine.find_message_by_id("b").unwrap().status,
            MessageStatus::Delayed
        );
        assert_eq!(second.engine.total_size(), 2);
    }

    #[tokio::test]
    async fn test_restore_on_start_promotes_elapsed_delays() {
        let storage = InMemoryStorage::new();
        let first = harness_with(QueueOptions::default(), |b| {
            b.storage(Arc::new(storage.clone()))
        });
        first
            .engine
            .enqueue("later".into(), with_id("later").with_delay(Duration::from_millis(100)));
        first.engine.enqueue("now".into(), with_id("now"));
        first.engine.save_now().await.unwrap();

        let start = first.clock.now().saturating_add(Duration::from_millis(200));
        let second = harness_with(persistent(5000), |b| {
            b.storage(Arc::new(storage.clone()))
                .clock(Arc::new(ManualClock::starting_at(start)))
        });
        second.engine.wait_restored().await;

        assert_eq!(second.engine.size(), 2);
        assert!(second.engine.get_delayed_messages().is_empty());
        assert_eq!(
            second.observer.diagnostics(),
            vec![Diagnostic::SnapshotRestored {
                queue_id: queue_id(),
                messages: 2,
                promoted: 1,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_save() {
        let storage = InMemoryStorage::new();
        let h = harness_with(persistent(1000), |b| b.storage(Arc::new(storage.clone())));
        h.engine.wait_restored().await;

        h.engine.enqueue("a".into(), opts());
        h.engine.enqueue("b".into(), opts());
        assert!(storage.load("queue-orders").await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let raw = storage.load("queue-orders").await.unwrap().unwrap();
        let snapshot: Snapshot<String> = Snapshot::decode(&raw, &queue_id()).unwrap();
        assert_eq!(snapshot.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_snapshot_is_ignored() {
        let mut entries = HashMap::new();
        entries.insert("queue-orders".to_string(), "not json".to_string());
        let storage = InMemoryStorage::with_entries(entries);

        let h = harness_with(QueueOptions::default(), |b| b.storage(Arc::new(storage)));
        h.engine.enqueue("kept".into(), opts());

        assert!(!h.engine.restore().await.unwrap());
        assert_eq!(h.engine.total_size(), 1);
        assert_eq!(
            h.observer
                .count(|d| matches!(d, Diagnostic::SnapshotMalformed { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_snapshot_for_other_queue_is_ignored() {
        let storage = InMemoryStorage::new();
        let other = QueueEngine::<String>::builder(QueueId::new("other").unwrap())
            .storage(Arc::new(storage.clone()))
            .build()
            .unwrap();
        other.enqueue("foreign".into(), opts());
        other.save_now().await.unwrap();
        let foreign = storage.load("queue-other").await.unwrap().unwrap();
        storage.save("queue-orders", foreign).await.unwrap();

        let h = harness_with(QueueOptions::default(), |b| b.storage(Arc::new(storage)));

        assert!(!h.engine.restore().await.unwrap());
        assert_eq!(h.engine.total_size(), 0);
    }

    #[tokio::test]
    async fn test_failing_storage() {
        let h = harness_with(persistent(5000), |b| b.storage(Arc::new(FailingStorage)));

        // Background restore failure is reported, not raised
        h.engine.wait_restored().await;
        assert_eq!(
            h.observer
                .count(|d| matches!(d, Diagnostic::PersistenceLoadFailed { .. })),
            1
        );

        let err = h.engine.save_now().await.unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::Storage(StorageError::Io { .. })
        ));
        assert!(h.engine.restore().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_save_failures_are_reported() {
        let h = harness_with(persistent(100), |b| b.storage(Arc::new(FailingStorage)));
        h.engine.enqueue("a".into(), opts());

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(
            h.observer
                .count(|d| matches!(d, Diagnostic::PersistenceSaveFailed { .. })),
            2
        );
        // The queue keeps working
        assert_eq!(h.engine.size(), 1);
    }

    #[test]
    fn test_persistence_without_runtime() {
        let h = harness(persistent(1000));

        assert_eq!(
            h.observer
                .count(|d| matches!(d, Diagnostic::CapabilityUnavailable { .. })),
            1
        );
        h.engine.enqueue("a".into(), opts());
        assert_eq!(h.engine.size(), 1);
    }

    #[tokio::test]
    async fn test_browser_driver_falls_back_to_memory() {
        let mut options = persistent(1000);
        options.persistence_driver = "indexeddb".to_string();

        let h = harness(options);
        h.engine.wait_restored().await;

        assert_eq!(
            h.observer
                .count(|d| matches!(d, Diagnostic::CapabilityUnavailable { .. })),
            1
        );
        h.engine.enqueue("a".into(), opts());
        h.engine.save_now().await.unwrap();
    }
}

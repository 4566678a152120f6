//! # Message Store
//!
//! Canonical message records plus the three ordered collections (ready,
//! delayed, dead-letter) that reference them.
//!
//! Records live in a hash map keyed by id, so lookups by id are O(1). Each
//! collection is an ordered list of ids kept sorted by the
//! [ordering policy](crate::ordering). Every id is listed in exactly one
//! collection, and the record remembers which one; moves remove the id from
//! its old list before inserting it into the new one.
//!
//! The store is synchronous and has no notion of wall-clock time: callers pass
//! `now` into every mutating operation.

use crate::message::{Message, MessageId, MessageStatus, Timestamp};
use crate::ordering::{delayed_order, ready_order};
use crate::retry::{FailureDisposition, RetryPolicy};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// The collection a message currently belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Ready,
    Delayed,
    DeadLetter,
}

impl Collection {
    /// Every collection, in snapshot and listing order
    pub const ALL: [Collection; 3] = [Self::Ready, Self::Delayed, Self::DeadLetter];

    /// Collection a freshly inserted message belongs in, by status
    fn for_status(status: MessageStatus) -> Self {
        match status {
            MessageStatus::Delayed => Self::Delayed,
            MessageStatus::DeadLetter => Self::DeadLetter,
            _ => Self::Ready,
        }
    }
}

struct Slot<T> {
    message: Message<T>,
    collection: Collection,
}

/// Per-status and per-collection message counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub dead_letter: usize,
    pub ready_collection: usize,
    pub delayed_collection: usize,
    pub dead_letter_collection: usize,
}

impl QueueStats {
    /// Messages across all collections
    pub fn total(&self) -> usize {
        self.ready_collection + self.delayed_collection + self.dead_letter_collection
    }
}

/// Three ordered collections over one id-indexed record map
pub struct MessageStore<T> {
    records: HashMap<MessageId, Slot<T>>,
    ready: Vec<MessageId>,
    delayed: Vec<MessageId>,
    dead_letter: Vec<MessageId>,
}

impl<T> Default for MessageStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageStore<T> {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            ready: Vec::new(),
            delayed: Vec::new(),
            dead_letter: Vec::new(),
        }
    }

    /// Rebuild a store from persisted collections
    ///
    /// Messages keep the collection they were saved in. If an id appears more
    /// than once the first occurrence wins; the number of dropped duplicates
    /// is returned alongside the store.
    pub fn from_collections(
        ready: Vec<Message<T>>,
        delayed: Vec<Message<T>>,
        dead_letter: Vec<Message<T>>,
    ) -> (Self, usize) {
        let mut store = Self::new();
        let mut duplicates = 0;

        for (collection, messages) in [
            (Collection::Ready, ready),
            (Collection::Delayed, delayed),
            (Collection::DeadLetter, dead_letter),
        ] {
            for message in messages {
                if store.records.contains_key(&message.id) {
                    duplicates += 1;
                    continue;
                }
                store.list_mut(collection).push(message.id.clone());
                store.records.insert(
                    message.id.clone(),
                    Slot {
                        message,
                        collection,
                    },
                );
            }
        }

        store.sort(Collection::Ready);
        store.sort(Collection::Delayed);
        (store, duplicates)
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Check if any collection holds `id`
    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Get a message by id from any collection
    pub fn get(&self, id: &str) -> Option<&Message<T>> {
        self.records.get(id).map(|slot| &slot.message)
    }

    /// Get the collection holding `id`
    pub fn collection_of(&self, id: &str) -> Option<Collection> {
        self.records.get(id).map(|slot| slot.collection)
    }

    /// Highest-ranked Pending message in the ready collection
    pub fn head_pending(&self) -> Option<&Message<T>> {
        self.iter(Collection::Ready).find(|m| m.is_pending())
    }

    /// Messages of one collection in collection order
    pub fn iter(&self, collection: Collection) -> impl Iterator<Item = &Message<T>> + '_ {
        self.list(collection)
            .iter()
            .filter_map(move |id| self.records.get(id).map(|slot| &slot.message))
    }

    // ------------------------------------------------------------------------
    // Counts
    // ------------------------------------------------------------------------

    /// Pending messages in the ready collection
    pub fn pending_count(&self) -> usize {
        self.iter(Collection::Ready).filter(|m| m.is_pending()).count()
    }

    /// Messages across all collections
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Per-status and per-collection counts
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            ready_collection: self.ready.len(),
            delayed_collection: self.delayed.len(),
            dead_letter_collection: self.dead_letter.len(),
            ..QueueStats::default()
        };

        for slot in self.records.values() {
            match slot.message.status {
                MessageStatus::Pending => stats.pending += 1,
                MessageStatus::Processing => stats.processing += 1,
                MessageStatus::Completed => stats.completed += 1,
                MessageStatus::Failed => stats.failed += 1,
                MessageStatus::Delayed => stats.delayed += 1,
                MessageStatus::DeadLetter => stats.dead_letter += 1,
            }
        }

        stats
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    /// Insert a new message into the collection matching its status
    ///
    /// Returns false and leaves the store untouched if the id already exists.
    pub fn insert(&mut self, message: Message<T>) -> bool {
        if self.records.contains_key(&message.id) {
            return false;
        }

        let collection = Collection::for_status(message.status);
        self.place(message, collection);
        true
    }

    /// Move every delayed message that is due at `now` into the ready collection
    ///
    /// Delayed messages become Pending with `delay_until` cleared. Messages
    /// completed while waiting are not Delayed and stay where they are.
    /// Returns the number of messages moved.
    pub fn promote_due(&mut self, now: Timestamp) -> usize {
        let due: Vec<MessageId> = self
            .iter(Collection::Delayed)
            .filter(|m| m.status == MessageStatus::Delayed && m.is_due(now))
            .map(|m| m.id.clone())
            .collect();

        if due.is_empty() {
            return 0;
        }

        let due_set: HashSet<&MessageId> = due.iter().collect();
        self.delayed.retain(|id| !due_set.contains(id));
        for id in &due {
            if let Some(slot) = self.records.get_mut(id) {
                slot.message.status = MessageStatus::Pending;
                slot.message.delay_until = None;
                slot.message.updated_at = now;
                slot.collection = Collection::Ready;
            }
        }
        self.ready.extend(due.iter().cloned());
        self.sort(Collection::Ready);

        due.len()
    }

    /// Mark the head Pending message as Processing and return a copy
    pub fn dequeue(&mut self, now: Timestamp) -> Option<Message<T>>
    where
        T: Clone,
    {
        let id = self.head_pending()?.id.clone();
        let slot = self.records.get_mut(&id)?;
        slot.message.status = MessageStatus::Processing;
        slot.message.processing_started_at = Some(now);
        slot.message.updated_at = now;
        Some(slot.message.clone())
    }

    /// Mark a message Completed without moving it
    pub fn complete(&mut self, id: &str, now: Timestamp) -> bool {
        match self.records.get_mut(id) {
            Some(slot) => {
                slot.message.status = MessageStatus::Completed;
                slot.message.delay_until = None;
                slot.message.updated_at = now;
                true
            }
            None => false,
        }
    }

    /// Record a failed attempt and apply the retry policy
    ///
    /// Returns the disposition applied, or `None` if the id is unknown.
    pub fn fail(
        &mut self,
        id: &str,
        reason: Option<String>,
        now: Timestamp,
        policy: &RetryPolicy,
        dead_letter_enabled: bool,
    ) -> Option<FailureDisposition> {
        let (mut message, _) = self.take(id)?;

        message.processing_attempts = message.processing_attempts.saturating_add(1);
        message.failure_reason = reason;
        message.updated_at = now;

        let disposition = policy.disposition(message.processing_attempts, dead_letter_enabled);
        let collection = match disposition {
            FailureDisposition::Retry { delay } => {
                message.status = MessageStatus::Delayed;
                message.delay_until = Some(now.saturating_add(delay));
                Collection::Delayed
            }
            FailureDisposition::DeadLetter => {
                message.status = MessageStatus::DeadLetter;
                message.delay_until = None;
                Collection::DeadLetter
            }
            FailureDisposition::Park => {
                message.status = MessageStatus::Failed;
                message.delay_until = None;
                Collection::Ready
            }
        };

        self.place(message, collection);
        Some(disposition)
    }

    /// Remove a message from the delayed collection and return it
    ///
    /// Returns `None` if the message is not in the delayed collection.
    pub fn cancel_delayed(&mut self, id: &str) -> Option<Message<T>> {
        if self.collection_of(id) != Some(Collection::Delayed) {
            return None;
        }

        self.take(id).map(|(message, _)| message)
    }

    /// Move a dead-lettered message back to the ready collection as Pending
    pub fn retry_dead_letter(&mut self, id: &str, now: Timestamp) -> bool {
        if self.collection_of(id) != Some(Collection::DeadLetter) {
            return false;
        }

        let Some((mut message, _)) = self.take(id) else {
            return false;
        };
        message.status = MessageStatus::Pending;
        message.processing_attempts = 0;
        message.failure_reason = None;
        message.delay_until = None;
        message.processing_started_at = None;
        message.updated_at = now;

        self.place(message, Collection::Ready);
        true
    }

    /// Drop Completed and Failed messages from the ready collection
    pub fn purge_finished(&mut self) -> usize {
        let finished: HashSet<MessageId> = self
            .iter(Collection::Ready)
            .filter(|m| m.status.is_terminal())
            .map(|m| m.id.clone())
            .collect();

        for id in &finished {
            self.records.remove(id);
        }
        self.ready.retain(|id| !finished.contains(id));

        finished.len()
    }

    /// Drop every message
    pub fn clear(&mut self) {
        self.records.clear();
        self.ready.clear();
        self.delayed.clear();
        self.dead_letter.clear();
    }

    // ------------------------------------------------------------------------
    // Copies
    // ------------------------------------------------------------------------

    /// Copies of one collection in collection order
    pub fn messages(&self, collection: Collection) -> Vec<Message<T>>
    where
        T: Clone,
    {
        self.iter(collection).cloned().collect()
    }

    /// Copies of Pending messages in dequeue order
    pub fn pending_messages(&self) -> Vec<Message<T>>
    where
        T: Clone,
    {
        self.iter(Collection::Ready)
            .filter(|m| m.is_pending())
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn list(&self, collection: Collection) -> &Vec<MessageId> {
        match collection {
            Collection::Ready => &self.ready,
            Collection::Delayed => &self.delayed,
            Collection::DeadLetter => &self.dead_letter,
        }
    }

    fn list_mut(&mut self, collection: Collection) -> &mut Vec<MessageId> {
        match collection {
            Collection::Ready => &mut self.ready,
            Collection::Delayed => &mut self.delayed,
            Collection::DeadLetter => &mut self.dead_letter,
        }
    }

    /// Remove a record and its id from its collection
    fn take(&mut self, id: &str) -> Option<(Message<T>, Collection)> {
        let slot = self.records.remove(id)?;
        let list = self.list_mut(slot.collection);
        if let Some(pos) = list.iter().position(|listed| listed.as_str() == id) {
            list.remove(pos);
        }
        Some((slot.message, slot.collection))
    }

    /// Insert a record into `collection` and restore that collection's order
    fn place(&mut self, message: Message<T>, collection: Collection) {
        self.list_mut(collection).push(message.id.clone());
        self.records.insert(
            message.id.clone(),
            Slot {
                message,
                collection,
            },
        );
        self.sort(collection);
    }

    fn sort(&mut self, collection: Collection) {
        let Self {
            records,
            ready,
            delayed,
            ..
        } = self;

        let (list, order): (&mut Vec<MessageId>, fn(&Message<T>, &Message<T>) -> Ordering) =
            match collection {
                Collection::Ready => (ready, ready_order::<T>),
                Collection::Delayed => (delayed, delayed_order::<T>),
                // Dead letters keep failure order
                Collection::DeadLetter => return,
            };

        list.sort_by(|a, b| match (records.get(a), records.get(b)) {
            (Some(x), Some(y)) => order(&x.message, &y.message),
            _ => Ordering::Equal,
        });
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

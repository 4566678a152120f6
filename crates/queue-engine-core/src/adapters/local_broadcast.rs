//! # In-Process Broadcast Channels
//!
//! A hub of named channels for queue instances living in the same process.
//! Every handle opened with the same name shares one subscriber list.
//! Handlers run synchronously on the posting thread, outside any lock, so a
//! handler may itself post or subscribe.

use crate::broadcast::{BroadcastChannel, MessageHandler, Subscription};
use crate::message::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::debug;

type Registry<T> = Arc<Mutex<HashMap<String, Arc<ChannelState<T>>>>>;

struct ChannelState<T> {
    subscribers: RwLock<Vec<(u64, MessageHandler<T>)>>,
    next_id: AtomicU64,
    /// Handles opened and not yet closed; guarded by the registry lock
    open_handles: AtomicUsize,
}

impl<T> ChannelState<T> {
    fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            open_handles: AtomicUsize::new(0),
        }
    }

    fn remove(&self, id: u64) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(sub_id, _)| *sub_id != id);
    }
}

/// Registry of named in-process channels
///
/// Clones share the registry. A channel is dropped from the registry once
/// every handle opened on it has been closed.
pub struct LocalBroadcastHub<T> {
    channels: Registry<T>,
}

impl<T> Clone for LocalBroadcastHub<T> {
    fn clone(&self) -> Self {
        Self {
            channels: Arc::clone(&self.channels),
        }
    }
}

impl<T> Default for LocalBroadcastHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LocalBroadcastHub<T> {
    /// Create new empty hub
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a handle on the channel called `name`
    pub fn open(&self, name: impl Into<String>) -> LocalBroadcastChannel<T> {
        let name = name.into();
        let state = {
            let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
            let state = channels
                .entry(name.clone())
                .or_insert_with(|| Arc::new(ChannelState::new()));
            state.open_handles.fetch_add(1, Ordering::SeqCst);
            Arc::clone(state)
        };

        LocalBroadcastChannel {
            name,
            state,
            registry: Arc::clone(&self.channels),
            own_subscriptions: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of channels with at least one open handle
    pub fn channel_count(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of live subscribers on `name`
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|state| {
                state
                    .subscribers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .len()
            })
            .unwrap_or(0)
    }
}

/// Handle on one named channel of a [`LocalBroadcastHub`]
pub struct LocalBroadcastChannel<T> {
    name: String,
    state: Arc<ChannelState<T>>,
    registry: Registry<T>,
    own_subscriptions: Arc<Mutex<Vec<u64>>>,
    closed: AtomicBool,
}

impl<T> LocalBroadcastChannel<T> {
    /// Check if [`BroadcastChannel::close`] has been called on this handle
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl<T: 'static> BroadcastChannel<T> for LocalBroadcastChannel<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn post(&self, message: &Message<T>) {
        if self.is_closed() {
            debug!(channel = %self.name, "Ignoring post on closed channel");
            return;
        }

        let handlers: Vec<MessageHandler<T>> = self
            .state
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler(message);
        }
    }

    fn subscribe(&self, handler: MessageHandler<T>) -> Subscription {
        if self.is_closed() {
            return Subscription::noop();
        }

        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        self.own_subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);

        let state = Arc::clone(&self.state);
        let own = Arc::clone(&self.own_subscriptions);
        Subscription::new(move || {
            state.remove(id);
            own.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|sub_id| *sub_id != id);
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let ids = std::mem::take(
            &mut *self
                .own_subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for id in ids {
            self.state.remove(id);
        }

        let mut channels = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state.open_handles.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Only remove the entry this handle belongs to
            if channels
                .get(&self.name)
                .is_some_and(|current| Arc::ptr_eq(current, &self.state))
            {
                channels.remove(&self.name);
                debug!(channel = %self.name, "Removed channel with no open handles");
            }
        }
    }
}

#[cfg(test)]
#[path = "local_broadcast_tests.rs"]
mod tests;

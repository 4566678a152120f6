//! # Broadcast
//!
//! Fan-out of newly enqueued messages to other queue instances sharing a
//! channel name.
//!
//! Broadcasting is layered on top of the engine by [`BroadcastingQueue`]
//! rather than built into it. The decorator posts exactly once per enqueue
//! that created a message without a delay. Idempotent repeats and messages
//! later promoted out of the delayed collection are never posted.
//!
//! Delivery is best-effort: subscribers registered after a post never see it,
//! and there is no ordering guarantee between instances.

use crate::engine::QueueEngine;
use crate::message::{EnqueueOptions, Enqueued, Message, MessageStatus, Payload};
use crate::observer::Diagnostic;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Callback receiving every message posted on a channel
pub type MessageHandler<T> = Arc<dyn Fn(&Message<T>) + Send + Sync>;

/// Fan-out capability shared by queue instances
pub trait BroadcastChannel<T>: Send + Sync {
    /// Channel name; handles with the same name share subscribers
    fn name(&self) -> &str;

    /// Deliver `message` to every current subscriber, including this
    /// handle's own
    fn post(&self, message: &Message<T>);

    /// Register a handler for future posts
    fn subscribe(&self, handler: MessageHandler<T>) -> Subscription;

    /// Detach this handle: its subscriptions are dropped and later posts
    /// through it are ignored
    fn close(&self);
}

/// Registration returned by [`BroadcastChannel::subscribe`]
///
/// Dropping a subscription does not unsubscribe; call
/// [`Subscription::unsubscribe`].
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Create subscription that runs `cancel` on unsubscribe
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Subscription whose unsubscribe does nothing
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Stop receiving messages
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Channel used when the host has no broadcast capability
///
/// Posts go nowhere and subscriptions never fire.
#[derive(Debug, Clone)]
pub struct NoopBroadcastChannel {
    name: String,
}

impl NoopBroadcastChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl<T> BroadcastChannel<T> for NoopBroadcastChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn post(&self, _message: &Message<T>) {}

    fn subscribe(&self, _handler: MessageHandler<T>) -> Subscription {
        Subscription::noop()
    }

    fn close(&self) {}
}

// ============================================================================
// Broadcasting Decorator
// ============================================================================

/// Queue engine that announces its new, non-delayed messages on a channel
///
/// Everything except enqueueing goes straight to the wrapped engine through
/// [`BroadcastingQueue::engine`].
///
/// # Examples
///
/// ```no_run
/// use queue_engine_core::adapters::LocalBroadcastHub;
/// use queue_engine_core::broadcast::BroadcastingQueue;
/// use queue_engine_core::{EnqueueOptions, QueueEngine, QueueId};
/// use std::sync::Arc;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let hub = LocalBroadcastHub::<String>::new();
/// let engine = QueueEngine::builder(QueueId::new("orders")?).build()?;
/// let queue = BroadcastingQueue::new(engine, Arc::new(hub.open("orders")));
///
/// let _subscription = queue.subscribe(Arc::new(|message| {
///     println!("enqueued elsewhere: {}", message.id);
/// }));
/// queue.enqueue("hello".to_string(), EnqueueOptions::new());
/// # Ok(())
/// # }
/// ```
pub struct BroadcastingQueue<T> {
    engine: QueueEngine<T>,
    channel: Arc<dyn BroadcastChannel<T>>,
}

impl<T: Payload> BroadcastingQueue<T> {
    /// Wrap `engine`, posting on `channel`
    pub fn new(engine: QueueEngine<T>, channel: Arc<dyn BroadcastChannel<T>>) -> Self {
        Self { engine, channel }
    }

    /// Wrap `engine`, posting on `channel` if the host provides one
    ///
    /// Without a channel the engine's observer receives
    /// [`Diagnostic::CapabilityUnavailable`] and a [`NoopBroadcastChannel`]
    /// named after the queue is used.
    pub fn connect(
        engine: QueueEngine<T>,
        channel: Option<Arc<dyn BroadcastChannel<T>>>,
    ) -> Self {
        let channel = match channel {
            Some(channel) => channel,
            None => {
                engine.report(&Diagnostic::CapabilityUnavailable {
                    capability: "broadcast channel".to_string(),
                    fallback: "no-op channel".to_string(),
                });
                Arc::new(NoopBroadcastChannel::new(engine.queue_id().as_str()))
            }
        };

        Self::new(engine, channel)
    }

    /// Enqueue through the engine and post the message if it is new and not
    /// delayed
    pub fn enqueue(&self, payload: T, options: EnqueueOptions) -> Message<T> {
        self.enqueue_with_outcome(payload, options).into_message()
    }

    /// As [`BroadcastingQueue::enqueue`], reporting whether the message is new
    pub fn enqueue_with_outcome(&self, payload: T, options: EnqueueOptions) -> Enqueued<T> {
        let outcome = self.engine.enqueue_with_outcome(payload, options);

        if let Enqueued::Created(message) = &outcome {
            if message.status != MessageStatus::Delayed {
                debug!(
                    channel = %self.channel.name(),
                    message_id = %message.id,
                    "Broadcasting enqueued message"
                );
                self.channel.post(message);
            }
        }

        outcome
    }

    /// Receive messages enqueued by any instance on the channel
    pub fn subscribe(&self, handler: MessageHandler<T>) -> Subscription {
        self.channel.subscribe(handler)
    }

    /// The wrapped engine
    pub fn engine(&self) -> &QueueEngine<T> {
        &self.engine
    }

    /// The channel messages are posted on
    pub fn channel(&self) -> &Arc<dyn BroadcastChannel<T>> {
        &self.channel
    }

    /// Close the channel and dispose the engine
    pub fn dispose(&self) {
        self.channel.close();
        self.engine.dispose();
    }
}

#[cfg(test)]
#[path = "broadcast_tests.rs"]
mod tests;

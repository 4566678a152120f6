//! Ordering policy for the ready and delayed collections.

use crate::message::Message;
use std::cmp::Ordering;

/// Dequeue order: priority descending, then older messages first
///
/// Used with a stable sort, so messages created in the same millisecond keep
/// their insertion order.
pub fn ready_order<T>(a: &Message<T>, b: &Message<T>) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
}

/// Delayed order: earliest `delay_until` first, then the ready order
///
/// Messages without a `delay_until` sort after every delayed one.
pub fn delayed_order<T>(a: &Message<T>, b: &Message<T>) -> Ordering {
    match (a.delay_until, b.delay_until) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| ready_order(a, b))
}

#[cfg(test)]
#[path = "ordering_tests.rs"]
mod tests;

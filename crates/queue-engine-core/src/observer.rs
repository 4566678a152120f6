//! Diagnostic observer injected into the engine.
//!
//! Failures the engine absorbs (persistence I/O, malformed snapshots,
//! unavailable host capabilities) are reported here instead of being raised
//! to the caller.

use crate::message::QueueId;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

/// Something the engine handled without failing the caller's operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A background or explicit save was rejected by the storage backend
    PersistenceSaveFailed { queue_id: QueueId, message: String },

    /// Loading the last snapshot was rejected by the storage backend
    PersistenceLoadFailed { queue_id: QueueId, message: String },

    /// The stored snapshot could not be decoded and was ignored
    SnapshotMalformed { queue_id: QueueId, message: String },

    /// A requested host capability does not exist; a fallback is in use
    CapabilityUnavailable {
        capability: String,
        fallback: String,
    },

    /// The snapshot was restored into the engine
    SnapshotRestored {
        queue_id: QueueId,
        messages: usize,
        promoted: usize,
    },
}

/// Receives engine diagnostics
pub trait QueueObserver: Send + Sync {
    fn on_diagnostic(&self, diagnostic: &Diagnostic);
}

/// Forwards diagnostics to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl QueueObserver for TracingObserver {
    fn on_diagnostic(&self, diagnostic: &Diagnostic) {
        match diagnostic {
            Diagnostic::PersistenceSaveFailed { queue_id, message } => {
                warn!(queue_id = %queue_id, error = %message, "Failed to save queue snapshot");
            }
            Diagnostic::PersistenceLoadFailed { queue_id, message } => {
                warn!(queue_id = %queue_id, error = %message, "Failed to load queue snapshot");
            }
            Diagnostic::SnapshotMalformed { queue_id, message } => {
                warn!(
                    queue_id = %queue_id,
                    error = %message,
                    "Ignoring malformed queue snapshot"
                );
            }
            Diagnostic::CapabilityUnavailable {
                capability,
                fallback,
            } => {
                warn!(
                    capability = %capability,
                    fallback = %fallback,
                    "Capability unavailable in this host; using fallback"
                );
            }
            Diagnostic::SnapshotRestored {
                queue_id,
                messages,
                promoted,
            } => {
                info!(
                    queue_id = %queue_id,
                    messages = messages,
                    promoted = promoted,
                    "Restored queue snapshot"
                );
            }
        }
    }
}

/// Records diagnostics in memory
///
/// Useful in tests and for hosts that surface diagnostics in their own UI.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl CollectingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of everything recorded so far
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Count recorded diagnostics matching `predicate`
    pub fn count(&self, predicate: impl Fn(&Diagnostic) -> bool) -> usize {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|d| predicate(d))
            .count()
    }
}

impl QueueObserver for CollectingObserver {
    fn on_diagnostic(&self, diagnostic: &Diagnostic) {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic.clone());
    }
}

//! # Infrastructure Adapters
//!
//! Concrete storage backends and the in-process broadcast channel.

pub mod filesystem_storage;
pub mod local_broadcast;
pub mod memory_storage;

pub use filesystem_storage::FilesystemStorage;
pub use local_broadcast::{LocalBroadcastChannel, LocalBroadcastHub};
pub use memory_storage::InMemoryStorage;

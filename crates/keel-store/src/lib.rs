//! # keel-store
//!
//! Persistence layer: key-value backends (SQLite, in-memory), the
//! version-checked local store, the durable mutation queue, and the
//! conflicts table.

pub mod backend;
pub mod conflicts;
pub mod keys;
pub mod queue;
pub mod store;

pub use backend::{MemoryBackend, SqliteBackend};
pub use conflicts::ConflictStore;
pub use queue::{MutationQueue, ResourceBatch};
pub use store::LocalStore;

use keel_core::errors::{KeelError, StoreError};

/// Wrap a backend failure message into the store error taxonomy.
pub(crate) fn to_store_err(message: impl Into<String>) -> KeelError {
    KeelError::Store(StoreError::Backend {
        message: message.into(),
    })
}

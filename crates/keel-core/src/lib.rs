//! # keel-core
//!
//! Foundation crate for the keel offline-first data engine: the
//! record/mutation/conflict data model, the backend and remote-endpoint
//! traits, the error taxonomy, configuration, and constants. The store
//! and sync crates both build on these types.

pub mod config;
pub mod conflict;
pub mod constants;
pub mod errors;
pub mod event;
pub mod mutation;
pub mod record;
pub mod traits;

// Re-export the most commonly used types at the crate root.
pub use config::EngineConfig;
pub use conflict::{ConflictStatus, FieldConflict, Resolution, SyncConflict};
pub use errors::{KeelError, KeelResult};
pub use event::{UpdateActor, UpdateEvent};
pub use mutation::{MutationOp, QueueEntry, QueueEntryStatus};
pub use record::{FieldValue, Record, RecordPayload, SyncStatus};

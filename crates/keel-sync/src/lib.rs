//! # keel-sync
//!
//! The reactive half of the engine: connectivity monitoring, conflict
//! detection and resolution, the push-then-pull sync coordinator, the
//! broadcast layer, and the public `SyncEngine` facade.

pub mod broadcast;
pub mod coordinator;
pub mod detect;
pub mod engine;
pub mod monitor;
pub mod resolve;
pub mod sync_log;

pub use broadcast::Broadcaster;
pub use coordinator::{SyncCoordinator, SyncReport};
pub use detect::compare;
pub use engine::{ResolveOutcome, SyncEngine};
pub use monitor::{ConnState, NetworkMonitor};
pub use resolve::Strategy;
pub use sync_log::{LogDirection, LogOutcome, SyncLog, SyncLogEntry};

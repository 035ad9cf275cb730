//! Error taxonomy: per-domain enums aggregated into `KeelError`.
//!
//! Transient network errors are retried internally by the coordinator;
//! version conflicts route into the conflict path; persistence and
//! validation errors are always surfaced synchronously to the caller.

mod store_error;
mod sync_error;

pub use store_error::StoreError;
pub use sync_error::SyncError;

/// Result alias used across the workspace.
pub type KeelResult<T> = Result<T, KeelError>;

/// Top-level error for the keel engine.
#[derive(Debug, thiserror::Error)]
pub enum KeelError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl KeelError {
    /// Whether the coordinator may retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, KeelError::Sync(e) if e.is_transient())
    }
}

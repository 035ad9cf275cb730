/// Synchronization errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("transient network error: {reason}")]
    TransientNetwork { reason: String },

    #[error("remote rejected {resource_id}: local version {local_version}, remote version {remote_version}")]
    RemoteRejected {
        resource_id: String,
        local_version: u64,
        remote_version: u64,
    },

    #[error("invalid mutation: {reason}")]
    Validation { reason: String },

    #[error("conflict not found: {conflict_id}")]
    ConflictNotFound { conflict_id: String },

    #[error("conflict {conflict_id} still has unresolved fields: {fields:?}")]
    UnresolvedFields {
        conflict_id: String,
        fields: Vec<String>,
    },
}

impl SyncError {
    /// Whether this error is retried with backoff rather than surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientNetwork { .. })
    }
}

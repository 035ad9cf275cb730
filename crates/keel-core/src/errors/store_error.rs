/// Persistence-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend error: {message}")]
    Backend { message: String },

    #[error("version mismatch on {resource_id}: expected {expected}, stored {stored}")]
    VersionMismatch {
        resource_id: String,
        expected: u64,
        stored: u64,
    },

    #[error("record not found: {resource_type}/{resource_id}")]
    RecordNotFound {
        resource_type: String,
        resource_id: String,
    },

    #[error("record already exists: {resource_type}/{resource_id}")]
    AlreadyExists {
        resource_type: String,
        resource_id: String,
    },
}

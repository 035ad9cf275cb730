//! Key layout for the backend keyspace.
//!
//! Logical tables over one key-value namespace: a records table keyed by
//! `(type, id)`, a single ordered queue table, a conflicts table keyed by
//! resource id, and the pull cursor.

/// Key for a record: `record/{type}/{id}`.
pub fn record(record_type: &str, id: &str) -> String {
    format!("record/{record_type}/{id}")
}

/// Prefix selecting every record key.
pub const RECORD_PREFIX: &str = "record/";

/// Key for a queue entry. Zero-padded so lexicographic key order matches
/// enqueue order.
pub fn queue_entry(id: u64) -> String {
    format!("queue/{id:020}")
}

/// Prefix selecting every queue entry key.
pub const QUEUE_PREFIX: &str = "queue/";

/// Key for a conflict set: `conflict/{resource_id}/{conflict_id}`.
pub fn conflict(resource_id: &str, conflict_id: &str) -> String {
    format!("conflict/{resource_id}/{conflict_id}")
}

/// Prefix selecting every conflict key.
pub const CONFLICT_PREFIX: &str = "conflict/";

/// Key holding the last pull cursor.
pub const CURSOR: &str = "cursor";

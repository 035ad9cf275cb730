//! Versioned records: the unit of synchronizable domain data.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sync status of a record. A record carries exactly one status at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local mutations not yet confirmed by the remote.
    Pending,
    /// Local and remote agree as of `base_version`.
    Synced,
    /// Remote diverged; at least one unresolved field conflict exists.
    Conflict,
    /// Transmission retries exhausted; resumed only by an explicit force-sync.
    Failed,
}

/// A single payload field with its modification timestamp.
///
/// Per-field timestamps drive conflict detection and last-writer-wins
/// merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: serde_json::Value,
    pub modified_at: DateTime<Utc>,
}

impl FieldValue {
    pub fn new(value: serde_json::Value, modified_at: DateTime<Utc>) -> Self {
        Self { value, modified_at }
    }
}

/// A versioned, status-tracked record in the local store.
///
/// `version` increases by exactly 1 per committed mutation, local or
/// remote. `base_version` and `synced_at` mark the last common ancestor
/// shared with the remote (0 and the creation instant for records that
/// have never synced).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub record_type: String,
    /// Ordered map keeps serialization deterministic.
    pub payload: BTreeMap<String, FieldValue>,
    pub version: u64,
    pub base_version: u64,
    pub updated_at: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
}

impl Record {
    /// Create a fresh local record at version 1 with `Pending` status.
    pub fn new_local(
        id: impl Into<String>,
        record_type: impl Into<String>,
        payload: BTreeMap<String, FieldValue>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            record_type: record_type.into(),
            payload,
            version: 1,
            base_version: 0,
            updated_at: now,
            synced_at: now,
            sync_status: SyncStatus::Pending,
        }
    }

    /// Whether the record carries local edits the remote has not seen.
    pub fn locally_modified(&self) -> bool {
        self.version != self.base_version
    }

    /// Field names modified after the given ancestor timestamp.
    pub fn fields_modified_since(&self, ancestor: DateTime<Utc>) -> Vec<&str> {
        self.payload
            .iter()
            .filter(|(_, fv)| fv.modified_at > ancestor)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Mark the record as in agreement with the remote at its current
    /// version.
    pub fn mark_synced(&mut self, now: DateTime<Utc>) {
        self.base_version = self.version;
        self.synced_at = now;
        self.sync_status = SyncStatus::Synced;
    }
}

/// The wire form of a record: what the remote endpoint exchanges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordPayload {
    pub id: String,
    pub record_type: String,
    pub payload: BTreeMap<String, FieldValue>,
    pub version: u64,
    pub modified_at: DateTime<Utc>,
}

impl From<&Record> for RecordPayload {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            record_type: record.record_type.clone(),
            payload: record.payload.clone(),
            version: record.version,
            modified_at: record.updated_at,
        }
    }
}

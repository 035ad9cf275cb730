//! Field-level conflicts between a local and a remote record version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a single field conflict was (or will be) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Not resolved yet.
    #[default]
    Unset,
    /// Local value taken.
    Local,
    /// Remote value taken.
    Remote,
    /// Later timestamp won (remote on exact ties).
    Merge,
    /// Caller supplied an explicit value.
    Manual,
}

/// A divergent field: both sides modified it since the common ancestor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub local_value: serde_json::Value,
    pub remote_value: serde_json::Value,
    pub local_ts: DateTime<Utc>,
    pub remote_ts: DateTime<Utc>,
    pub resolution: Resolution,
    /// The value chosen by resolution; `None` while `resolution` is unset.
    pub resolved_value: Option<serde_json::Value>,
}

impl FieldConflict {
    pub fn is_resolved(&self) -> bool {
        self.resolution != Resolution::Unset
    }
}

/// Status of a conflict set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

/// All field conflicts detected for a single resource at one divergence.
///
/// Invariant: a record with `Conflict` status has at least one pending
/// `SyncConflict` holding at least one unresolved `FieldConflict`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub resource_id: String,
    pub resource_type: String,
    /// Remote version the conflicting fields were detected against.
    pub remote_version: u64,
    pub conflicts: Vec<FieldConflict>,
    pub status: ConflictStatus,
    pub detected_at: DateTime<Utc>,
}

impl SyncConflict {
    /// Field names still awaiting resolution.
    pub fn unresolved_fields(&self) -> Vec<String> {
        self.conflicts
            .iter()
            .filter(|c| !c.is_resolved())
            .map(|c| c.field.clone())
            .collect()
    }

    pub fn fully_resolved(&self) -> bool {
        self.conflicts.iter().all(FieldConflict::is_resolved)
    }
}

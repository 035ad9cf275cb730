//! In-process log of push/pull outcomes, surfaced for diagnostics.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a logged sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogDirection {
    Push,
    Pull,
}

/// Outcome of a logged sync operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Accepted,
    Rejected,
    Retried,
    Failed,
    Applied,
    ConflictFlagged,
}

/// A single entry in the sync log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub direction: LogDirection,
    pub resource_id: String,
    pub outcome: LogOutcome,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only log of sync activity.
#[derive(Debug, Default)]
pub struct SyncLog {
    entries: Mutex<Vec<SyncLogEntry>>,
}

impl SyncLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        direction: LogDirection,
        resource_id: &str,
        outcome: LogOutcome,
        detail: impl Into<String>,
    ) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SyncLogEntry {
                direction,
                resource_id: resource_id.to_string(),
                outcome,
                detail: detail.into(),
                timestamp: Utc::now(),
            });
    }

    /// Snapshot of all entries, oldest first.
    pub fn entries(&self) -> Vec<SyncLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Outbox entries: ordered, durable mutations awaiting transmission.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::FieldValue;

/// The kind of mutation targeting a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

/// Status of a queue entry. Every entry resolves to exactly one terminal
/// state: `Completed` (push accepted or conflict recorded) or `Failed`
/// (retry budget exhausted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryStatus {
    Pending,
    Completed,
    Failed,
}

/// A single entry in the mutation queue.
///
/// `id` is assigned monotonically at enqueue time; entries for the same
/// resource are totally ordered by it. Entries for different resources
/// carry no required relative order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: u64,
    pub resource_id: String,
    pub resource_type: String,
    pub op: MutationOp,
    /// Changed fields only; empty for deletes.
    pub delta: BTreeMap<String, FieldValue>,
    /// Version of the record after this mutation was applied locally.
    pub base_version: u64,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    /// Earliest instant this entry is eligible for transmission again.
    pub next_attempt_at: DateTime<Utc>,
    pub status: QueueEntryStatus,
}

impl QueueEntry {
    /// Whether the entry is eligible for transmission at `now`.
    pub fn eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueEntryStatus::Pending && self.next_attempt_at <= now
    }
}

use serde::{Deserialize, Serialize};

use crate::errors::KeelResult;
use crate::mutation::QueueEntry;
use crate::record::RecordPayload;

/// Outcome of pushing a single mutation to the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushOutcome {
    /// The remote accepted the mutation at the pushed version.
    Accepted,
    /// The remote has diverged; the caller must go through the conflict
    /// path.
    Rejected { remote_version: u64 },
}

/// A page of remote changes since a cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullBatch {
    pub records: Vec<RecordPayload>,
    /// Opaque marker for the next incremental pull.
    pub cursor: Option<String>,
}

impl PullBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The remote sync endpoint. An opaque RPC honoring the push/pull
/// contract; transient failures surface as
/// `SyncError::TransientNetwork`.
pub trait RemoteEndpoint: Send + Sync {
    /// Transmit one mutation. Atomic at single-record granularity.
    fn push(&self, entry: &QueueEntry) -> KeelResult<PushOutcome>;

    /// Fetch remote changes since the cursor (`None` = from the start).
    fn pull(&self, cursor: Option<&str>) -> KeelResult<PullBatch>;
}

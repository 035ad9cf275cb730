//! Durable conflicts table, keyed by resource.

use std::sync::Arc;

use keel_core::conflict::{ConflictStatus, SyncConflict};
use keel_core::errors::KeelResult;
use keel_core::traits::KeyValueBackend;

use crate::keys;

/// Stores detected conflict sets until they are resolved.
pub struct ConflictStore {
    backend: Arc<dyn KeyValueBackend>,
}

impl ConflictStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    pub fn record(&self, conflict: &SyncConflict) -> KeelResult<()> {
        let key = keys::conflict(&conflict.resource_id, &conflict.id);
        let raw = serde_json::to_string(conflict)?;
        self.backend.put(&key, &raw)
    }

    pub fn get(&self, conflict_id: &str) -> KeelResult<Option<SyncConflict>> {
        Ok(self
            .list_all()?
            .into_iter()
            .find(|c| c.id == conflict_id))
    }

    /// Every conflict set still awaiting resolution.
    pub fn list_pending(&self) -> KeelResult<Vec<SyncConflict>> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|c| c.status == ConflictStatus::Pending)
            .collect())
    }

    /// Pending conflicts for one resource.
    pub fn pending_for(&self, resource_id: &str) -> KeelResult<Vec<SyncConflict>> {
        Ok(self
            .list_pending()?
            .into_iter()
            .filter(|c| c.resource_id == resource_id)
            .collect())
    }

    fn list_all(&self) -> KeelResult<Vec<SyncConflict>> {
        let mut out = Vec::new();
        for (key, raw) in self.backend.list_all()? {
            if !key.starts_with(keys::CONFLICT_PREFIX) {
                continue;
            }
            out.push(serde_json::from_str(&raw)?);
        }
        Ok(out)
    }
}

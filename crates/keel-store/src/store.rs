//! LocalStore: durable, version-checked record storage.

use std::sync::{Arc, Mutex};

use keel_core::errors::{KeelError, KeelResult, StoreError};
use keel_core::record::{Record, SyncStatus};
use keel_core::traits::KeyValueBackend;

use crate::{keys, to_store_err};

/// Durable storage of versioned records with a sync status.
///
/// Writes go through a version-checked compare-and-swap: a write is
/// rejected when the caller's expected version does not match the stored
/// version, forcing the caller through the conflict path instead of
/// silently overwriting. No implicit retries; backend failures surface
/// immediately.
pub struct LocalStore {
    backend: Arc<dyn KeyValueBackend>,
    /// Serializes read-modify-write cycles so the CAS check is atomic.
    write_lock: Mutex<()>,
}

impl LocalStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, record_type: &str, id: &str) -> KeelResult<Option<Record>> {
        let key = keys::record(record_type, id);
        match self.backend.get(&key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Atomic status+payload write.
    ///
    /// `expected_version`: `None` means create-only (rejected if the record
    /// exists); `Some(v)` means the stored record must currently be at
    /// version `v`.
    pub fn put(&self, record: &Record, expected_version: Option<u64>) -> KeelResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| to_store_err(format!("store lock poisoned: {e}")))?;

        let key = keys::record(&record.record_type, &record.id);
        let stored: Option<Record> = match self.backend.get(&key)? {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };

        match (expected_version, &stored) {
            (None, Some(_)) => {
                return Err(KeelError::Store(StoreError::AlreadyExists {
                    resource_type: record.record_type.clone(),
                    resource_id: record.id.clone(),
                }));
            }
            (Some(_), None) => {
                return Err(KeelError::Store(StoreError::RecordNotFound {
                    resource_type: record.record_type.clone(),
                    resource_id: record.id.clone(),
                }));
            }
            (Some(expected), Some(current)) if current.version != expected => {
                return Err(KeelError::Store(StoreError::VersionMismatch {
                    resource_id: record.id.clone(),
                    expected,
                    stored: current.version,
                }));
            }
            _ => {}
        }

        let raw = serde_json::to_string(record)?;
        self.backend.put(&key, &raw)
    }

    pub fn delete(&self, record_type: &str, id: &str) -> KeelResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| to_store_err(format!("store lock poisoned: {e}")))?;
        self.backend.delete(&keys::record(record_type, id))
    }

    /// All records currently carrying the given status.
    pub fn list_by_status(&self, status: SyncStatus) -> KeelResult<Vec<Record>> {
        let mut out = Vec::new();
        for (key, raw) in self.backend.list_all()? {
            if !key.starts_with(keys::RECORD_PREFIX) {
                continue;
            }
            let record: Record = serde_json::from_str(&raw)?;
            if record.sync_status == status {
                out.push(record);
            }
        }
        Ok(out)
    }
}

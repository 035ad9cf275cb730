//! In-memory backend for tests and ephemeral engines.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use keel_core::errors::KeelResult;
use keel_core::traits::KeyValueBackend;

use crate::to_store_err;

/// BTreeMap-backed key-value store. The `fail` flag lets tests exercise
/// the persistence-error path.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<BTreeMap<String, String>>,
    fail: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with a backend error.
    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> KeelResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(to_store_err("backend unavailable"));
        }
        Ok(())
    }

    fn with_entries<F, T>(&self, f: F) -> KeelResult<T>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> T,
    {
        self.check()?;
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| to_store_err(format!("backend lock poisoned: {e}")))?;
        Ok(f(&mut guard))
    }
}

impl KeyValueBackend for MemoryBackend {
    fn get(&self, key: &str) -> KeelResult<Option<String>> {
        self.with_entries(|entries| entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> KeelResult<()> {
        self.with_entries(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn delete(&self, key: &str) -> KeelResult<()> {
        self.with_entries(|entries| {
            entries.remove(key);
        })
    }

    fn list_all(&self) -> KeelResult<Vec<(String, String)>> {
        self.with_entries(|entries| {
            entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }
}

use crate::errors::KeelResult;

/// Durable key-value persistence consumed by the local store, the mutation
/// queue, and the conflicts table. The engine is agnostic to the concrete
/// storage technology.
///
/// Values are JSON strings; keys are namespaced by the callers
/// (`record/…`, `queue/…`, `conflict/…`, `cursor`).
pub trait KeyValueBackend: Send + Sync {
    fn get(&self, key: &str) -> KeelResult<Option<String>>;
    fn put(&self, key: &str, value: &str) -> KeelResult<()>;
    fn delete(&self, key: &str) -> KeelResult<()>;
    /// All key/value pairs, ordered by key.
    fn list_all(&self) -> KeelResult<Vec<(String, String)>>;
}

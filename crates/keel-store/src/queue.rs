//! The mutation queue (outbox): ordered, durable, per-resource FIFO.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use keel_core::errors::KeelResult;
use keel_core::mutation::{MutationOp, QueueEntry, QueueEntryStatus};
use keel_core::record::FieldValue;
use keel_core::traits::KeyValueBackend;

use crate::{keys, to_store_err};

/// Eligible entries for one resource, in enqueue order. Entries of a
/// batch are transmitted sequentially; distinct batches may go out
/// concurrently.
#[derive(Debug, Clone)]
pub struct ResourceBatch {
    pub resource_id: String,
    pub resource_type: String,
    pub entries: Vec<QueueEntry>,
}

struct QueueInner {
    entries: BTreeMap<u64, QueueEntry>,
    next_id: u64,
}

/// Durable outbox. Entries are written through to the backend on every
/// state change and rehydrated on construction, so a restarted engine
/// resumes where it left off.
pub struct MutationQueue {
    backend: Arc<dyn KeyValueBackend>,
    inner: Mutex<QueueInner>,
}

impl MutationQueue {
    /// Construct the queue, rehydrating persisted entries.
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> KeelResult<Self> {
        let mut entries = BTreeMap::new();
        for (key, raw) in backend.list_all()? {
            if !key.starts_with(keys::QUEUE_PREFIX) {
                continue;
            }
            let entry: QueueEntry = serde_json::from_str(&raw)?;
            entries.insert(entry.id, entry);
        }
        let next_id = entries.keys().next_back().map(|id| id + 1).unwrap_or(1);
        Ok(Self {
            backend,
            inner: Mutex::new(QueueInner { entries, next_id }),
        })
    }

    fn with_inner<F, T>(&self, f: F) -> KeelResult<T>
    where
        F: FnOnce(&mut QueueInner) -> KeelResult<T>,
    {
        let mut guard = self
            .inner
            .lock()
            .map_err(|e| to_store_err(format!("queue lock poisoned: {e}")))?;
        f(&mut guard)
    }

    fn persist(&self, entry: &QueueEntry) -> KeelResult<()> {
        let raw = serde_json::to_string(entry)?;
        self.backend.put(&keys::queue_entry(entry.id), &raw)
    }

    /// Append a mutation for a resource and return its queue id.
    pub fn enqueue(
        &self,
        resource_id: &str,
        resource_type: &str,
        op: MutationOp,
        delta: BTreeMap<String, FieldValue>,
        base_version: u64,
        now: DateTime<Utc>,
    ) -> KeelResult<u64> {
        self.with_inner(|inner| {
            let id = inner.next_id;
            inner.next_id += 1;
            let entry = QueueEntry {
                id,
                resource_id: resource_id.to_string(),
                resource_type: resource_type.to_string(),
                op,
                delta,
                base_version,
                enqueued_at: now,
                attempt_count: 0,
                next_attempt_at: now,
                status: QueueEntryStatus::Pending,
            };
            self.persist(&entry)?;
            inner.entries.insert(id, entry);
            tracing::debug!("queue: enqueued {op:?} for {resource_type}/{resource_id} as #{id}");
            Ok(id)
        })
    }

    /// Next eligible entries honoring per-resource FIFO: for each resource,
    /// the contiguous run of pending entries starting at its head, but only
    /// while the head itself is eligible at `now`. A resource whose head is
    /// backing off or failed contributes nothing, so a later mutation is
    /// never transmitted before an earlier one reached a terminal outcome.
    pub fn dequeue_batch(&self, max: usize, now: DateTime<Utc>) -> KeelResult<Vec<ResourceBatch>> {
        self.with_inner(|inner| {
            let mut batches: Vec<ResourceBatch> = Vec::new();
            // Resources blocked by a failed or ineligible head entry.
            let mut blocked: Vec<&str> = Vec::new();
            let mut taken = 0usize;

            for entry in inner.entries.values() {
                if taken >= max {
                    break;
                }
                if blocked.iter().any(|r| *r == entry.resource_id) {
                    continue;
                }
                match entry.status {
                    QueueEntryStatus::Completed => continue,
                    QueueEntryStatus::Failed => {
                        blocked.push(&entry.resource_id);
                        continue;
                    }
                    QueueEntryStatus::Pending => {}
                }
                if !entry.eligible(now) {
                    blocked.push(&entry.resource_id);
                    continue;
                }
                match batches
                    .iter_mut()
                    .find(|b| b.resource_id == entry.resource_id)
                {
                    Some(batch) => batch.entries.push(entry.clone()),
                    None => batches.push(ResourceBatch {
                        resource_id: entry.resource_id.clone(),
                        resource_type: entry.resource_type.clone(),
                        entries: vec![entry.clone()],
                    }),
                }
                taken += 1;
            }
            Ok(batches)
        })
    }

    fn update_entry<F>(&self, id: u64, f: F) -> KeelResult<()>
    where
        F: FnOnce(&mut QueueEntry),
    {
        self.with_inner(|inner| {
            let entry = inner
                .entries
                .get_mut(&id)
                .ok_or_else(|| to_store_err(format!("queue entry #{id} not found")))?;
            f(entry);
            let snapshot = entry.clone();
            self.persist(&snapshot)?;
            Ok(())
        })
    }

    /// Transition an entry to its `Completed` terminal state.
    pub fn mark_completed(&self, id: u64) -> KeelResult<()> {
        self.update_entry(id, |e| e.status = QueueEntryStatus::Completed)
    }

    /// Transition an entry to its `Failed` terminal state. Never
    /// auto-retried.
    pub fn mark_failed(&self, id: u64) -> KeelResult<()> {
        self.update_entry(id, |e| e.status = QueueEntryStatus::Failed)
    }

    /// Record a transmission attempt and schedule the next one.
    pub fn record_attempt(&self, id: u64, next_attempt_at: DateTime<Utc>) -> KeelResult<u32> {
        let mut attempts = 0;
        self.update_entry(id, |e| {
            e.attempt_count += 1;
            e.next_attempt_at = next_attempt_at;
            attempts = e.attempt_count;
        })?;
        Ok(attempts)
    }

    /// Reset every `Failed` entry to `Pending` with a fresh retry budget.
    /// Returns the `(resource_type, resource_id)` pairs that were resumed.
    pub fn reset_failed(&self, now: DateTime<Utc>) -> KeelResult<Vec<(String, String)>> {
        self.with_inner(|inner| {
            let mut resumed = Vec::new();
            // Collect ids first; persisting borrows the entry immutably.
            let failed: Vec<u64> = inner
                .entries
                .values()
                .filter(|e| e.status == QueueEntryStatus::Failed)
                .map(|e| e.id)
                .collect();
            for id in failed {
                let Some(entry) = inner.entries.get_mut(&id) else {
                    continue;
                };
                entry.status = QueueEntryStatus::Pending;
                entry.attempt_count = 0;
                entry.next_attempt_at = now;
                let pair = (entry.resource_type.clone(), entry.resource_id.clone());
                let snapshot = entry.clone();
                self.persist(&snapshot)?;
                if !resumed.contains(&pair) {
                    resumed.push(pair);
                }
            }
            Ok(resumed)
        })
    }

    /// Whether the resource still has non-terminal entries queued.
    pub fn has_pending(&self, resource_id: &str) -> KeelResult<bool> {
        self.with_inner(|inner| {
            Ok(inner
                .entries
                .values()
                .any(|e| e.resource_id == resource_id && e.status == QueueEntryStatus::Pending))
        })
    }

    /// Count of pending entries across all resources.
    pub fn pending_count(&self) -> KeelResult<usize> {
        self.with_inner(|inner| {
            Ok(inner
                .entries
                .values()
                .filter(|e| e.status == QueueEntryStatus::Pending)
                .count())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBackend;
    use chrono::Duration;

    fn queue() -> MutationQueue {
        MutationQueue::new(Arc::new(MemoryBackend::new())).unwrap()
    }

    fn enqueue(q: &MutationQueue, resource: &str, now: DateTime<Utc>) -> u64 {
        q.enqueue(resource, "task", MutationOp::Update, BTreeMap::new(), 1, now)
            .unwrap()
    }

    #[test]
    fn ids_are_monotonic() {
        let q = queue();
        let now = Utc::now();
        let a = enqueue(&q, "r1", now);
        let b = enqueue(&q, "r1", now);
        assert!(b > a);
    }

    #[test]
    fn batch_preserves_per_resource_order() {
        let q = queue();
        let now = Utc::now();
        enqueue(&q, "r1", now);
        enqueue(&q, "r2", now);
        enqueue(&q, "r1", now);

        let batches = q.dequeue_batch(10, now).unwrap();
        assert_eq!(batches.len(), 2);
        let r1 = batches.iter().find(|b| b.resource_id == "r1").unwrap();
        assert_eq!(r1.entries.len(), 2);
        assert!(r1.entries[0].id < r1.entries[1].id);
    }

    #[test]
    fn backing_off_head_blocks_the_whole_resource() {
        let q = queue();
        let now = Utc::now();
        let head = enqueue(&q, "r1", now);
        enqueue(&q, "r1", now);
        q.record_attempt(head, now + Duration::seconds(60)).unwrap();

        let batches = q.dequeue_batch(10, now).unwrap();
        assert!(batches.is_empty(), "later entries must not jump the queue");
    }

    #[test]
    fn failed_head_blocks_until_reset() {
        let q = queue();
        let now = Utc::now();
        let head = enqueue(&q, "r1", now);
        enqueue(&q, "r1", now);
        q.mark_failed(head).unwrap();

        assert!(q.dequeue_batch(10, now).unwrap().is_empty());

        let resumed = q.reset_failed(now).unwrap();
        assert_eq!(resumed, vec![("task".to_string(), "r1".to_string())]);
        let batches = q.dequeue_batch(10, now).unwrap();
        assert_eq!(batches[0].entries.len(), 2);
        assert_eq!(batches[0].entries[0].attempt_count, 0);
    }

    #[test]
    fn rehydrates_from_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let now = Utc::now();
        {
            let q = MutationQueue::new(backend.clone()).unwrap();
            q.enqueue("r1", "task", MutationOp::Create, BTreeMap::new(), 1, now)
                .unwrap();
        }
        let q = MutationQueue::new(backend).unwrap();
        assert_eq!(q.pending_count().unwrap(), 1);
        let next = enqueue(&q, "r2", now);
        assert_eq!(next, 2, "id counter resumes past persisted entries");
    }
}

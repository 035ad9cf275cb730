//! SyncEngine: the public face of the engine.
//!
//! Explicitly constructed with its backend and remote endpoint, owns
//! every component, and exposes the mutation/conflict/sync API to the
//! host. No global singletons; multiple engines can coexist.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;

use keel_core::config::EngineConfig;
use keel_core::conflict::{ConflictStatus, SyncConflict};
use keel_core::errors::{KeelError, KeelResult, StoreError, SyncError};
use keel_core::event::{EventMetadata, UpdateActor, UpdateEvent};
use keel_core::mutation::MutationOp;
use keel_core::record::{FieldValue, Record, SyncStatus};
use keel_core::traits::{KeyValueBackend, RemoteEndpoint};
use keel_store::{ConflictStore, LocalStore, MutationQueue};

use crate::broadcast::Broadcaster;
use crate::coordinator::{SyncCoordinator, SyncReport};
use crate::monitor::{ConnState, NetworkMonitor};
use crate::resolve::{self, Strategy};
use crate::sync_log::{SyncLog, SyncLogEntry};

/// Result of a `resolve_conflict` call.
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    /// True once every field conflict in the set has a resolution.
    pub resolved: bool,
    /// Fields still awaiting a manual value.
    pub pending_fields: Vec<String>,
    /// The merged record, present on full resolution.
    pub record: Option<Record>,
}

/// The offline-first data engine.
pub struct SyncEngine {
    store: Arc<LocalStore>,
    queue: Arc<MutationQueue>,
    conflicts: Arc<ConflictStore>,
    broadcaster: Arc<Broadcaster>,
    coordinator: Arc<SyncCoordinator>,
    monitor: NetworkMonitor,
    log: Arc<SyncLog>,
}

impl SyncEngine {
    /// Construct an engine over the given backend and remote endpoint.
    /// Starts offline; the host reports connectivity via
    /// [`SyncEngine::report_connectivity`].
    pub fn new(
        backend: Arc<dyn KeyValueBackend>,
        remote: Arc<dyn RemoteEndpoint>,
        mut config: EngineConfig,
    ) -> KeelResult<Self> {
        config.clamp();
        let store = Arc::new(LocalStore::new(Arc::clone(&backend)));
        let queue = Arc::new(MutationQueue::new(Arc::clone(&backend))?);
        let conflicts = Arc::new(ConflictStore::new(Arc::clone(&backend)));
        let broadcaster = Arc::new(Broadcaster::new());
        let log = Arc::new(SyncLog::new());
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&conflicts),
            Arc::clone(&broadcaster),
            remote,
            backend,
            Arc::clone(&log),
            config.clone(),
        ));

        let monitor = NetworkMonitor::new(
            ConnState::Offline,
            Duration::from_millis(config.monitor.settle_window_ms),
        );
        // Reconnection only enqueues work: the run happens off the
        // monitor's timer thread.
        let trigger = Arc::clone(&coordinator);
        monitor.subscribe(move || {
            let coordinator = Arc::clone(&trigger);
            thread::spawn(move || {
                if let Err(e) = coordinator.run() {
                    tracing::warn!("sync: reconnect-triggered run failed: {e}");
                }
            });
        });

        Ok(Self {
            store,
            queue,
            conflicts,
            broadcaster,
            coordinator,
            monitor,
            log,
        })
    }

    // --- Mutations ---

    /// Create a record locally and queue it for push.
    pub fn create_record(
        &self,
        record_type: &str,
        id: &str,
        fields: BTreeMap<String, serde_json::Value>,
    ) -> KeelResult<Record> {
        validate_resource(record_type, id)?;
        validate_field_names(fields.keys())?;
        let now = Utc::now();
        let payload: BTreeMap<String, FieldValue> = fields
            .into_iter()
            .map(|(name, value)| (name, FieldValue::new(value, now)))
            .collect();

        let record = Record::new_local(id, record_type, payload.clone(), now);
        self.store.put(&record, None)?;
        self.queue
            .enqueue(id, record_type, MutationOp::Create, payload, record.version, now)?;
        self.publish_local(&record, record.payload.keys().cloned().collect());
        Ok(record)
    }

    /// Apply a field delta to a record and queue it for push.
    pub fn update_record(
        &self,
        record_type: &str,
        id: &str,
        delta: BTreeMap<String, serde_json::Value>,
    ) -> KeelResult<Record> {
        validate_resource(record_type, id)?;
        if delta.is_empty() {
            return Err(KeelError::Sync(SyncError::Validation {
                reason: "update delta is empty".to_string(),
            }));
        }
        validate_field_names(delta.keys())?;

        let mut record = self.get_required(record_type, id)?;
        let expected = record.version;
        let now = Utc::now();
        let delta: BTreeMap<String, FieldValue> = delta
            .into_iter()
            .map(|(name, value)| (name, FieldValue::new(value, now)))
            .collect();
        let changed_fields: Vec<String> = delta.keys().cloned().collect();
        for (name, fv) in &delta {
            record.payload.insert(name.clone(), fv.clone());
        }
        record.version += 1;
        record.updated_at = now;
        // Conflicted and failed records keep their status until resolved
        // or force-resumed; everything else returns to pending.
        if matches!(record.sync_status, SyncStatus::Synced | SyncStatus::Pending) {
            record.sync_status = SyncStatus::Pending;
        }
        self.store.put(&record, Some(expected))?;
        self.queue
            .enqueue(id, record_type, MutationOp::Update, delta, record.version, now)?;
        self.publish_local(&record, changed_fields);
        Ok(record)
    }

    /// Delete a record locally and queue the deletion for push.
    pub fn delete_record(&self, record_type: &str, id: &str) -> KeelResult<()> {
        validate_resource(record_type, id)?;
        let record = self.get_required(record_type, id)?;
        let now = Utc::now();
        self.store.delete(record_type, id)?;
        self.queue.enqueue(
            id,
            record_type,
            MutationOp::Delete,
            BTreeMap::new(),
            record.version,
            now,
        )?;
        self.broadcaster.publish(&UpdateEvent {
            resource_id: id.to_string(),
            resource_type: record_type.to_string(),
            actor: UpdateActor::LocalEdit,
            changed_fields: Vec::new(),
            applied_version: record.version,
            metadata: EventMetadata::default(),
        });
        Ok(())
    }

    // --- Queries ---

    pub fn get_record(&self, record_type: &str, id: &str) -> KeelResult<Option<Record>> {
        self.store.get(record_type, id)
    }

    pub fn get_sync_status(&self, record_type: &str, id: &str) -> KeelResult<Option<SyncStatus>> {
        Ok(self.store.get(record_type, id)?.map(|r| r.sync_status))
    }

    /// Every conflict set still awaiting resolution.
    pub fn list_conflicts(&self) -> KeelResult<Vec<SyncConflict>> {
        self.conflicts.list_pending()
    }

    /// Snapshot of the push/pull diagnostics log.
    pub fn sync_log(&self) -> Vec<SyncLogEntry> {
        self.log.entries()
    }

    // --- Conflict resolution ---

    /// Resolve a conflict set with the given strategy.
    ///
    /// With [`Strategy::Manual`], `manual_values` supplies per-field
    /// values; the record stays in conflict until every field has one.
    /// On full resolution the record becomes `Synced` at
    /// `max(local, remote) + 1`.
    pub fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: Strategy,
        manual_values: Option<&BTreeMap<String, serde_json::Value>>,
    ) -> KeelResult<ResolveOutcome> {
        let mut conflict =
            self.conflicts
                .get(conflict_id)?
                .ok_or(KeelError::Sync(SyncError::ConflictNotFound {
                    conflict_id: conflict_id.to_string(),
                }))?;
        if conflict.status == ConflictStatus::Resolved {
            return Ok(ResolveOutcome {
                resolved: true,
                pending_fields: Vec::new(),
                record: None,
            });
        }

        let empty = BTreeMap::new();
        resolve::apply(&mut conflict, strategy, manual_values.unwrap_or(&empty));

        if !conflict.fully_resolved() {
            self.conflicts.record(&conflict)?;
            return Ok(ResolveOutcome {
                resolved: false,
                pending_fields: conflict.unresolved_fields(),
                record: None,
            });
        }

        let mut record = self.get_required(&conflict.resource_type, &conflict.resource_id)?;
        let expected = record.version;
        let now = Utc::now();
        for field in &conflict.conflicts {
            if let Some(value) = &field.resolved_value {
                record
                    .payload
                    .insert(field.field.clone(), FieldValue::new(value.clone(), now));
            }
        }
        record.version = record.version.max(conflict.remote_version) + 1;
        record.mark_synced(now);

        // Another divergence may still be outstanding for this resource.
        let others_pending = self
            .conflicts
            .pending_for(&conflict.resource_id)?
            .iter()
            .any(|c| c.id != conflict.id);
        if others_pending {
            record.sync_status = SyncStatus::Conflict;
        }

        self.store.put(&record, Some(expected))?;
        conflict.status = ConflictStatus::Resolved;
        self.conflicts.record(&conflict)?;

        self.broadcaster.publish(&UpdateEvent {
            resource_id: record.id.clone(),
            resource_type: record.record_type.clone(),
            actor: UpdateActor::Resolver,
            changed_fields: conflict.conflicts.iter().map(|c| c.field.clone()).collect(),
            applied_version: record.version,
            metadata: EventMetadata::default(),
        });
        tracing::info!(
            "sync: conflict {} resolved for {} at v{}",
            conflict.id,
            record.id,
            record.version
        );
        Ok(ResolveOutcome {
            resolved: true,
            pending_fields: Vec::new(),
            record: Some(record),
        })
    }

    // --- Sync control ---

    /// Run a sync cycle now (coalesced with any in-flight run).
    pub fn sync_now(&self) -> KeelResult<SyncReport> {
        self.coordinator.run()
    }

    /// Reset every `Failed` queue entry and record to `Pending`, then run.
    pub fn force_sync_now(&self) -> KeelResult<SyncReport> {
        let now = Utc::now();
        let resumed = self.queue.reset_failed(now)?;
        for (record_type, id) in &resumed {
            if let Some(mut record) = self.store.get(record_type, id)? {
                if record.sync_status == SyncStatus::Failed {
                    record.sync_status = SyncStatus::Pending;
                    self.store.put(&record, Some(record.version))?;
                }
            }
        }
        if !resumed.is_empty() {
            tracing::info!("sync: force-resumed {} resource(s)", resumed.len());
        }
        self.coordinator.run()
    }

    /// Feed a connectivity observation; a settled reconnect triggers a run.
    pub fn report_connectivity(&self, state: ConnState) {
        self.monitor.report(state);
    }

    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Register a subscriber for applied-change events.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        self.broadcaster.subscribe(callback);
    }

    /// Stop reacting to connectivity; pending settle timers become no-ops.
    /// In-flight queue entries keep their pre-run status.
    pub fn shutdown(&self) {
        self.monitor.shutdown();
    }

    fn get_required(&self, record_type: &str, id: &str) -> KeelResult<Record> {
        self.store
            .get(record_type, id)?
            .ok_or(KeelError::Store(StoreError::RecordNotFound {
                resource_type: record_type.to_string(),
                resource_id: id.to_string(),
            }))
    }

    fn publish_local(&self, record: &Record, changed_fields: Vec<String>) {
        self.broadcaster.publish(&UpdateEvent {
            resource_id: record.id.clone(),
            resource_type: record.record_type.clone(),
            actor: UpdateActor::LocalEdit,
            changed_fields,
            applied_version: record.version,
            metadata: EventMetadata::default(),
        });
    }
}

fn validate_resource(record_type: &str, id: &str) -> KeelResult<()> {
    if record_type.trim().is_empty() || id.trim().is_empty() {
        return Err(KeelError::Sync(SyncError::Validation {
            reason: "resource type and id must be non-empty".to_string(),
        }));
    }
    Ok(())
}

fn validate_field_names<'a>(names: impl Iterator<Item = &'a String>) -> KeelResult<()> {
    for name in names {
        if name.trim().is_empty() {
            return Err(KeelError::Sync(SyncError::Validation {
                reason: "field names must be non-empty".to_string(),
            }));
        }
    }
    Ok(())
}

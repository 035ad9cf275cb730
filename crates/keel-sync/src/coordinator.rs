//! Sync coordinator: drains the outbox, pulls remote deltas, routes
//! divergence through the detector/resolver path, and publishes events.

use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, Duration, Utc};

use keel_core::config::EngineConfig;
use keel_core::constants;
use keel_core::errors::{KeelError, KeelResult, SyncError};
use keel_core::event::{EventMetadata, EventPriority, UpdateActor, UpdateEvent};
use keel_core::mutation::QueueEntry;
use keel_core::record::{Record, RecordPayload, SyncStatus};
use keel_core::traits::{KeyValueBackend, PushOutcome, RemoteEndpoint};
use keel_core::conflict::{ConflictStatus, SyncConflict};
use keel_store::{keys, ConflictStore, LocalStore, MutationQueue, ResourceBatch};

use crate::broadcast::Broadcaster;
use crate::detect;
use crate::sync_log::{LogDirection, LogOutcome, SyncLog};

/// Summary of one coordinator run.
#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    /// Queue entries accepted by the remote.
    pub pushed: usize,
    /// Queue entries the remote rejected as diverged.
    pub push_rejected: usize,
    /// Queue entries that exhausted their retry budget this run.
    pub entries_failed: usize,
    /// Remote records received from the pull.
    pub pulled: usize,
    /// Pulled records applied directly (local unmodified or absent).
    pub fast_forwarded: usize,
    /// Pulled records merged field-wise without the resolver.
    pub auto_merged: usize,
    /// New conflict sets recorded this run.
    pub conflicts_flagged: usize,
    /// The pull failed transiently; the cursor is unchanged.
    pub pull_failed: bool,
    /// This trigger collapsed into an already-running cycle.
    pub coalesced: bool,
}

#[derive(Default)]
struct RunState {
    running: bool,
    queued: bool,
}

/// Top-level orchestrator. `run()` is idempotent (no new mutations means
/// no observable state change) and self-collapsing: triggers arriving
/// while a cycle is in flight coalesce into at most one queued follow-up.
pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    queue: Arc<MutationQueue>,
    conflicts: Arc<ConflictStore>,
    broadcaster: Arc<Broadcaster>,
    remote: Arc<dyn RemoteEndpoint>,
    backend: Arc<dyn KeyValueBackend>,
    log: Arc<SyncLog>,
    config: EngineConfig,
    run_state: Mutex<RunState>,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<LocalStore>,
        queue: Arc<MutationQueue>,
        conflicts: Arc<ConflictStore>,
        broadcaster: Arc<Broadcaster>,
        remote: Arc<dyn RemoteEndpoint>,
        backend: Arc<dyn KeyValueBackend>,
        log: Arc<SyncLog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            conflicts,
            broadcaster,
            remote,
            backend,
            log,
            config,
            run_state: Mutex::new(RunState::default()),
        }
    }

    /// Execute one push-then-pull cycle, coalescing concurrent triggers.
    pub fn run(&self) -> KeelResult<SyncReport> {
        {
            let mut state = self.run_state.lock().unwrap_or_else(|e| e.into_inner());
            if state.running {
                state.queued = true;
                tracing::debug!("sync: run in flight, trigger coalesced");
                return Ok(SyncReport {
                    coalesced: true,
                    ..SyncReport::default()
                });
            }
            state.running = true;
        }
        loop {
            let result = self.cycle();
            let mut state = self.run_state.lock().unwrap_or_else(|e| e.into_inner());
            match result {
                Ok(report) => {
                    if state.queued {
                        state.queued = false;
                        continue;
                    }
                    state.running = false;
                    return Ok(report);
                }
                Err(e) => {
                    state.running = false;
                    state.queued = false;
                    return Err(e);
                }
            }
        }
    }

    /// Push eligible queue entries, then pull remote changes. Push-first
    /// ordering keeps a pull from clobbering in-flight local edits it has
    /// not yet observed.
    fn cycle(&self) -> KeelResult<SyncReport> {
        let mut report = SyncReport::default();
        let now = Utc::now();
        self.push_phase(now, &mut report)?;
        self.pull_phase(now, &mut report)?;
        tracing::info!(
            "sync: cycle done, pushed {} pulled {} conflicts {}",
            report.pushed,
            report.pulled,
            report.conflicts_flagged
        );
        Ok(report)
    }

    fn push_phase(&self, now: DateTime<Utc>, report: &mut SyncReport) -> KeelResult<()> {
        let batches = self.queue.dequeue_batch(self.config.sync.batch_size, now)?;
        let mut ready = Vec::new();
        for batch in batches {
            // Resources with an open conflict hold their queue until the
            // conflict is resolved.
            let held = match self.store.get(&batch.resource_type, &batch.resource_id)? {
                Some(record) => record.sync_status == SyncStatus::Conflict,
                None => false,
            };
            if held {
                tracing::debug!("sync: holding queue for conflicted {}", batch.resource_id);
                continue;
            }
            ready.push(batch);
        }

        // Distinct resources transmit concurrently up to the configured
        // limit; outcomes are applied serially afterwards.
        for chunk in ready.chunks(self.config.sync.push_concurrency) {
            let mut results: Vec<(ResourceBatch, Vec<(QueueEntry, KeelResult<PushOutcome>)>)> =
                Vec::with_capacity(chunk.len());
            thread::scope(|scope| {
                let mut handles = Vec::with_capacity(chunk.len());
                for batch in chunk {
                    let remote = &*self.remote;
                    handles.push((batch, scope.spawn(move || transmit(remote, batch))));
                }
                for (batch, handle) in handles {
                    let outcomes = handle.join().unwrap_or_default();
                    results.push((batch.clone(), outcomes));
                }
            });
            for (batch, outcomes) in results {
                self.apply_push_outcomes(&batch, outcomes, now, report)?;
            }
        }
        Ok(())
    }

    fn apply_push_outcomes(
        &self,
        batch: &ResourceBatch,
        outcomes: Vec<(QueueEntry, KeelResult<PushOutcome>)>,
        now: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> KeelResult<()> {
        let mut all_accepted = !outcomes.is_empty();
        let mut changed_fields: Vec<String> = Vec::new();

        for (entry, outcome) in outcomes {
            // Endpoints may report divergence either way.
            let outcome = match outcome {
                Err(KeelError::Sync(SyncError::RemoteRejected { remote_version, .. })) => {
                    Ok(PushOutcome::Rejected { remote_version })
                }
                other => other,
            };
            match outcome {
                Ok(PushOutcome::Accepted) => {
                    self.queue.mark_completed(entry.id)?;
                    for field in entry.delta.keys() {
                        if !changed_fields.contains(field) {
                            changed_fields.push(field.clone());
                        }
                    }
                    self.log.record(
                        LogDirection::Push,
                        &entry.resource_id,
                        LogOutcome::Accepted,
                        format!("entry #{}", entry.id),
                    );
                    report.pushed += 1;
                }
                Ok(PushOutcome::Rejected { remote_version }) => {
                    // Expected control flow: the entry is done. The record
                    // keeps its current status; it becomes `Conflict` only
                    // when the pull delivers the remote copy and the
                    // detector records the conflict set, so a conflicted
                    // status always has a resolvable conflict behind it.
                    self.queue.mark_completed(entry.id)?;
                    self.log.record(
                        LogDirection::Push,
                        &entry.resource_id,
                        LogOutcome::Rejected,
                        format!("remote at v{remote_version}"),
                    );
                    tracing::info!(
                        "sync: push rejected for {}, remote at v{remote_version}",
                        entry.resource_id
                    );
                    report.push_rejected += 1;
                    all_accepted = false;
                    break;
                }
                Err(e) if e.is_transient() => {
                    let next_attempt = entry.attempt_count + 1;
                    // The hard cap keeps the delay inside signed range even
                    // for a config that skipped `clamp()`.
                    let delay_ms = self
                        .config
                        .retry
                        .backoff_ms(next_attempt)
                        .min(constants::MAX_CONFIGURABLE_BACKOFF_MS)
                        as i64;
                    let attempts = self
                        .queue
                        .record_attempt(entry.id, now + Duration::milliseconds(delay_ms))?;
                    if attempts >= self.config.retry.max_attempts {
                        self.queue.mark_failed(entry.id)?;
                        if let Some(mut record) =
                            self.store.get(&entry.resource_type, &entry.resource_id)?
                        {
                            record.sync_status = SyncStatus::Failed;
                            self.store.put(&record, Some(record.version))?;
                        }
                        self.log.record(
                            LogDirection::Push,
                            &entry.resource_id,
                            LogOutcome::Failed,
                            format!("retries exhausted after {attempts} attempts"),
                        );
                        tracing::warn!(
                            "sync: entry #{} for {} failed after {attempts} attempts: {e}",
                            entry.id,
                            entry.resource_id
                        );
                        report.entries_failed += 1;
                    } else {
                        self.log.record(
                            LogDirection::Push,
                            &entry.resource_id,
                            LogOutcome::Retried,
                            format!("attempt {attempts}: {e}"),
                        );
                        tracing::debug!(
                            "sync: transient push failure for {}, attempt {attempts}",
                            entry.resource_id
                        );
                    }
                    all_accepted = false;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if all_accepted {
            self.finalize_resource(batch, changed_fields, now)?;
        }
        Ok(())
    }

    /// Every queued mutation for the resource was accepted: mark the
    /// record synced and publish the applied change.
    fn finalize_resource(
        &self,
        batch: &ResourceBatch,
        changed_fields: Vec<String>,
        now: DateTime<Utc>,
    ) -> KeelResult<()> {
        if self.queue.has_pending(&batch.resource_id)? {
            return Ok(());
        }
        let applied_version = match self.store.get(&batch.resource_type, &batch.resource_id)? {
            Some(mut record) => {
                if record.sync_status == SyncStatus::Pending {
                    record.mark_synced(now);
                    self.store.put(&record, Some(record.version))?;
                }
                record.version
            }
            // Deleted locally; the accepted push removed it remotely.
            None => batch.entries.last().map(|e| e.base_version).unwrap_or(0),
        };
        self.broadcaster.publish(&UpdateEvent {
            resource_id: batch.resource_id.clone(),
            resource_type: batch.resource_type.clone(),
            actor: UpdateActor::LocalEdit,
            changed_fields,
            applied_version,
            metadata: EventMetadata::default(),
        });
        Ok(())
    }

    fn pull_phase(&self, now: DateTime<Utc>, report: &mut SyncReport) -> KeelResult<()> {
        let cursor = self.backend.get(keys::CURSOR)?;
        let batch = match self.remote.pull(cursor.as_deref()) {
            Ok(batch) => batch,
            Err(e) if e.is_transient() => {
                // Cursor untouched; the next trigger retries the pull.
                tracing::warn!("sync: pull failed transiently: {e}");
                report.pull_failed = true;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        report.pulled = batch.records.len();
        for payload in &batch.records {
            self.apply_remote(payload, now, report)?;
        }
        if let Some(cursor) = batch.cursor {
            self.backend.put(keys::CURSOR, &cursor)?;
        }
        Ok(())
    }

    /// Reconcile one pulled record against local state: fast-forward,
    /// disjoint auto-merge, or conflict.
    fn apply_remote(
        &self,
        remote: &RecordPayload,
        now: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> KeelResult<()> {
        let local = self.store.get(&remote.record_type, &remote.id)?;
        let Some(local) = local else {
            // Unknown locally: install as synced.
            let record = Record {
                id: remote.id.clone(),
                record_type: remote.record_type.clone(),
                payload: remote.payload.clone(),
                version: remote.version,
                base_version: remote.version,
                updated_at: remote.modified_at,
                synced_at: now,
                sync_status: SyncStatus::Synced,
            };
            self.store.put(&record, None)?;
            self.publish_remote(&record, record.payload.keys().cloned().collect(), false);
            self.log.record(
                LogDirection::Pull,
                &remote.id,
                LogOutcome::Applied,
                format!("installed at v{}", remote.version),
            );
            report.fast_forwarded += 1;
            return Ok(());
        };

        // Already incorporated: re-applying an identical pull is a no-op.
        if remote.version <= local.base_version {
            return Ok(());
        }

        if !local.locally_modified() {
            return self.fast_forward(&local, remote, now, report);
        }

        // A never-synced record shares no ancestor with the remote, so
        // every field on both sides counts as modified since.
        let ancestor = if local.base_version == 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            local.synced_at
        };
        let conflict_fields = detect::compare(&local, remote, ancestor);
        let merge_fields: Vec<String> = detect::auto_mergeable(&local, remote, ancestor)
            .into_iter()
            .map(str::to_string)
            .collect();

        if conflict_fields.is_empty() {
            if merge_fields.is_empty() {
                // Remote moved on fields that agree with ours; the pending
                // push will reconcile versions.
                return Ok(());
            }
            let mut record = local.clone();
            for field in &merge_fields {
                if let Some(fv) = remote.payload.get(field) {
                    record.payload.insert(field.clone(), fv.clone());
                }
            }
            record.version += 1;
            record.updated_at = now;
            self.store.put(&record, Some(local.version))?;
            self.publish_remote(&record, merge_fields, false);
            self.log.record(
                LogDirection::Pull,
                &remote.id,
                LogOutcome::Applied,
                "auto-merged disjoint fields",
            );
            report.auto_merged += 1;
            return Ok(());
        }

        // Same fields edited on both sides: flag for resolution. Skip if
        // this divergence is already recorded (pull idempotence).
        let already_flagged = self
            .conflicts
            .pending_for(&remote.id)?
            .iter()
            .any(|c| c.remote_version == remote.version);
        if already_flagged {
            return Ok(());
        }

        // The conflict set is persisted before the status flips, keeping
        // `Conflict` status equivalent to "a pending conflict set exists".
        let conflict = SyncConflict {
            id: uuid::Uuid::new_v4().to_string(),
            resource_id: remote.id.clone(),
            resource_type: remote.record_type.clone(),
            remote_version: remote.version,
            conflicts: conflict_fields,
            status: ConflictStatus::Pending,
            detected_at: now,
        };
        self.conflicts.record(&conflict)?;

        let mut record = local.clone();
        for field in &merge_fields {
            if let Some(fv) = remote.payload.get(field) {
                record.payload.insert(field.clone(), fv.clone());
            }
        }
        if !merge_fields.is_empty() {
            record.version += 1;
            record.updated_at = now;
        }
        record.sync_status = SyncStatus::Conflict;
        self.store.put(&record, Some(local.version))?;
        self.publish_remote(&record, merge_fields, true);
        self.log.record(
            LogDirection::Pull,
            &remote.id,
            LogOutcome::ConflictFlagged,
            format!("{} field(s) diverged", conflict.conflicts.len()),
        );
        tracing::info!(
            "sync: conflict flagged for {} against remote v{}",
            remote.id,
            remote.version
        );
        report.conflicts_flagged += 1;
        Ok(())
    }

    fn fast_forward(
        &self,
        local: &Record,
        remote: &RecordPayload,
        now: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> KeelResult<()> {
        let changed: Vec<String> = remote
            .payload
            .iter()
            .filter(|(field, fv)| local.payload.get(*field).map(|l| &l.value) != Some(&fv.value))
            .map(|(field, _)| field.clone())
            .collect();

        let record = Record {
            id: local.id.clone(),
            record_type: local.record_type.clone(),
            payload: remote.payload.clone(),
            version: remote.version,
            base_version: remote.version,
            updated_at: remote.modified_at,
            synced_at: now,
            sync_status: SyncStatus::Synced,
        };
        self.store.put(&record, Some(local.version))?;
        if !changed.is_empty() {
            self.publish_remote(&record, changed, false);
        }
        self.log.record(
            LogDirection::Pull,
            &remote.id,
            LogOutcome::Applied,
            format!("fast-forward to v{}", remote.version),
        );
        report.fast_forwarded += 1;
        Ok(())
    }

    fn publish_remote(&self, record: &Record, changed_fields: Vec<String>, requires_action: bool) {
        self.broadcaster.publish(&UpdateEvent {
            resource_id: record.id.clone(),
            resource_type: record.record_type.clone(),
            actor: UpdateActor::RemoteSync,
            changed_fields,
            applied_version: record.version,
            metadata: EventMetadata {
                priority: if requires_action {
                    EventPriority::High
                } else {
                    EventPriority::Normal
                },
                impact: EventPriority::Normal,
                requires_action,
            },
        });
    }
}

/// Transmit one resource's entries in order, stopping at the first
/// non-accepted outcome so later mutations never overtake an earlier one.
/// Each push is atomic at single-record granularity.
fn transmit(
    remote: &dyn RemoteEndpoint,
    batch: &ResourceBatch,
) -> Vec<(QueueEntry, KeelResult<PushOutcome>)> {
    let mut out = Vec::with_capacity(batch.entries.len());
    for entry in &batch.entries {
        let result = remote.push(entry);
        let stop = !matches!(result, Ok(PushOutcome::Accepted));
        out.push((entry.clone(), result));
        if stop {
            break;
        }
    }
    out
}

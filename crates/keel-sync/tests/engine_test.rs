//! End-to-end engine scenarios against a scripted remote endpoint.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};

use keel_core::config::EngineConfig;
use keel_core::errors::{KeelError, KeelResult, SyncError};
use keel_core::event::{UpdateActor, UpdateEvent};
use keel_core::mutation::QueueEntry;
use keel_core::record::{FieldValue, RecordPayload, SyncStatus};
use keel_core::traits::{PullBatch, PushOutcome, RemoteEndpoint};
use keel_store::{MemoryBackend, SqliteBackend};
use keel_sync::{ConnState, Strategy, SyncEngine};

enum PushScript {
    Accept,
    Reject { remote_version: u64 },
    Transient,
}

enum PullScript {
    Batch(PullBatch),
    Transient,
}

/// Scripted remote: push outcomes queued per resource, pull batches
/// queued globally. Unscripted calls accept / return an empty batch.
#[derive(Default)]
struct FakeRemote {
    push_scripts: Mutex<HashMap<String, VecDeque<PushScript>>>,
    pull_scripts: Mutex<VecDeque<PullScript>>,
    /// `(resource_id, entry_id)` in transmission order.
    push_order: Mutex<Vec<(String, u64)>>,
    cursors_seen: Mutex<Vec<Option<String>>>,
    pull_count: AtomicUsize,
    in_pull: AtomicUsize,
}

impl FakeRemote {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script_push(&self, resource_id: &str, script: PushScript) {
        self.push_scripts
            .lock()
            .unwrap()
            .entry(resource_id.to_string())
            .or_default()
            .push_back(script);
    }

    fn script_pull(&self, script: PullScript) {
        self.pull_scripts.lock().unwrap().push_back(script);
    }

    fn pushes_for(&self, resource_id: &str) -> Vec<u64> {
        self.push_order
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r == resource_id)
            .map(|(_, id)| *id)
            .collect()
    }
}

impl RemoteEndpoint for FakeRemote {
    fn push(&self, entry: &QueueEntry) -> KeelResult<PushOutcome> {
        self.push_order
            .lock()
            .unwrap()
            .push((entry.resource_id.clone(), entry.id));
        let script = self
            .push_scripts
            .lock()
            .unwrap()
            .get_mut(&entry.resource_id)
            .and_then(|q| q.pop_front());
        match script {
            None | Some(PushScript::Accept) => Ok(PushOutcome::Accepted),
            Some(PushScript::Reject { remote_version }) => {
                Ok(PushOutcome::Rejected { remote_version })
            }
            Some(PushScript::Transient) => Err(KeelError::Sync(SyncError::TransientNetwork {
                reason: "connection reset".to_string(),
            })),
        }
    }

    fn pull(&self, cursor: Option<&str>) -> KeelResult<PullBatch> {
        let prior = self.in_pull.fetch_add(1, Ordering::SeqCst);
        assert_eq!(prior, 0, "sync cycles must never overlap");
        self.pull_count.fetch_add(1, Ordering::SeqCst);
        self.cursors_seen
            .lock()
            .unwrap()
            .push(cursor.map(str::to_string));
        thread::sleep(StdDuration::from_millis(2));
        let script = self.pull_scripts.lock().unwrap().pop_front();
        self.in_pull.fetch_sub(1, Ordering::SeqCst);
        match script {
            None => Ok(PullBatch::default()),
            Some(PullScript::Batch(batch)) => Ok(batch),
            Some(PullScript::Transient) => Err(KeelError::Sync(SyncError::TransientNetwork {
                reason: "timeout".to_string(),
            })),
        }
    }
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.max_attempts = 3;
    config.retry.backoff_base_ms = 0;
    config.retry.max_backoff_ms = 0;
    config.monitor.settle_window_ms = 20;
    config
}

fn engine(remote: Arc<FakeRemote>) -> SyncEngine {
    SyncEngine::new(Arc::new(MemoryBackend::new()), remote, test_config()).unwrap()
}

fn json_fields(entries: &[(&str, &str)]) -> BTreeMap<String, serde_json::Value> {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), serde_json::json!(value)))
        .collect()
}

fn remote_record(id: &str, version: u64, fields: &[(&str, &str, i64)]) -> RecordPayload {
    let base = Utc::now();
    RecordPayload {
        id: id.to_string(),
        record_type: "task".to_string(),
        payload: fields
            .iter()
            .map(|(name, value, offset)| {
                (
                    name.to_string(),
                    FieldValue::new(serde_json::json!(value), base + Duration::seconds(*offset)),
                )
            })
            .collect(),
        version,
        modified_at: base,
    }
}

#[test]
fn accepted_push_marks_record_synced() {
    let remote = FakeRemote::new();
    let engine = engine(Arc::clone(&remote));

    engine
        .create_record("task", "r1", json_fields(&[("title", "A")]))
        .unwrap();
    let report = engine.sync_now().unwrap();

    assert_eq!(report.pushed, 1);
    assert_eq!(
        engine.get_sync_status("task", "r1").unwrap(),
        Some(SyncStatus::Synced)
    );
    let record = engine.get_record("task", "r1").unwrap().unwrap();
    assert_eq!(record.version, record.base_version);
}

#[test]
fn rejected_push_flags_a_conflict_and_resolution_heals_it() {
    let remote = FakeRemote::new();
    // The remote already holds v2 with a different title.
    remote.script_push("r1", PushScript::Reject { remote_version: 2 });
    remote.script_pull(PullScript::Batch(PullBatch {
        records: vec![remote_record("r1", 2, &[("title", "B", 10)])],
        cursor: None,
    }));
    let engine = engine(Arc::clone(&remote));

    engine
        .create_record("task", "r1", json_fields(&[("title", "A")]))
        .unwrap();
    let report = engine.sync_now().unwrap();

    assert_eq!(report.push_rejected, 1);
    assert_eq!(report.conflicts_flagged, 1);
    assert_eq!(
        engine.get_sync_status("task", "r1").unwrap(),
        Some(SyncStatus::Conflict)
    );

    let conflicts = engine.list_conflicts().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflicts.len(), 1);
    assert_eq!(conflicts[0].conflicts[0].field, "title");

    let outcome = engine
        .resolve_conflict(&conflicts[0].id, Strategy::Remote, None)
        .unwrap();
    assert!(outcome.resolved);
    let record = outcome.record.unwrap();
    assert_eq!(record.payload["title"].value, serde_json::json!("B"));
    assert_eq!(record.version, 3, "max(local 1, remote 2) + 1");
    assert_eq!(record.sync_status, SyncStatus::Synced);
    assert!(engine.list_conflicts().unwrap().is_empty());
}

#[test]
fn rejected_push_with_failed_pull_never_strands_the_record() {
    let remote = FakeRemote::new();
    remote.script_push("r1", PushScript::Reject { remote_version: 2 });
    remote.script_pull(PullScript::Transient);
    remote.script_pull(PullScript::Batch(PullBatch {
        records: vec![remote_record("r1", 2, &[("title", "B", 10)])],
        cursor: None,
    }));
    let engine = engine(Arc::clone(&remote));

    engine
        .create_record("task", "r1", json_fields(&[("title", "A")]))
        .unwrap();
    let report = engine.sync_now().unwrap();
    assert_eq!(report.push_rejected, 1);
    assert!(report.pull_failed);

    // Conflict status must never exist without a resolvable conflict set,
    // even when the pull that would record it failed.
    assert_eq!(
        engine.get_sync_status("task", "r1").unwrap(),
        Some(SyncStatus::Pending)
    );
    assert!(engine.list_conflicts().unwrap().is_empty());

    // The next pull delivers the remote copy and flags the divergence.
    let report = engine.sync_now().unwrap();
    assert_eq!(report.conflicts_flagged, 1);
    assert_eq!(
        engine.get_sync_status("task", "r1").unwrap(),
        Some(SyncStatus::Conflict)
    );
    assert_eq!(engine.list_conflicts().unwrap().len(), 1);
}

#[test]
fn update_events_carry_only_the_changed_fields() {
    let remote = FakeRemote::new();
    let engine = engine(remote);
    engine
        .create_record("task", "r1", json_fields(&[("title", "A"), ("notes", "n")]))
        .unwrap();

    let events: Arc<Mutex<Vec<UpdateEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

    engine
        .update_record("task", "r1", json_fields(&[("title", "B")]))
        .unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].changed_fields, vec!["title".to_string()]);
}

#[test]
fn manual_resolution_keeps_conflict_until_every_field_has_a_value() {
    let remote = FakeRemote::new();
    remote.script_push("r1", PushScript::Reject { remote_version: 2 });
    remote.script_pull(PullScript::Batch(PullBatch {
        records: vec![remote_record("r1", 2, &[("title", "B", 10), ("notes", "n2", 10)])],
        cursor: None,
    }));
    let engine = engine(Arc::clone(&remote));

    engine
        .create_record("task", "r1", json_fields(&[("title", "A"), ("notes", "n1")]))
        .unwrap();
    engine.sync_now().unwrap();

    let conflicts = engine.list_conflicts().unwrap();
    assert_eq!(conflicts[0].conflicts.len(), 2);

    let mut manual = BTreeMap::new();
    manual.insert("title".to_string(), serde_json::json!("C"));
    let outcome = engine
        .resolve_conflict(&conflicts[0].id, Strategy::Manual, Some(&manual))
        .unwrap();
    assert!(!outcome.resolved);
    assert_eq!(outcome.pending_fields, vec!["notes".to_string()]);
    assert_eq!(
        engine.get_sync_status("task", "r1").unwrap(),
        Some(SyncStatus::Conflict)
    );

    manual.insert("notes".to_string(), serde_json::json!("n3"));
    let outcome = engine
        .resolve_conflict(&conflicts[0].id, Strategy::Manual, Some(&manual))
        .unwrap();
    assert!(outcome.resolved);
    let record = outcome.record.unwrap();
    assert_eq!(record.payload["title"].value, serde_json::json!("C"));
    assert_eq!(record.payload["notes"].value, serde_json::json!("n3"));
}

#[test]
fn retries_exhaust_into_failed_and_force_sync_resumes() {
    let remote = FakeRemote::new();
    for _ in 0..3 {
        remote.script_push("r1", PushScript::Transient);
    }
    let engine = engine(Arc::clone(&remote));

    engine
        .create_record("task", "r1", json_fields(&[("title", "A")]))
        .unwrap();
    engine.sync_now().unwrap();
    engine.sync_now().unwrap();
    let report = engine.sync_now().unwrap();

    assert_eq!(report.entries_failed, 1);
    assert_eq!(
        engine.get_sync_status("task", "r1").unwrap(),
        Some(SyncStatus::Failed)
    );

    // Failed entries never auto-retry.
    let report = engine.sync_now().unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(remote.pushes_for("r1").len(), 3);

    // Explicit force-sync resets the retry budget and pushes through.
    let report = engine.force_sync_now().unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(
        engine.get_sync_status("task", "r1").unwrap(),
        Some(SyncStatus::Synced)
    );
}

#[test]
fn per_resource_fifo_is_preserved_across_mutations() {
    let remote = FakeRemote::new();
    let engine = engine(Arc::clone(&remote));

    for resource in ["r1", "r2", "r3"] {
        engine
            .create_record("task", resource, json_fields(&[("title", "t")]))
            .unwrap();
    }
    engine
        .update_record("task", "r1", json_fields(&[("title", "t2")]))
        .unwrap();
    engine
        .update_record("task", "r2", json_fields(&[("notes", "n")]))
        .unwrap();

    engine.sync_now().unwrap();

    for resource in ["r1", "r2", "r3"] {
        let ids = remote.pushes_for(resource);
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted, "{resource} entries out of order");
        assert_eq!(
            engine.get_sync_status("task", resource).unwrap(),
            Some(SyncStatus::Synced)
        );
    }
    assert_eq!(remote.pushes_for("r1").len(), 2);
}

#[test]
fn reconnect_triggers_one_settled_sync_run() {
    let remote = FakeRemote::new();
    let engine = engine(Arc::clone(&remote));

    // Offline edits only accumulate in the outbox.
    for resource in ["r1", "r2", "r3"] {
        engine
            .create_record("task", resource, json_fields(&[("title", "t")]))
            .unwrap();
    }
    engine
        .update_record("task", "r1", json_fields(&[("title", "t2")]))
        .unwrap();
    engine
        .update_record("task", "r2", json_fields(&[("notes", "n")]))
        .unwrap();
    assert_eq!(remote.pull_count.load(Ordering::SeqCst), 0);

    let events: Arc<Mutex<Vec<UpdateEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

    // Flapping during the settle window collapses into one run.
    engine.report_connectivity(ConnState::Online);
    engine.report_connectivity(ConnState::Offline);
    engine.report_connectivity(ConnState::Online);
    thread::sleep(StdDuration::from_millis(400));

    assert_eq!(remote.pull_count.load(Ordering::SeqCst), 1);
    for resource in ["r1", "r2", "r3"] {
        assert_eq!(
            engine.get_sync_status("task", resource).unwrap(),
            Some(SyncStatus::Synced)
        );
    }
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 3, "one applied-change event per resource");
    assert!(events.iter().all(|e| e.actor == UpdateActor::LocalEdit));
    engine.shutdown();
}

#[test]
fn pulling_the_same_batch_twice_is_idempotent() {
    let remote = FakeRemote::new();
    remote.script_push("r1", PushScript::Reject { remote_version: 2 });
    let batch = || {
        PullScript::Batch(PullBatch {
            records: vec![remote_record("r1", 2, &[("title", "B", 10)])],
            cursor: None,
        })
    };
    remote.script_pull(batch());
    remote.script_pull(batch());
    let engine = engine(Arc::clone(&remote));

    engine
        .create_record("task", "r1", json_fields(&[("title", "A")]))
        .unwrap();
    engine.sync_now().unwrap();
    let before = engine.get_record("task", "r1").unwrap().unwrap();

    let report = engine.sync_now().unwrap();
    assert_eq!(report.conflicts_flagged, 0, "duplicate divergence not re-flagged");
    assert_eq!(engine.list_conflicts().unwrap().len(), 1);
    let after = engine.get_record("task", "r1").unwrap().unwrap();
    assert_eq!(after.version, before.version);
}

#[test]
fn remote_only_changes_fast_forward_without_conflict() {
    let remote = FakeRemote::new();
    remote.script_pull(PullScript::Batch(PullBatch {
        records: vec![remote_record("r1", 5, &[("title", "B", 10)])],
        cursor: Some("c1".to_string()),
    }));
    let engine = engine(Arc::clone(&remote));

    engine
        .create_record("task", "r1", json_fields(&[("title", "A")]))
        .unwrap();
    let report = engine.sync_now().unwrap();

    // Push accepted first, so the record is unmodified when the pull lands.
    assert_eq!(report.pushed, 1);
    assert_eq!(report.fast_forwarded, 1);
    let record = engine.get_record("task", "r1").unwrap().unwrap();
    assert_eq!(record.version, 5);
    assert_eq!(record.payload["title"].value, serde_json::json!("B"));
    assert_eq!(record.sync_status, SyncStatus::Synced);

    // The cursor advances and is presented on the next pull.
    engine.sync_now().unwrap();
    let cursors = remote.cursors_seen.lock().unwrap();
    assert_eq!(cursors[0], None);
    assert_eq!(cursors[1], Some("c1".to_string()));
}

#[test]
fn unknown_remote_records_install_as_synced() {
    let remote = FakeRemote::new();
    remote.script_pull(PullScript::Batch(PullBatch {
        records: vec![remote_record("r9", 4, &[("title", "new", 10)])],
        cursor: None,
    }));
    let engine = engine(Arc::clone(&remote));

    engine.sync_now().unwrap();
    let record = engine.get_record("task", "r9").unwrap().unwrap();
    assert_eq!(record.version, 4);
    assert_eq!(record.sync_status, SyncStatus::Synced);
}

#[test]
fn transient_pull_failure_leaves_cursor_untouched() {
    let remote = FakeRemote::new();
    remote.script_pull(PullScript::Transient);
    let engine = engine(Arc::clone(&remote));

    let report = engine.sync_now().unwrap();
    assert!(report.pull_failed);

    engine.sync_now().unwrap();
    let cursors = remote.cursors_seen.lock().unwrap();
    assert_eq!(cursors.as_slice(), &[None, None]);
}

#[test]
fn conflicted_resource_holds_its_queue_until_resolved() {
    let remote = FakeRemote::new();
    remote.script_push("r1", PushScript::Reject { remote_version: 2 });
    remote.script_pull(PullScript::Batch(PullBatch {
        records: vec![remote_record("r1", 2, &[("title", "B", 10)])],
        cursor: None,
    }));
    let engine = engine(Arc::clone(&remote));

    engine
        .create_record("task", "r1", json_fields(&[("title", "A")]))
        .unwrap();
    engine.sync_now().unwrap();
    assert_eq!(
        engine.get_sync_status("task", "r1").unwrap(),
        Some(SyncStatus::Conflict)
    );

    // An edit while conflicted queues but does not transmit.
    engine
        .update_record("task", "r1", json_fields(&[("notes", "n")]))
        .unwrap();
    let pushes_before = remote.pushes_for("r1").len();
    engine.sync_now().unwrap();
    assert_eq!(remote.pushes_for("r1").len(), pushes_before);

    let conflicts = engine.list_conflicts().unwrap();
    engine
        .resolve_conflict(&conflicts[0].id, Strategy::Merge, None)
        .unwrap();
    engine.sync_now().unwrap();
    assert!(remote.pushes_for("r1").len() > pushes_before);
}

#[test]
fn concurrent_triggers_coalesce_instead_of_overlapping() {
    let remote = FakeRemote::new();
    let engine = Arc::new(engine(Arc::clone(&remote)));
    engine
        .create_record("task", "r1", json_fields(&[("title", "A")]))
        .unwrap();

    let barrier = Arc::new(std::sync::Barrier::new(10));
    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = Arc::clone(&engine);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            engine.sync_now().unwrap()
        }));
    }
    let reports: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // The FakeRemote asserts cycles never overlap; simultaneous triggers
    // must collapse instead of producing ten round-trip sequences.
    assert_eq!(reports.len(), 10);
    assert!(reports.iter().any(|r| !r.coalesced));
    assert!(reports.iter().filter(|r| r.coalesced).count() >= 1);
    let pulls = remote.pull_count.load(Ordering::SeqCst);
    assert!((1..10).contains(&pulls), "expected coalesced runs, saw {pulls}");
    assert_eq!(
        engine.get_sync_status("task", "r1").unwrap(),
        Some(SyncStatus::Synced)
    );
}

#[test]
fn delete_propagates_and_resource_stays_gone() {
    let remote = FakeRemote::new();
    let engine = engine(Arc::clone(&remote));

    engine
        .create_record("task", "r1", json_fields(&[("title", "A")]))
        .unwrap();
    engine.sync_now().unwrap();
    engine.delete_record("task", "r1").unwrap();
    let report = engine.sync_now().unwrap();

    assert_eq!(report.pushed, 1);
    assert!(engine.get_record("task", "r1").unwrap().is_none());
    assert_eq!(remote.pushes_for("r1").len(), 2);
}

#[test]
fn offline_mutations_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keel.db");
    let remote = FakeRemote::new();

    {
        let engine = SyncEngine::new(
            Arc::new(SqliteBackend::open(&path).unwrap()),
            Arc::clone(&remote) as Arc<dyn RemoteEndpoint>,
            test_config(),
        )
        .unwrap();
        engine
            .create_record("task", "r1", json_fields(&[("title", "A")]))
            .unwrap();
        engine.shutdown();
        // Dropped with the mutation still queued.
    }

    let engine = SyncEngine::new(
        Arc::new(SqliteBackend::open(&path).unwrap()),
        Arc::clone(&remote) as Arc<dyn RemoteEndpoint>,
        test_config(),
    )
    .unwrap();
    let report = engine.sync_now().unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(
        engine.get_sync_status("task", "r1").unwrap(),
        Some(SyncStatus::Synced)
    );
}

#[test]
fn validation_rejects_empty_identifiers_and_deltas() {
    let remote = FakeRemote::new();
    let engine = engine(remote);

    assert!(engine.create_record("", "r1", json_fields(&[])).is_err());
    assert!(engine.create_record("task", " ", json_fields(&[])).is_err());
    engine
        .create_record("task", "r1", json_fields(&[("title", "A")]))
        .unwrap();
    assert!(engine
        .update_record("task", "r1", BTreeMap::new())
        .is_err());
    assert!(engine
        .update_record("task", "missing", json_fields(&[("title", "B")]))
        .is_err());
}

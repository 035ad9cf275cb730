//! Conflict detection: field-level comparison against the common ancestor.

use chrono::{DateTime, Utc};

use keel_core::conflict::{FieldConflict, Resolution};
use keel_core::record::{Record, RecordPayload};

/// Compare a local record with a pulled remote version.
///
/// Emits a [`FieldConflict`] for every field present in both payloads
/// whose values differ and whose timestamps both postdate the common
/// ancestor (`ancestor_ts`). Fields modified on only one side are
/// auto-mergeable and excluded. Deterministic: output is ordered by field
/// name and depends only on the inputs.
pub fn compare(
    local: &Record,
    remote: &RecordPayload,
    ancestor_ts: DateTime<Utc>,
) -> Vec<FieldConflict> {
    let mut conflicts = Vec::new();
    // BTreeMap iteration gives field-name order.
    for (field, local_fv) in &local.payload {
        let Some(remote_fv) = remote.payload.get(field) else {
            continue;
        };
        if local_fv.value == remote_fv.value {
            continue;
        }
        let both_modified =
            local_fv.modified_at > ancestor_ts && remote_fv.modified_at > ancestor_ts;
        if !both_modified {
            continue;
        }
        conflicts.push(FieldConflict {
            field: field.clone(),
            local_value: local_fv.value.clone(),
            remote_value: remote_fv.value.clone(),
            local_ts: local_fv.modified_at,
            remote_ts: remote_fv.modified_at,
            resolution: Resolution::Unset,
            resolved_value: None,
        });
    }
    conflicts
}

/// Fields the remote modified since the ancestor that the local side did
/// not touch: safe to apply without the resolver.
pub fn auto_mergeable<'a>(
    local: &Record,
    remote: &'a RecordPayload,
    ancestor_ts: DateTime<Utc>,
) -> Vec<&'a str> {
    remote
        .payload
        .iter()
        .filter(|(field, remote_fv)| {
            if remote_fv.modified_at <= ancestor_ts {
                return false;
            }
            match local.payload.get(*field) {
                // Field exists locally: mergeable only if local left it alone.
                Some(local_fv) => {
                    local_fv.modified_at <= ancestor_ts && local_fv.value != remote_fv.value
                }
                // New remote field.
                None => true,
            }
        })
        .map(|(field, _)| field.as_str())
        .collect()
}

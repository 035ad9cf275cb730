//! Conflict resolution policies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use keel_core::conflict::{FieldConflict, Resolution, SyncConflict};

/// Resolution strategy applied to a conflict set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Every field takes the local value.
    Local,
    /// Every field takes the remote value.
    Remote,
    /// Per field, the later timestamp wins; exact ties favor the remote
    /// (the remote acts as tie-break arbiter).
    #[default]
    Merge,
    /// Caller supplies explicit per-field values; unsupplied fields stay
    /// unresolved.
    Manual,
}

/// Apply a strategy to every still-unresolved field of the conflict set.
///
/// Deterministic: identical inputs always produce identical resolutions.
/// With [`Strategy::Manual`], only fields present in `manual_values` are
/// resolved; the rest keep the record in conflict.
pub fn apply(
    conflict: &mut SyncConflict,
    strategy: Strategy,
    manual_values: &BTreeMap<String, serde_json::Value>,
) {
    for field in conflict.conflicts.iter_mut() {
        if field.is_resolved() {
            continue;
        }
        match strategy {
            Strategy::Local => {
                field.resolution = Resolution::Local;
                field.resolved_value = Some(field.local_value.clone());
            }
            Strategy::Remote => {
                field.resolution = Resolution::Remote;
                field.resolved_value = Some(field.remote_value.clone());
            }
            Strategy::Merge => {
                field.resolution = Resolution::Merge;
                field.resolved_value = Some(merge_winner(field).clone());
            }
            Strategy::Manual => {
                if let Some(value) = manual_values.get(&field.field) {
                    field.resolution = Resolution::Manual;
                    field.resolved_value = Some(value.clone());
                }
            }
        }
    }
}

/// Last-writer-wins for a single field; remote wins exact timestamp ties.
fn merge_winner(field: &FieldConflict) -> &serde_json::Value {
    if field.local_ts > field.remote_ts {
        &field.local_value
    } else {
        &field.remote_value
    }
}

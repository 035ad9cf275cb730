//! Broadcast events: immutable facts published after a change is applied.

use serde::{Deserialize, Serialize};

/// Who applied the change the event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateActor {
    /// A local API call.
    LocalEdit,
    /// A pulled remote change (fast-forward or auto-merge).
    RemoteSync,
    /// Conflict resolution.
    Resolver,
}

/// Advisory priority for consumers. Never affects internal ordering or
/// retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Advisory metadata attached to an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMetadata {
    pub priority: EventPriority,
    pub impact: EventPriority,
    /// True when the change flagged a conflict the caller must resolve.
    pub requires_action: bool,
}

/// An applied change, never mutated after creation. Subscribers are
/// expected to be idempotent keyed on `(resource_id, applied_version)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEvent {
    pub resource_id: String,
    pub resource_type: String,
    pub actor: UpdateActor,
    pub changed_fields: Vec<String>,
    pub applied_version: u64,
    pub metadata: EventMetadata,
}

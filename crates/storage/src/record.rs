use serde::{Deserialize, Serialize};

/// The materialized current state of one entity as stored in the backend.
///
/// A snapshot is never deleted: terminal states stay behind as tombstones so
/// later commands against the same id are rejected instead of treated as new.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub entity_id: String,
    pub entity_type: String,
    pub state: String,
    pub version: i64,
    pub last_event_type: String,
    /// ISO 8601 / RFC 3339 timestamp string.
    pub last_event_at: String,
    /// Entity-type-specific denormalized fields (stored path, content hash, ...).
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// One entry of the append-only event log, keyed by `(entity_id, version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub event_type: String,
    pub version: i64,
    /// `None` for the first event of an entity.
    pub from_state: Option<String>,
    pub to_state: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// ISO 8601 / RFC 3339 timestamp string.
    pub produced_at: String,
    pub causation_id: String,
    pub requester: String,
}

impl EventRecord {
    /// The event's natural key, `"{entity_id}@{version}"`. Unique per event
    /// and stable across resubmissions.
    pub fn natural_key(&self) -> String {
        format!("{}@{}", self.entity_id, self.version)
    }
}

//! View projector: folds events into snapshots.
//!
//! [`project`] is the only place a snapshot is derived from an event. The
//! decider uses it for every accepted command and [`replay`] uses it to
//! rebuild a snapshot from the full event log, so an incrementally
//! maintained snapshot and a replayed one are equal by construction.

use serde_json::Value;

use crate::{Event, Snapshot};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectionError {
    #[error("event for '{entity_id}' has version {found}, expected {expected}")]
    VersionMismatch {
        entity_id: String,
        expected: i64,
        found: i64,
    },

    #[error("event for '{found}' applied to snapshot of '{expected}'")]
    EntityMismatch { expected: String, found: String },

    #[error("event of type '{found}' applied to '{entity_id}' of type '{expected}'")]
    TypeMismatch {
        entity_id: String,
        expected: String,
        found: String,
    },

    #[error("event {version} of '{entity_id}' starts from {found:?} but the entity is in {expected:?}")]
    StateMismatch {
        entity_id: String,
        version: i64,
        expected: Option<String>,
        found: Option<String>,
    },
}

/// Apply `event` to `current` (`None` = entity absent) and return the new
/// snapshot. Pure; rejects any event that does not directly follow `current`.
pub fn project(current: Option<&Snapshot>, event: &Event) -> Result<Snapshot, ProjectionError> {
    let expected_version = current.map_or(1, |s| s.version + 1);
    if event.version != expected_version {
        return Err(ProjectionError::VersionMismatch {
            entity_id: event.entity_id.clone(),
            expected: expected_version,
            found: event.version,
        });
    }

    let current_state = current.map(|s| s.state.clone());
    if let Some(snap) = current {
        if snap.entity_id != event.entity_id {
            return Err(ProjectionError::EntityMismatch {
                expected: snap.entity_id.clone(),
                found: event.entity_id.clone(),
            });
        }
        if snap.entity_type != event.entity_type {
            return Err(ProjectionError::TypeMismatch {
                entity_id: snap.entity_id.clone(),
                expected: snap.entity_type.clone(),
                found: event.entity_type.clone(),
            });
        }
    }
    if event.from_state != current_state {
        return Err(ProjectionError::StateMismatch {
            entity_id: event.entity_id.clone(),
            version: event.version,
            expected: current_state,
            found: event.from_state.clone(),
        });
    }

    let mut attributes = current.map(|s| s.attributes.clone()).unwrap_or_default();
    for (key, value) in &event.attributes {
        if value.is_null() {
            attributes.remove(key);
        } else {
            attributes.insert(key.clone(), value.clone());
        }
    }

    Ok(Snapshot {
        entity_id: event.entity_id.clone(),
        entity_type: event.entity_type.clone(),
        state: event.to_state.clone(),
        version: event.version,
        last_event_type: event.event_type.clone(),
        last_event_at: event.produced_at.clone(),
        attributes,
    })
}

/// Fold a complete history from scratch. An empty history yields `None`.
pub fn replay<'a, I>(events: I) -> Result<Option<Snapshot>, ProjectionError>
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut current: Option<Snapshot> = None;
    for event in events {
        current = Some(project(current.as_ref(), event)?);
    }
    Ok(current)
}

/// Read a string attribute of a snapshot.
pub fn attribute_str<'a>(snapshot: &'a Snapshot, key: &str) -> Option<&'a str> {
    snapshot.attributes.get(key).and_then(Value::as_str)
}

//! File lifecycle entity type.
//!
//! Tracks stored objects by content hash: `initiate` records a new file,
//! `log` appends an audit entry, `update` records new content and `delete`
//! leaves a tombstone. The builders here only shape events; the bytes
//! themselves live in whatever object store the caller uses.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::builder::{BuildError, BuilderRegistry, BuiltEvent};
use crate::command::Command;
use crate::machine::{MachineDefinition, MachineError, TransitionRule};
use crate::projector::attribute_str;
use crate::Snapshot;

pub const ENTITY_TYPE: &str = "file";

/// Transition table of the file lifecycle.
pub const MACHINE_TOML: &str = include_str!("../machines/file.toml");

pub fn machine() -> Result<MachineDefinition, MachineError> {
    MachineDefinition::from_toml_str(MACHINE_TOML)
}

/// Register the file builders for every file command.
pub fn register_builders(registry: &mut BuilderRegistry) {
    registry.register(ENTITY_TYPE, "initiate", build_initiate);
    registry.register(ENTITY_TYPE, "log", build_log);
    registry.register(ENTITY_TYPE, "update", build_update);
    registry.register(ENTITY_TYPE, "delete", build_delete);
}

/// SHA-256 of `bytes` as lowercase hex, the form `initiate` and `update`
/// expect in their `hash` field.
pub fn content_hash(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Parent directory of a stored path, `""` for top-level paths.
pub fn directory_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

fn build_initiate(
    command: &Command,
    _current: Option<&Snapshot>,
    _rule: &TransitionRule,
) -> Result<BuiltEvent, BuildError> {
    let payload = object(command)?;
    let path = validate_path(required_str(payload, "path")?)?;
    let hash = validate_hash(required_str(payload, "hash")?)?;
    let size = optional_size(payload)?;
    let bucket = optional_str(payload, "bucket", "bucket")?;
    let directory = directory_of(path);

    Ok(BuiltEvent::new(json!({
        "path": path,
        "directory": directory,
        "hash": hash,
        "size": size,
        "bucket": bucket,
    }))
    .with_attribute("path", json!(path))
    .with_attribute("directory", json!(directory))
    .with_attribute("hash", json!(hash))
    .with_attribute("size", json!(size))
    .with_attribute("bucket", json!(bucket)))
}

fn build_log(
    command: &Command,
    current: Option<&Snapshot>,
    _rule: &TransitionRule,
) -> Result<BuiltEvent, BuildError> {
    let payload = object(command)?;
    let action = required_str(payload, "action")?;
    if action.trim().is_empty() {
        return Err(BuildError::InvalidField {
            field: "action",
            reason: "must not be blank".to_string(),
        });
    }
    let detail = payload.get("detail").cloned().unwrap_or(Value::Null);

    Ok(BuiltEvent::new(json!({
        "action": action,
        "detail": detail,
        "path": current.and_then(|s| attribute_str(s, "path")),
        "hash": current.and_then(|s| attribute_str(s, "hash")),
    })))
}

fn build_update(
    command: &Command,
    current: Option<&Snapshot>,
    _rule: &TransitionRule,
) -> Result<BuiltEvent, BuildError> {
    let payload = object(command)?;
    let hash = validate_hash(required_str(payload, "hash")?)?;
    let size = optional_size(payload)?;
    let path = current.and_then(|s| attribute_str(s, "path"));

    Ok(BuiltEvent::new(json!({
        "previous_hash": current.and_then(|s| attribute_str(s, "hash")),
        "hash": hash,
        "size": size,
        "path": path,
        "directory": path.map(directory_of),
    }))
    .with_attribute("hash", json!(hash))
    .with_attribute("size", json!(size)))
}

fn build_delete(
    command: &Command,
    current: Option<&Snapshot>,
    _rule: &TransitionRule,
) -> Result<BuiltEvent, BuildError> {
    let payload = object(command)?;
    let reason = optional_str(payload, "reason", "reason")?;
    let path = current.and_then(|s| attribute_str(s, "path"));

    Ok(BuiltEvent::new(json!({
        "path": path,
        "directory": path.map(directory_of),
        "hash": current.and_then(|s| attribute_str(s, "hash")),
        "reason": reason,
    })))
}

// ── Field helpers ────────────────────────────────────────────────────────────

fn object(command: &Command) -> Result<&Map<String, Value>, BuildError> {
    command.payload.as_object().ok_or(BuildError::NotAnObject)
}

fn required_str<'a>(
    payload: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, BuildError> {
    match payload.get(field) {
        None | Some(Value::Null) => Err(BuildError::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(BuildError::InvalidField {
            field,
            reason: "must be a string".to_string(),
        }),
    }
}

fn optional_str<'a>(
    payload: &'a Map<String, Value>,
    key: &str,
    field: &'static str,
) -> Result<Option<&'a str>, BuildError> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(BuildError::InvalidField {
            field,
            reason: "must be a string".to_string(),
        }),
    }
}

fn optional_size(payload: &Map<String, Value>) -> Result<Option<u64>, BuildError> {
    match payload.get("size") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| BuildError::InvalidField {
            field: "size",
            reason: "must be a non-negative integer".to_string(),
        }),
    }
}

fn validate_path(path: &str) -> Result<&str, BuildError> {
    let invalid = |reason: &str| BuildError::InvalidField {
        field: "path",
        reason: reason.to_string(),
    };
    if path.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if path.ends_with('/') {
        return Err(invalid("must name a file, not a directory"));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(invalid("must not contain '..' segments"));
    }
    Ok(path)
}

fn validate_hash(hash: &str) -> Result<&str, BuildError> {
    let well_formed =
        hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !well_formed {
        return Err(BuildError::InvalidField {
            field: "hash",
            reason: "must be 64 lowercase hex characters".to_string(),
        });
    }
    Ok(hash)
}

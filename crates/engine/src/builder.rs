//! Event builders.
//!
//! A builder turns an authorized command into the payload and attribute
//! changes of the event it produces. Builders are pure: they see the command,
//! the current snapshot and the matched rule, and must not perform I/O.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::command::Command;
use crate::machine::TransitionRule;
use crate::Snapshot;

/// Builder output: the event payload plus the attribute changes the
/// projector folds into the snapshot (a `null` value removes the attribute).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuiltEvent {
    pub payload: Value,
    pub attributes: Map<String, Value>,
}

impl BuiltEvent {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }
}

/// A builder refused the command payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("payload must be a JSON object")]
    NotAnObject,
}

pub trait EventBuilder: Send + Sync {
    fn build(
        &self,
        command: &Command,
        current: Option<&Snapshot>,
        rule: &TransitionRule,
    ) -> Result<BuiltEvent, BuildError>;
}

impl<F> EventBuilder for F
where
    F: Fn(&Command, Option<&Snapshot>, &TransitionRule) -> Result<BuiltEvent, BuildError>
        + Send
        + Sync,
{
    fn build(
        &self,
        command: &Command,
        current: Option<&Snapshot>,
        rule: &TransitionRule,
    ) -> Result<BuiltEvent, BuildError> {
        self(command, current, rule)
    }
}

/// Copies the command payload into the event unchanged and touches no
/// attributes. Used for every command without a registered builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughBuilder;

impl EventBuilder for PassthroughBuilder {
    fn build(
        &self,
        command: &Command,
        _current: Option<&Snapshot>,
        _rule: &TransitionRule,
    ) -> Result<BuiltEvent, BuildError> {
        if !command.payload.is_object() {
            return Err(BuildError::NotAnObject);
        }
        Ok(BuiltEvent::new(command.payload.clone()))
    }
}

/// Builders keyed by `(entity_type, command_type)`.
#[derive(Clone, Default)]
pub struct BuilderRegistry {
    builders: HashMap<(String, String), Arc<dyn EventBuilder>>,
    fallback: PassthroughBuilder,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `builder` for one command of one entity type, replacing any
    /// previous registration.
    pub fn register<B>(&mut self, entity_type: &str, command_type: &str, builder: B)
    where
        B: EventBuilder + 'static,
    {
        self.builders.insert(
            (entity_type.to_string(), command_type.to_string()),
            Arc::new(builder),
        );
    }

    pub fn get(&self, entity_type: &str, command_type: &str) -> &dyn EventBuilder {
        self.builders
            .get(&(entity_type.to_string(), command_type.to_string()))
            .map(|b| b.as_ref())
            .unwrap_or(&self.fallback)
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

impl std::fmt::Debug for BuilderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.builders.keys().collect();
        keys.sort();
        f.debug_struct("BuilderRegistry")
            .field("builders", &keys)
            .finish()
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;

use waymark_storage::LifecycleStorage;

use crate::command::Command;
use crate::decider::Decider;
use crate::error::DecideError;
use crate::Event;

/// Dispatches commands to the decider registered for their entity type.
pub struct CommandRouter<S: LifecycleStorage> {
    routes: BTreeMap<String, Arc<Decider<S>>>,
}

impl<S: LifecycleStorage> Default for CommandRouter<S> {
    fn default() -> Self {
        Self {
            routes: BTreeMap::new(),
        }
    }
}

impl<S: LifecycleStorage> CommandRouter<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one entity type to `decider`, replacing any earlier route.
    pub fn route(mut self, entity_type: &str, decider: Arc<Decider<S>>) -> Self {
        self.routes.insert(entity_type.to_string(), decider);
        self
    }

    /// Route every entity type of the decider's machine to it.
    pub fn for_machine(decider: Arc<Decider<S>>) -> Self {
        let types: Vec<String> = decider
            .machine()
            .entity_types()
            .map(str::to_string)
            .collect();
        types
            .iter()
            .fold(Self::new(), |router, t| router.route(t, decider.clone()))
    }

    pub fn decider_for(&self, entity_type: &str) -> Option<&Arc<Decider<S>>> {
        self.routes.get(entity_type)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(|k| k.as_str())
    }

    /// Deciders behind the router, without duplicates.
    pub fn deciders(&self) -> Vec<&Arc<Decider<S>>> {
        let mut out: Vec<&Arc<Decider<S>>> = Vec::new();
        for decider in self.routes.values() {
            if !out.iter().any(|d| Arc::ptr_eq(d, decider)) {
                out.push(decider);
            }
        }
        out
    }

    pub async fn dispatch(&self, command: &Command) -> Result<Event, DecideError> {
        match self.routes.get(&command.entity_type) {
            Some(decider) => decider.decide(command).await,
            None => Err(DecideError::UnknownCommand {
                entity_type: command.entity_type.clone(),
                command_type: command.command_type.clone(),
            }),
        }
    }
}

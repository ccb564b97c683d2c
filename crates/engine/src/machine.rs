//! State machine definitions.
//!
//! A [`MachineDefinition`] is the static transition table for every entity
//! type the engine knows about. It is built once (from a TOML table or with
//! [`MachineBuilder`]), validated, and then only read, so deciders share it
//! through an `Arc`.
//!
//! Table format:
//!
//! ```toml
//! [[entity]]
//! type = "file"
//! states = ["exists", "deleted"]
//!
//! [[entity.rule]]
//! command = "initiate"
//! from = ["_initial"]
//! to = "exists"
//! event = "initiated"
//! capability = "file:create"
//! ```
//!
//! `from = []` (or omitting `from`) makes a rule legal from every state,
//! including the non-existent [`INITIAL_STATE`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Pseudo-state of an entity that has no snapshot yet.
pub const INITIAL_STATE: &str = "_initial";

/// One row of the transition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRule {
    pub command_type: String,
    /// Legal source states. Empty means any state, including absent.
    pub from_states: BTreeSet<String>,
    pub to_state: String,
    pub event_type: String,
    pub required_capability: String,
}

impl TransitionRule {
    /// Whether this rule fires from `current` (`None` = entity absent).
    pub fn applies_to(&self, current: Option<&str>) -> bool {
        self.from_states.is_empty() || self.from_states.contains(current.unwrap_or(INITIAL_STATE))
    }

    fn overlaps(&self, other: &TransitionRule) -> Option<String> {
        if self.from_states.is_empty() || other.from_states.is_empty() {
            return Some("*".to_string());
        }
        self.from_states
            .intersection(&other.from_states)
            .next()
            .cloned()
    }
}

/// Outcome of a transition-table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution<'a> {
    /// A rule permits the command from the current state.
    Rule(&'a TransitionRule),
    /// The command exists for this entity type but not from the current state.
    NotApplicable,
    /// The command type (or the entity type itself) is not registered.
    UnknownCommand,
}

/// Errors raised while building a [`MachineDefinition`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MachineError {
    #[error("could not parse transition table: {0}")]
    Parse(String),

    #[error("empty {what} in transition table")]
    EmptyIdentifier { what: &'static str },

    #[error("entity type '{0}' declared more than once")]
    DuplicateEntityType(String),

    #[error("entity type '{entity_type}' declares state '{state}' more than once")]
    DuplicateState { entity_type: String, state: String },

    #[error("entity type '{entity_type}' uses reserved state '{INITIAL_STATE}' as a declared or destination state")]
    ReservedState { entity_type: String },

    #[error("rule '{command}' refers to undeclared entity type '{entity_type}'")]
    UndeclaredEntityType { entity_type: String, command: String },

    #[error("rule '{command}' of entity type '{entity_type}' refers to undeclared state '{state}'")]
    UndeclaredState {
        entity_type: String,
        command: String,
        state: String,
    },

    #[error("rules for '{command}' of entity type '{entity_type}' overlap on source state '{state}'")]
    AmbiguousRules {
        entity_type: String,
        command: String,
        state: String,
    },

    #[error("state '{state}' of entity type '{entity_type}' is unreachable from '{INITIAL_STATE}'")]
    UnreachableState { entity_type: String, state: String },
}

/// Transition table of a single entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMachine {
    pub entity_type: String,
    pub states: BTreeSet<String>,
    /// Rules grouped by command type.
    rules: BTreeMap<String, Vec<TransitionRule>>,
}

impl EntityMachine {
    /// All rules of this entity type, ordered by command type.
    pub fn rules(&self) -> impl Iterator<Item = &TransitionRule> {
        self.rules.values().flatten()
    }

    fn reachable_states(&self) -> BTreeSet<String> {
        let mut reached: BTreeSet<String> = BTreeSet::new();
        reached.insert(INITIAL_STATE.to_string());
        loop {
            let before = reached.len();
            for rule in self.rules() {
                let fires = rule.from_states.is_empty()
                    || rule.from_states.iter().any(|s| reached.contains(s));
                if fires {
                    reached.insert(rule.to_state.clone());
                }
            }
            if reached.len() == before {
                return reached;
            }
        }
    }
}

/// The immutable transition table for all entity types.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MachineDefinition {
    entities: BTreeMap<String, EntityMachine>,
}

impl MachineDefinition {
    /// Start building a definition in code.
    pub fn builder() -> MachineBuilder {
        MachineBuilder::default()
    }

    /// Parse and validate a TOML transition table.
    pub fn from_toml_str(source: &str) -> Result<Self, MachineError> {
        let table: TableFile =
            toml::from_str(source).map_err(|e| MachineError::Parse(e.to_string()))?;
        let mut builder = MachineBuilder::default();
        for entity in table.entities {
            builder.entities.push((entity.entity_type.clone(), entity.states));
            for rule in entity.rules {
                builder.rules.push((
                    entity.entity_type.clone(),
                    TransitionRule {
                        command_type: rule.command,
                        from_states: rule.from.into_iter().collect(),
                        to_state: rule.to,
                        event_type: rule.event,
                        required_capability: rule.capability,
                    },
                ));
            }
        }
        builder.build()
    }

    /// Look up the rule for `command_type` on an entity of `entity_type`
    /// currently in `current` (`None` = absent).
    pub fn resolve(
        &self,
        entity_type: &str,
        command_type: &str,
        current: Option<&str>,
    ) -> Resolution<'_> {
        let rules = match self
            .entities
            .get(entity_type)
            .and_then(|m| m.rules.get(command_type))
        {
            Some(rules) => rules,
            None => return Resolution::UnknownCommand,
        };
        rules
            .iter()
            .find(|r| r.applies_to(current))
            .map_or(Resolution::NotApplicable, Resolution::Rule)
    }

    /// Registered entity types.
    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(|k| k.as_str())
    }

    /// The machine of one entity type.
    pub fn entity(&self, entity_type: &str) -> Option<&EntityMachine> {
        self.entities.get(entity_type)
    }

    /// Every rule of `entity_type`; empty for an unknown type.
    pub fn rules_for(&self, entity_type: &str) -> Vec<&TransitionRule> {
        self.entities
            .get(entity_type)
            .map(|m| m.rules().collect())
            .unwrap_or_default()
    }

    /// Rules legal from `current` for `entity_type`, ordered by command type.
    pub fn commands_for(&self, entity_type: &str, current: Option<&str>) -> Vec<&TransitionRule> {
        self.entities
            .get(entity_type)
            .map(|m| m.rules().filter(|r| r.applies_to(current)).collect())
            .unwrap_or_default()
    }
}

/// Programmatic construction of a [`MachineDefinition`].
#[derive(Debug, Default)]
pub struct MachineBuilder {
    entities: Vec<(String, Vec<String>)>,
    rules: Vec<(String, TransitionRule)>,
}

impl MachineBuilder {
    /// Declare an entity type and its states.
    pub fn entity(mut self, entity_type: &str, states: &[&str]) -> Self {
        self.entities.push((
            entity_type.to_string(),
            states.iter().map(|s| s.to_string()).collect(),
        ));
        self
    }

    /// Add a rule. An empty `from` makes the rule legal from any state.
    pub fn rule(
        mut self,
        entity_type: &str,
        command: &str,
        from: &[&str],
        to: &str,
        event: &str,
        capability: &str,
    ) -> Self {
        self.rules.push((
            entity_type.to_string(),
            TransitionRule {
                command_type: command.to_string(),
                from_states: from.iter().map(|s| s.to_string()).collect(),
                to_state: to.to_string(),
                event_type: event.to_string(),
                required_capability: capability.to_string(),
            },
        ));
        self
    }

    /// Validate and freeze the table.
    pub fn build(self) -> Result<MachineDefinition, MachineError> {
        let mut entities: BTreeMap<String, EntityMachine> = BTreeMap::new();

        for (entity_type, states) in self.entities {
            if entity_type.is_empty() {
                return Err(MachineError::EmptyIdentifier { what: "entity type" });
            }
            if entities.contains_key(&entity_type) {
                return Err(MachineError::DuplicateEntityType(entity_type));
            }
            let mut declared = BTreeSet::new();
            for state in states {
                if state.is_empty() {
                    return Err(MachineError::EmptyIdentifier { what: "state" });
                }
                if state == INITIAL_STATE {
                    return Err(MachineError::ReservedState { entity_type });
                }
                if !declared.insert(state.clone()) {
                    return Err(MachineError::DuplicateState { entity_type, state });
                }
            }
            entities.insert(
                entity_type.clone(),
                EntityMachine {
                    entity_type,
                    states: declared,
                    rules: BTreeMap::new(),
                },
            );
        }

        for (entity_type, rule) in self.rules {
            let machine = match entities.get_mut(&entity_type) {
                Some(m) => m,
                None => {
                    return Err(MachineError::UndeclaredEntityType {
                        entity_type,
                        command: rule.command_type,
                    })
                }
            };
            validate_rule(machine, &rule)?;

            let siblings = machine.rules.entry(rule.command_type.clone()).or_default();
            for existing in siblings.iter() {
                if let Some(state) = existing.overlaps(&rule) {
                    return Err(MachineError::AmbiguousRules {
                        entity_type,
                        command: rule.command_type,
                        state,
                    });
                }
            }
            siblings.push(rule);
        }

        for machine in entities.values() {
            let reached = machine.reachable_states();
            if let Some(state) = machine.states.iter().find(|s| !reached.contains(*s)) {
                return Err(MachineError::UnreachableState {
                    entity_type: machine.entity_type.clone(),
                    state: state.clone(),
                });
            }
        }

        Ok(MachineDefinition { entities })
    }
}

fn validate_rule(machine: &EntityMachine, rule: &TransitionRule) -> Result<(), MachineError> {
    for (what, value) in [
        ("command type", &rule.command_type),
        ("event type", &rule.event_type),
        ("capability", &rule.required_capability),
    ] {
        if value.is_empty() {
            return Err(MachineError::EmptyIdentifier { what });
        }
    }
    if rule.to_state == INITIAL_STATE {
        return Err(MachineError::ReservedState {
            entity_type: machine.entity_type.clone(),
        });
    }
    let undeclared = std::iter::once(&rule.to_state)
        .chain(rule.from_states.iter().filter(|s| *s != INITIAL_STATE))
        .find(|s| !machine.states.contains(*s));
    if let Some(state) = undeclared {
        return Err(MachineError::UndeclaredState {
            entity_type: machine.entity_type.clone(),
            command: rule.command_type.clone(),
            state: state.clone(),
        });
    }
    Ok(())
}

// ── TOML table schema ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TableFile {
    #[serde(rename = "entity", default)]
    entities: Vec<EntityTable>,
}

#[derive(Debug, Deserialize)]
struct EntityTable {
    #[serde(rename = "type")]
    entity_type: String,
    states: Vec<String>,
    #[serde(rename = "rule", default)]
    rules: Vec<RuleTable>,
}

#[derive(Debug, Deserialize)]
struct RuleTable {
    command: String,
    #[serde(default)]
    from: Vec<String>,
    to: String,
    event: String,
    capability: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_machine() -> MachineDefinition {
        MachineDefinition::builder()
            .entity("order", &["draft", "submitted", "approved", "rejected"])
            .rule("order", "create", &[INITIAL_STATE], "draft", "created", "order:create")
            .rule("order", "submit", &["draft"], "submitted", "submitted", "order:submit")
            .rule("order", "review", &["submitted"], "approved", "approved", "order:review")
            .rule("order", "reject", &["submitted", "draft"], "rejected", "rejected", "order:review")
            .build()
            .unwrap()
    }

    #[test]
    fn resolve_finds_rule_for_current_state() {
        let machine = order_machine();
        match machine.resolve("order", "submit", Some("draft")) {
            Resolution::Rule(rule) => {
                assert_eq!(rule.to_state, "submitted");
                assert_eq!(rule.required_capability, "order:submit");
            }
            other => panic!("expected rule, got {other:?}"),
        }
    }

    #[test]
    fn resolve_absent_entity_uses_initial_state() {
        let machine = order_machine();
        assert!(matches!(
            machine.resolve("order", "create", None),
            Resolution::Rule(_)
        ));
        assert_eq!(
            machine.resolve("order", "submit", None),
            Resolution::NotApplicable
        );
    }

    #[test]
    fn known_command_from_wrong_state_is_not_applicable() {
        let machine = order_machine();
        assert_eq!(
            machine.resolve("order", "create", Some("draft")),
            Resolution::NotApplicable
        );
    }

    #[test]
    fn unknown_command_and_unknown_type_are_distinct_from_not_applicable() {
        let machine = order_machine();
        assert_eq!(
            machine.resolve("order", "archive", Some("draft")),
            Resolution::UnknownCommand
        );
        assert_eq!(
            machine.resolve("invoice", "create", None),
            Resolution::UnknownCommand
        );
    }

    #[test]
    fn empty_from_set_matches_every_state_including_absent() {
        let machine = MachineDefinition::builder()
            .entity("note", &["written"])
            .rule("note", "write", &[], "written", "written", "note:write")
            .build()
            .unwrap();
        assert!(matches!(machine.resolve("note", "write", None), Resolution::Rule(_)));
        assert!(matches!(
            machine.resolve("note", "write", Some("written")),
            Resolution::Rule(_)
        ));
    }

    #[test]
    fn overlapping_from_sets_are_rejected() {
        let err = MachineDefinition::builder()
            .entity("order", &["draft", "submitted"])
            .rule("order", "create", &[INITIAL_STATE], "draft", "created", "c")
            .rule("order", "submit", &["draft"], "submitted", "submitted", "c")
            .rule("order", "submit", &["draft", "submitted"], "submitted", "resubmitted", "c")
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            MachineError::AmbiguousRules {
                entity_type: "order".to_string(),
                command: "submit".to_string(),
                state: "draft".to_string(),
            }
        );
    }

    #[test]
    fn any_state_rule_must_be_alone() {
        let err = MachineDefinition::builder()
            .entity("note", &["written"])
            .rule("note", "write", &[], "written", "written", "c")
            .rule("note", "write", &[INITIAL_STATE], "written", "first", "c")
            .build()
            .unwrap_err();
        assert!(matches!(err, MachineError::AmbiguousRules { state, .. } if state == "*"));
    }

    #[test]
    fn undeclared_and_reserved_states_are_rejected() {
        let undeclared = MachineDefinition::builder()
            .entity("order", &["draft"])
            .rule("order", "create", &[INITIAL_STATE], "open", "created", "c")
            .build()
            .unwrap_err();
        assert!(matches!(undeclared, MachineError::UndeclaredState { state, .. } if state == "open"));

        let reserved = MachineDefinition::builder()
            .entity("order", &["draft"])
            .rule("order", "create", &[INITIAL_STATE], "draft", "created", "c")
            .rule("order", "reset", &["draft"], INITIAL_STATE, "reset", "c")
            .build()
            .unwrap_err();
        assert!(matches!(reserved, MachineError::ReservedState { .. }));
    }

    #[test]
    fn unreachable_state_is_rejected() {
        let err = MachineDefinition::builder()
            .entity("order", &["draft", "archived"])
            .rule("order", "create", &[INITIAL_STATE], "draft", "created", "c")
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            MachineError::UnreachableState {
                entity_type: "order".to_string(),
                state: "archived".to_string(),
            }
        );
    }

    #[test]
    fn rule_for_undeclared_entity_type_is_rejected() {
        let err = MachineDefinition::builder()
            .rule("ghost", "create", &[INITIAL_STATE], "here", "created", "c")
            .build()
            .unwrap_err();
        assert!(matches!(err, MachineError::UndeclaredEntityType { .. }));
    }

    #[test]
    fn toml_table_parses_and_validates() {
        let machine = MachineDefinition::from_toml_str(
            r#"
            [[entity]]
            type = "ticket"
            states = ["open", "closed"]

            [[entity.rule]]
            command = "open"
            from = ["_initial"]
            to = "open"
            event = "opened"
            capability = "ticket:open"

            [[entity.rule]]
            command = "close"
            from = ["open"]
            to = "closed"
            event = "closed"
            capability = "ticket:close"
            "#,
        )
        .unwrap();
        assert_eq!(machine.entity_types().collect::<Vec<_>>(), vec!["ticket"]);
        let legal: Vec<&str> = machine
            .commands_for("ticket", Some("open"))
            .iter()
            .map(|r| r.command_type.as_str())
            .collect();
        assert_eq!(legal, vec!["close"]);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = MachineDefinition::from_toml_str("[[entity]]\ntype = 3").unwrap_err();
        assert!(matches!(err, MachineError::Parse(_)));
    }
}

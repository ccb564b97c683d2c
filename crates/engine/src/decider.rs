//! The decider: turns commands into accepted events or typed rejections.
//!
//! One [`Decider`] serves every entity type of one [`MachineDefinition`]. Per
//! entity id at most one command is in flight at a time; commands for
//! different ids run concurrently. The storage backend's compare-and-swap is
//! the last line of defence when several processes share a backend.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use waymark_storage::{LifecycleStorage, StorageError};

use crate::builder::BuilderRegistry;
use crate::capability::CapabilityCheck;
use crate::command::Command;
use crate::error::DecideError;
use crate::lock::{EntityGuard, EntityLocks};
use crate::machine::{MachineDefinition, Resolution};
use crate::mirror::{MirrorSink, NoopMirror};
use crate::projector::{project, replay};
use crate::{Event, Snapshot};

#[derive(Debug, Clone)]
pub struct DeciderConfig {
    /// How long a command waits for another command on the same entity.
    pub lock_timeout: Duration,
}

impl Default for DeciderConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(2),
        }
    }
}

/// How [`Decider::rebuild`] treats a stored snapshot that disagrees with the
/// replayed event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebuildPolicy {
    /// Report the mismatch; the stored snapshot is left as it is.
    #[default]
    Verify,
    /// Overwrite the stored snapshot with the replayed one.
    Repair,
}

/// Outcome of a successful [`Decider::rebuild`].
#[derive(Debug, Clone, PartialEq)]
pub struct RebuildReport {
    pub entity_id: String,
    /// Replayed snapshot; `None` when the entity has no history.
    pub snapshot: Option<Snapshot>,
    /// Number of events replayed.
    pub events: usize,
    /// Whether a snapshot was written.
    pub written: bool,
    /// Whether the entity was halted before the rebuild.
    pub was_halted: bool,
}

pub struct Decider<S: LifecycleStorage> {
    machine: Arc<MachineDefinition>,
    builders: Arc<BuilderRegistry>,
    capabilities: Arc<dyn CapabilityCheck>,
    storage: Arc<S>,
    mirror: Arc<dyn MirrorSink>,
    locks: EntityLocks,
    halted: Mutex<HashSet<String>>,
    config: DeciderConfig,
}

impl<S: LifecycleStorage> Decider<S> {
    pub fn new(
        machine: Arc<MachineDefinition>,
        builders: Arc<BuilderRegistry>,
        capabilities: Arc<dyn CapabilityCheck>,
        storage: Arc<S>,
    ) -> Self {
        Self {
            machine,
            builders,
            capabilities,
            storage,
            mirror: Arc::new(NoopMirror),
            locks: EntityLocks::new(),
            halted: Mutex::new(HashSet::new()),
            config: DeciderConfig::default(),
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn MirrorSink>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn with_config(mut self, config: DeciderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn machine(&self) -> &Arc<MachineDefinition> {
        &self.machine
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Validate `command` against the entity's current state and, when legal,
    /// commit the resulting event and snapshot atomically.
    pub async fn decide(&self, command: &Command) -> Result<Event, DecideError> {
        let _guard = self.lock(&command.entity_id).await?;
        self.ensure_not_halted(&command.entity_id)?;

        let current = self.storage.get_snapshot(&command.entity_id).await?;
        if let Some(snap) = &current {
            if snap.entity_type != command.entity_type {
                return Err(DecideError::InvalidTransition {
                    entity_id: command.entity_id.clone(),
                    command_type: command.command_type.clone(),
                    reason: format!(
                        "entity is a '{}', not a '{}'",
                        snap.entity_type, command.entity_type
                    ),
                });
            }
        }
        let current_state = current.as_ref().map(|s| s.state.as_str());

        let rule = match self.machine.resolve(
            &command.entity_type,
            &command.command_type,
            current_state,
        ) {
            Resolution::Rule(rule) => rule,
            Resolution::NotApplicable => {
                return Err(DecideError::InvalidTransition {
                    entity_id: command.entity_id.clone(),
                    command_type: command.command_type.clone(),
                    reason: match current_state {
                        Some(state) => format!("no rule from state '{state}'"),
                        None => "entity does not exist".to_string(),
                    },
                })
            }
            Resolution::UnknownCommand => {
                return Err(DecideError::UnknownCommand {
                    entity_type: command.entity_type.clone(),
                    command_type: command.command_type.clone(),
                })
            }
        };

        if !self
            .capabilities
            .has_capability(&command.requester, &rule.required_capability)
        {
            return Err(DecideError::Unauthorized {
                requester: command.requester.clone(),
                capability: rule.required_capability.clone(),
            });
        }

        let built = self
            .builders
            .get(&command.entity_type, &command.command_type)
            .build(command, current.as_ref(), rule)
            .map_err(|e| DecideError::InvalidCommand {
                command_type: command.command_type.clone(),
                reason: e.to_string(),
            })?;

        let event = Event {
            event_id: uuid::Uuid::new_v4().to_string(),
            entity_id: command.entity_id.clone(),
            entity_type: command.entity_type.clone(),
            event_type: rule.event_type.clone(),
            version: current.as_ref().map_or(1, |s| s.version + 1),
            from_state: current_state.map(str::to_string),
            to_state: rule.to_state.clone(),
            payload: built.payload,
            attributes: built.attributes,
            produced_at: now_rfc3339(),
            causation_id: command.id.clone(),
            requester: command.requester.clone(),
        };

        let next = project(current.as_ref(), &event)
            .map_err(|e| self.halt(&command.entity_id, e.to_string()))?;

        self.commit(&event, next, current.as_ref().map(|s| s.version))
            .await?;

        tracing::debug!(
            entity_id = %event.entity_id,
            event_type = %event.event_type,
            version = event.version,
            requester = %event.requester,
            "command accepted"
        );
        self.mirror.dispatch(&event);
        Ok(event)
    }

    async fn commit(
        &self,
        event: &Event,
        snapshot: Snapshot,
        expected_version: Option<i64>,
    ) -> Result<(), DecideError> {
        let mut tx = self.storage.begin_transaction().await?;
        self.storage.append_event(&mut tx, event.clone()).await?;
        self.storage
            .put_snapshot(&mut tx, snapshot, expected_version)
            .await?;
        match self.storage.commit_transaction(tx).await {
            Ok(()) => Ok(()),
            Err(StorageError::ConcurrentConflict { entity_id, .. }) => {
                tracing::debug!(%entity_id, "snapshot compare-and-swap lost");
                Err(DecideError::Conflict { entity_id })
            }
            Err(e @ StorageError::VersionGap { .. })
            | Err(e @ StorageError::InconsistentTransaction { .. }) => {
                Err(self.halt(&event.entity_id, e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current snapshot of an entity, `None` if it never accepted an event.
    pub async fn snapshot(&self, entity_id: &str) -> Result<Option<Snapshot>, DecideError> {
        Ok(self.storage.get_snapshot(entity_id).await?)
    }

    /// Events of an entity from `from_version` (inclusive) in version order.
    pub async fn history(&self, entity_id: &str, from_version: i64) -> Result<Vec<Event>, DecideError> {
        Ok(self.storage.read_events(entity_id, from_version).await?)
    }

    /// Replay the event log of `entity_id` through the projector and compare
    /// the result with the stored snapshot.
    ///
    /// A lost snapshot is always written back. A stored snapshot that differs
    /// from the replay is a `ProjectionInvariantViolation` under
    /// [`RebuildPolicy::Verify`] and is overwritten under
    /// [`RebuildPolicy::Repair`]. A successful rebuild lifts any halt on the
    /// entity.
    pub async fn rebuild(
        &self,
        entity_id: &str,
        policy: RebuildPolicy,
    ) -> Result<RebuildReport, DecideError> {
        let _guard = self.lock(entity_id).await?;

        let history = self.storage.read_events(entity_id, 1).await?;
        let replayed = replay(&history).map_err(|e| self.halt(entity_id, e.to_string()))?;
        let stored = self.storage.get_snapshot(entity_id).await?;

        let written = match (&replayed, &stored) {
            (None, None) => false,
            (Some(_), Some(s)) if replayed.as_ref() == Some(s) => false,
            (None, Some(s)) => {
                return Err(self.halt(
                    entity_id,
                    format!("snapshot at version {} has no event history", s.version),
                ))
            }
            (Some(r), None) => {
                self.write_snapshot(r.clone(), None).await?;
                tracing::info!(entity_id, version = r.version, "restored lost snapshot");
                true
            }
            (Some(r), Some(s)) => match policy {
                RebuildPolicy::Verify => {
                    return Err(self.halt(
                        entity_id,
                        format!(
                            "stored snapshot {}@{} differs from replayed {}@{}",
                            s.state, s.version, r.state, r.version
                        ),
                    ))
                }
                RebuildPolicy::Repair => {
                    self.write_snapshot(r.clone(), Some(s.version)).await?;
                    tracing::warn!(
                        entity_id,
                        stored_version = s.version,
                        replayed_version = r.version,
                        "replaced divergent snapshot"
                    );
                    true
                }
            },
        };

        let was_halted = self.lift_halt(entity_id);
        if was_halted {
            tracing::info!(entity_id, "entity halt lifted after rebuild");
        }
        Ok(RebuildReport {
            entity_id: entity_id.to_string(),
            snapshot: replayed,
            events: history.len(),
            written,
            was_halted,
        })
    }

    async fn write_snapshot(
        &self,
        snapshot: Snapshot,
        expected_version: Option<i64>,
    ) -> Result<(), DecideError> {
        let entity_id = snapshot.entity_id.clone();
        let mut tx = self.storage.begin_transaction().await?;
        self.storage
            .put_snapshot(&mut tx, snapshot, expected_version)
            .await?;
        self.storage
            .commit_transaction(tx)
            .await
            .map_err(|e| match e {
                StorageError::ConcurrentConflict { .. } => DecideError::Conflict { entity_id },
                other => other.into(),
            })
    }

    /// Whether commands for `entity_id` are refused until a rebuild.
    pub fn is_halted(&self, entity_id: &str) -> bool {
        self.halted_set().contains(entity_id)
    }

    /// Every halted entity id, sorted.
    pub fn halted(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.halted_set().iter().cloned().collect();
        ids.sort();
        ids
    }

    async fn lock(&self, entity_id: &str) -> Result<EntityGuard, DecideError> {
        self.locks
            .acquire(entity_id, self.config.lock_timeout)
            .await
            .ok_or_else(|| DecideError::Busy {
                entity_id: entity_id.to_string(),
            })
    }

    fn ensure_not_halted(&self, entity_id: &str) -> Result<(), DecideError> {
        if self.is_halted(entity_id) {
            return Err(DecideError::ProjectionInvariantViolation {
                entity_id: entity_id.to_string(),
                detail: "entity is halted until rebuilt".to_string(),
            });
        }
        Ok(())
    }

    fn halt(&self, entity_id: &str, detail: String) -> DecideError {
        tracing::error!(entity_id, %detail, "projection invariant violated; entity halted");
        self.halted_set().insert(entity_id.to_string());
        DecideError::ProjectionInvariantViolation {
            entity_id: entity_id.to_string(),
            detail,
        }
    }

    fn lift_halt(&self, entity_id: &str) -> bool {
        self.halted_set().remove(entity_id)
    }

    fn halted_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.halted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S: LifecycleStorage> std::fmt::Debug for Decider<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decider")
            .field("entity_types", &self.machine.entity_types().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{AllowAll, StaticCapabilities};
    use serde_json::json;
    use waymark_storage::InMemoryStorage;

    fn machine() -> Arc<MachineDefinition> {
        Arc::new(
            MachineDefinition::builder()
                .entity("doc", &["draft", "final"])
                .rule("doc", "create", &["_initial"], "draft", "created", "doc:create")
                .rule("doc", "edit", &["draft"], "draft", "edited", "doc:edit")
                .rule("doc", "publish", &["draft"], "final", "published", "doc:publish")
                .build()
                .unwrap(),
        )
    }

    fn decider(caps: Arc<dyn CapabilityCheck>) -> Decider<InMemoryStorage> {
        Decider::new(
            machine(),
            Arc::new(BuilderRegistry::new()),
            caps,
            Arc::new(InMemoryStorage::new()),
        )
    }

    #[tokio::test]
    async fn accepted_command_produces_versioned_event_and_snapshot() {
        let d = decider(Arc::new(AllowAll));
        let cmd = Command::new("doc", "d1", "create", "alice")
            .with_id("c1")
            .with_payload(json!({"title": "x"}));
        let event = d.decide(&cmd).await.unwrap();
        assert_eq!(event.version, 1);
        assert_eq!(event.from_state, None);
        assert_eq!(event.to_state, "draft");
        assert_eq!(event.causation_id, "c1");
        assert_eq!(event.payload, json!({"title": "x"}));
        assert!(time::OffsetDateTime::parse(
            &event.produced_at,
            &time::format_description::well_known::Rfc3339
        )
        .is_ok());

        let snap = d.snapshot("d1").await.unwrap().unwrap();
        assert_eq!((snap.state.as_str(), snap.version), ("draft", 1));
        assert_eq!(snap.last_event_at, event.produced_at);
    }

    #[tokio::test]
    async fn rejections_are_typed() {
        let caps = StaticCapabilities::new().grant("alice", &["doc:create", "doc:edit"]);
        let d = decider(Arc::new(caps));

        let edit_absent = Command::new("doc", "d1", "edit", "alice");
        assert!(matches!(
            d.decide(&edit_absent).await,
            Err(DecideError::InvalidTransition { .. })
        ));

        let unknown = Command::new("doc", "d1", "shred", "alice");
        assert!(matches!(
            d.decide(&unknown).await,
            Err(DecideError::UnknownCommand { .. })
        ));

        let unknown_type = Command::new("sheet", "s1", "create", "alice");
        assert!(matches!(
            d.decide(&unknown_type).await,
            Err(DecideError::UnknownCommand { .. })
        ));

        d.decide(&Command::new("doc", "d1", "create", "alice"))
            .await
            .unwrap();
        let publish = Command::new("doc", "d1", "publish", "alice");
        assert!(matches!(
            d.decide(&publish).await,
            Err(DecideError::Unauthorized { capability, .. }) if capability == "doc:publish"
        ));
        assert_eq!(d.snapshot("d1").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn snapshot_of_another_type_is_invalid_transition() {
        let m = Arc::new(
            MachineDefinition::builder()
                .entity("doc", &["draft"])
                .entity("sheet", &["draft"])
                .rule("doc", "create", &["_initial"], "draft", "created", "c")
                .rule("sheet", "create", &[], "draft", "created", "c")
                .build()
                .unwrap(),
        );
        let d = Decider::new(
            m,
            Arc::new(BuilderRegistry::new()),
            Arc::new(AllowAll),
            Arc::new(InMemoryStorage::new()),
        );
        d.decide(&Command::new("doc", "x", "create", "a")).await.unwrap();
        let err = d
            .decide(&Command::new("sheet", "x", "create", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, DecideError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn builder_rejection_is_invalid_command() {
        let mut builders = BuilderRegistry::new();
        builders.register(
            "doc",
            "create",
            |_: &Command,
             _: Option<&Snapshot>,
             _: &crate::TransitionRule|
             -> Result<crate::BuiltEvent, crate::BuildError> {
                Err(crate::BuildError::MissingField("title"))
            },
        );
        let d = Decider::new(
            machine(),
            Arc::new(builders),
            Arc::new(AllowAll),
            Arc::new(InMemoryStorage::new()),
        );
        let err = d
            .decide(&Command::new("doc", "d1", "create", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, DecideError::InvalidCommand { .. }));
        assert!(d.snapshot("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn busy_when_lock_is_held() {
        let d = decider(Arc::new(AllowAll)).with_config(DeciderConfig {
            lock_timeout: Duration::from_millis(20),
        });
        let _held = d.lock("d1").await.unwrap();
        let err = d
            .decide(&Command::new("doc", "d1", "create", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, DecideError::Busy { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn rebuild_restores_lost_snapshot_and_lifts_halt() {
        let storage = Arc::new(InMemoryStorage::new());
        let d = Decider::new(
            machine(),
            Arc::new(BuilderRegistry::new()),
            Arc::new(AllowAll),
            storage.clone(),
        );
        d.decide(&Command::new("doc", "d1", "create", "a")).await.unwrap();
        d.decide(&Command::new("doc", "d1", "edit", "a")).await.unwrap();

        let fresh = Decider::new(
            machine(),
            Arc::new(BuilderRegistry::new()),
            Arc::new(AllowAll),
            Arc::new(InMemoryStorage::new()),
        );
        // Same events, no snapshot.
        let mut tx = fresh.storage().begin_transaction().await.unwrap();
        for event in storage.read_events("d1", 1).await.unwrap() {
            fresh.storage().append_event(&mut tx, event).await.unwrap();
        }
        fresh.storage().commit_transaction(tx).await.unwrap();
        fresh.halt("d1", "simulated".to_string());
        assert!(fresh.is_halted("d1"));
        assert!(matches!(
            fresh.decide(&Command::new("doc", "d1", "edit", "a")).await,
            Err(DecideError::ProjectionInvariantViolation { .. })
        ));

        let report = fresh.rebuild("d1", RebuildPolicy::Verify).await.unwrap();
        assert!(report.written);
        assert!(report.was_halted);
        assert_eq!(report.events, 2);
        assert_eq!(
            fresh.snapshot("d1").await.unwrap(),
            storage.get_snapshot("d1").await.unwrap()
        );
        assert!(!fresh.is_halted("d1"));
        assert_eq!(
            fresh
                .decide(&Command::new("doc", "d1", "edit", "a"))
                .await
                .unwrap()
                .version,
            3
        );
    }

    #[tokio::test]
    async fn rebuild_of_consistent_entity_writes_nothing() {
        let d = decider(Arc::new(AllowAll));
        d.decide(&Command::new("doc", "d1", "create", "a")).await.unwrap();
        let report = d.rebuild("d1", RebuildPolicy::Verify).await.unwrap();
        assert!(!report.written);
        assert_eq!(report.snapshot.map(|s| s.version), Some(1));

        let empty = d.rebuild("nobody", RebuildPolicy::Repair).await.unwrap();
        assert_eq!(empty.snapshot, None);
        assert_eq!(empty.events, 0);
    }
}

//! Waymark lifecycle engine -- validates commands against an entity's
//! current state, produces immutable versioned events, and keeps a
//! materialized snapshot per entity.
//!
//! The engine is generic over the entity type: a [`MachineDefinition`] says
//! which commands are legal from which states, per-type [`EventBuilder`]s
//! shape event payloads, and the [`Decider`] ties both to a
//! [`LifecycleStorage`](waymark_storage::LifecycleStorage) backend. The
//! [`file`] module ships the file lifecycle as the first entity type.

pub mod builder;
pub mod capability;
pub mod command;
pub mod decider;
pub mod error;
pub mod file;
pub mod lock;
pub mod machine;
pub mod mirror;
pub mod projector;
pub mod router;

pub use builder::{BuildError, BuilderRegistry, BuiltEvent, EventBuilder, PassthroughBuilder};
pub use capability::{AllowAll, CapabilityCheck, StaticCapabilities};
pub use command::Command;
pub use decider::{Decider, DeciderConfig, RebuildPolicy, RebuildReport};
pub use error::DecideError;
pub use machine::{
    MachineBuilder, MachineDefinition, MachineError, Resolution, TransitionRule, INITIAL_STATE,
};
pub use mirror::{MirrorSink, NoopMirror};
pub use projector::{attribute_str, project, replay, ProjectionError};
pub use router::CommandRouter;

/// An accepted, immutable, versioned state change.
pub type Event = waymark_storage::EventRecord;

/// The materialized current state of one entity.
pub type Snapshot = waymark_storage::SnapshotRecord;

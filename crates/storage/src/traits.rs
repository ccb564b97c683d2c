use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{EventRecord, SnapshotRecord};

/// The storage trait for Waymark lifecycle backends.
///
/// A `LifecycleStorage` implementation provides two things keyed by entity id:
/// a snapshot store (current materialized state) and an append-only event log.
///
/// ## Transaction Semantics
///
/// All mutating operations take `&mut Self::Transaction`. The lifecycle is:
///
/// 1. `begin_transaction()`: start a transaction
/// 2. `append_event` / `put_snapshot` with `&mut tx`
/// 3. `commit_transaction(tx)`: apply every staged write or none of them
///    OR `abort_transaction(tx)`: discard the staged writes
///
/// Dropping a `Transaction` without committing MUST discard its writes.
///
/// ## Compare-and-swap
///
/// `put_snapshot` carries the version the writer read. Commit fails with
/// `StorageError::ConcurrentConflict` when the stored snapshot no longer has
/// that version (or exists when `None` was expected). `append_event` must
/// continue the log exactly at `last_version + 1`, else `VersionGap`. These
/// checks are what keep two processes sharing one backend from accepting the
/// same version twice; the in-process entity lock is not enough on its own.
/// A backend that validates against a private in-memory copy must instead
/// refuse to be shared at all (see `JsonlStorage`, which locks its directory).
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be shared behind `Arc`
/// across async tasks.
#[async_trait]
pub trait LifecycleStorage: Send + Sync + 'static {
    /// The in-progress transaction type used by this storage backend.
    type Transaction: Send;

    // ── Transaction lifecycle ────────────────────────────────────────────────

    /// Begin a new transaction.
    async fn begin_transaction(&self) -> Result<Self::Transaction, StorageError>;

    /// Commit a transaction, making all staged writes durable atomically.
    async fn commit_transaction(&self, tx: Self::Transaction) -> Result<(), StorageError>;

    /// Abort a transaction, discarding all staged writes.
    async fn abort_transaction(&self, tx: Self::Transaction) -> Result<(), StorageError>;

    // ── Writes (within transaction) ──────────────────────────────────────────

    /// Stage an event for append. Version contiguity is checked at commit.
    async fn append_event(
        &self,
        tx: &mut Self::Transaction,
        event: EventRecord,
    ) -> Result<(), StorageError>;

    /// Stage a snapshot write conditional on the stored version.
    ///
    /// `expected_version = None` requires that no snapshot exists yet.
    async fn put_snapshot(
        &self,
        tx: &mut Self::Transaction,
        snapshot: SnapshotRecord,
        expected_version: Option<i64>,
    ) -> Result<(), StorageError>;

    // ── Queries (outside transaction) ────────────────────────────────────────

    /// Read an entity's current snapshot. `Ok(None)` when the entity has never
    /// accepted an event.
    async fn get_snapshot(&self, entity_id: &str) -> Result<Option<SnapshotRecord>, StorageError>;

    /// Read the event log of an entity from `from_version` (inclusive), in
    /// version order.
    async fn read_events(
        &self,
        entity_id: &str,
        from_version: i64,
    ) -> Result<Vec<EventRecord>, StorageError>;

    /// List snapshots, optionally filtered by entity type and state.
    async fn list_snapshots(
        &self,
        entity_type: Option<&str>,
        state_filter: Option<&str>,
    ) -> Result<Vec<SnapshotRecord>, StorageError>;
}

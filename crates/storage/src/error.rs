/// All errors that can be returned by a LifecycleStorage implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency control conflict: another writer moved the
    /// snapshot past the expected version before this transaction committed.
    #[error("concurrent conflict on entity {entity_id}: expected version {expected_version:?}")]
    ConcurrentConflict {
        entity_id: String,
        /// `None` means the writer expected the snapshot to be absent.
        expected_version: Option<i64>,
    },

    /// An event was appended out of sequence: the log for this entity ends at
    /// `last_version` and the next event must carry `last_version + 1`.
    #[error(
        "event version gap on entity {entity_id}: log ends at {last_version}, got {attempted_version}"
    )]
    VersionGap {
        entity_id: String,
        last_version: i64,
        attempted_version: i64,
    },

    /// A record inside one transaction disagrees with another record of the
    /// same transaction (e.g. snapshot version differs from the appended event).
    #[error("inconsistent transaction for entity {entity_id}: {message}")]
    InconsistentTransaction { entity_id: String, message: String },

    /// Another handle (in this or another process) already owns the data
    /// directory.
    #[error("storage at '{0}' is locked by another process")]
    Locked(String),

    /// A backend-specific storage error (I/O, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

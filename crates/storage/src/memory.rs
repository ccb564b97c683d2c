//! In-process storage backend.
//!
//! Holds every snapshot and event in memory behind one async lock. Commit
//! validation lives in [`StoreState::apply`] so the JSON-lines backend can
//! reuse exactly the same compare-and-swap rules.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::record::{EventRecord, SnapshotRecord};
use crate::traits::LifecycleStorage;

/// Staged writes of an in-progress transaction.
#[derive(Debug, Default)]
pub struct MemoryTransaction {
    pub(crate) events: Vec<EventRecord>,
    pub(crate) snapshots: Vec<(SnapshotRecord, Option<i64>)>,
}

impl MemoryTransaction {
    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty() && self.snapshots.is_empty()
    }
}

/// Committed state shared by the in-memory and JSON-lines backends.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    snapshots: BTreeMap<String, SnapshotRecord>,
    events: HashMap<String, Vec<EventRecord>>,
}

impl StoreState {
    fn last_version(&self, entity_id: &str) -> i64 {
        self.events
            .get(entity_id)
            .and_then(|log| log.last())
            .map(|e| e.version)
            .unwrap_or(0)
    }

    /// Check every staged write against the committed state without mutating it.
    pub(crate) fn validate(&self, tx: &MemoryTransaction) -> Result<(), StorageError> {
        // Snapshot CAS first: two racing writers both stage event N+1, and the
        // loser should see a conflict rather than a gap.
        let mut seen: Vec<&str> = Vec::new();
        for (snapshot, expected) in &tx.snapshots {
            if seen.contains(&snapshot.entity_id.as_str()) {
                return Err(StorageError::InconsistentTransaction {
                    entity_id: snapshot.entity_id.clone(),
                    message: "snapshot written twice in one transaction".to_string(),
                });
            }
            seen.push(&snapshot.entity_id);

            let current = self.snapshots.get(&snapshot.entity_id).map(|s| s.version);
            if current != *expected {
                return Err(StorageError::ConcurrentConflict {
                    entity_id: snapshot.entity_id.clone(),
                    expected_version: *expected,
                });
            }
        }

        let mut next: HashMap<&str, i64> = HashMap::new();
        for event in &tx.events {
            let expected = next
                .get(event.entity_id.as_str())
                .copied()
                .unwrap_or_else(|| self.last_version(&event.entity_id) + 1);
            if event.version != expected {
                return Err(StorageError::VersionGap {
                    entity_id: event.entity_id.clone(),
                    last_version: expected - 1,
                    attempted_version: event.version,
                });
            }
            next.insert(event.entity_id.as_str(), expected + 1);
        }

        for (snapshot, _) in &tx.snapshots {
            let log_end = next
                .get(snapshot.entity_id.as_str())
                .map(|n| n - 1)
                .unwrap_or_else(|| self.last_version(&snapshot.entity_id));
            if log_end != 0 && snapshot.version != log_end {
                return Err(StorageError::InconsistentTransaction {
                    entity_id: snapshot.entity_id.clone(),
                    message: format!(
                        "snapshot version {} does not match event log end {}",
                        snapshot.version, log_end
                    ),
                });
            }
        }

        Ok(())
    }

    /// Validate and apply a transaction. Nothing is applied on error.
    pub(crate) fn apply(&mut self, tx: MemoryTransaction) -> Result<(), StorageError> {
        self.validate(&tx)?;
        self.apply_unchecked(tx);
        Ok(())
    }

    /// Apply writes already known to be valid (e.g. replayed from a journal).
    pub(crate) fn apply_unchecked(&mut self, tx: MemoryTransaction) {
        for event in tx.events {
            self.events
                .entry(event.entity_id.clone())
                .or_default()
                .push(event);
        }
        for (snapshot, _) in tx.snapshots {
            self.snapshots.insert(snapshot.entity_id.clone(), snapshot);
        }
    }

    pub(crate) fn snapshot(&self, entity_id: &str) -> Option<SnapshotRecord> {
        self.snapshots.get(entity_id).cloned()
    }

    pub(crate) fn events_from(&self, entity_id: &str, from_version: i64) -> Vec<EventRecord> {
        self.events
            .get(entity_id)
            .map(|log| {
                log.iter()
                    .filter(|e| e.version >= from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn list(
        &self,
        entity_type: Option<&str>,
        state_filter: Option<&str>,
    ) -> Vec<SnapshotRecord> {
        self.snapshots
            .values()
            .filter(|s| entity_type.map_or(true, |t| s.entity_type == t))
            .filter(|s| state_filter.map_or(true, |st| s.state == st))
            .cloned()
            .collect()
    }
}

/// Volatile storage backend. Suitable for tests and single-process use where
/// losing history on restart is acceptable.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: RwLock<StoreState>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LifecycleStorage for InMemoryStorage {
    type Transaction = MemoryTransaction;

    async fn begin_transaction(&self) -> Result<MemoryTransaction, StorageError> {
        Ok(MemoryTransaction::default())
    }

    async fn commit_transaction(&self, tx: MemoryTransaction) -> Result<(), StorageError> {
        if tx.is_empty() {
            return Ok(());
        }
        let mut state = self.state.write().await;
        state.apply(tx)
    }

    async fn abort_transaction(&self, _tx: MemoryTransaction) -> Result<(), StorageError> {
        Ok(())
    }

    async fn append_event(
        &self,
        tx: &mut MemoryTransaction,
        event: EventRecord,
    ) -> Result<(), StorageError> {
        tx.events.push(event);
        Ok(())
    }

    async fn put_snapshot(
        &self,
        tx: &mut MemoryTransaction,
        snapshot: SnapshotRecord,
        expected_version: Option<i64>,
    ) -> Result<(), StorageError> {
        tx.snapshots.push((snapshot, expected_version));
        Ok(())
    }

    async fn get_snapshot(&self, entity_id: &str) -> Result<Option<SnapshotRecord>, StorageError> {
        Ok(self.state.read().await.snapshot(entity_id))
    }

    async fn read_events(
        &self,
        entity_id: &str,
        from_version: i64,
    ) -> Result<Vec<EventRecord>, StorageError> {
        Ok(self.state.read().await.events_from(entity_id, from_version))
    }

    async fn list_snapshots(
        &self,
        entity_type: Option<&str>,
        state_filter: Option<&str>,
    ) -> Result<Vec<SnapshotRecord>, StorageError> {
        Ok(self.state.read().await.list(entity_type, state_filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance::run_conformance_suite;

    #[tokio::test]
    async fn in_memory_passes_conformance() {
        let report = run_conformance_suite(|| async { InMemoryStorage::new() }).await;
        assert!(report.failed == 0, "{report}");
        assert!(report.total > 20);
    }

    #[tokio::test]
    async fn empty_commit_is_a_no_op() {
        let storage = InMemoryStorage::new();
        let tx = storage.begin_transaction().await.unwrap();
        storage.commit_transaction(tx).await.unwrap();
        assert!(storage.list_snapshots(None, None).await.unwrap().is_empty());
    }
}

//! Per-entity mutual exclusion.
//!
//! A concurrent map from entity id to an async mutex. Entries are created on
//! first use and removed again when the last guard drops, so the table only
//! ever holds entities that are in flight.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockTable = DashMap<String, Arc<AsyncMutex<()>>>;

#[derive(Debug, Default)]
pub struct EntityLocks {
    table: Arc<LockTable>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for exclusive access to `entity_id`.
    /// Returns `None` when the wait timed out.
    pub async fn acquire(&self, entity_id: &str, timeout: Duration) -> Option<EntityGuard> {
        let slot = self
            .table
            .entry(entity_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        // Bind before matching so the pending future (and its clone of the
        // slot) is dropped before a timed-out waiter retires the entry.
        let waited = tokio::time::timeout(timeout, slot.clone().lock_owned()).await;
        match waited {
            Ok(guard) => Some(EntityGuard {
                guard: Some(guard),
                slot: Some(slot),
                entity_id: entity_id.to_string(),
                table: self.table.clone(),
            }),
            Err(_) => {
                tracing::debug!(entity_id, "entity lock wait timed out");
                retire(&self.table, entity_id, slot);
                None
            }
        }
    }

    /// Number of entities that currently have a holder or waiter.
    pub fn active(&self) -> usize {
        self.table.len()
    }
}

/// Exclusive access to one entity id. Released on drop.
#[derive(Debug)]
pub struct EntityGuard {
    guard: Option<OwnedMutexGuard<()>>,
    slot: Option<Arc<AsyncMutex<()>>>,
    entity_id: String,
    table: Arc<LockTable>,
}

impl EntityGuard {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        // The owned guard holds its own clone of the slot.
        drop(self.guard.take());
        if let Some(slot) = self.slot.take() {
            retire(&self.table, &self.entity_id, slot);
        }
    }
}

/// Remove the table entry for `entity_id` once the table holds the only
/// reference left. The check runs under the map's shard lock, so a
/// concurrent `acquire` either sees the entry or inserts a fresh one.
fn retire(table: &LockTable, entity_id: &str, slot: Arc<AsyncMutex<()>>) {
    drop(slot);
    table.remove_if(entity_id, |_, entry| Arc::strong_count(entry) == 1);
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let locks = EntityLocks::new();
        let held = locks.acquire("f1", WAIT).await.unwrap();
        assert!(locks.acquire("f1", WAIT).await.is_none());
        drop(held);
        assert!(locks.acquire("f1", WAIT).await.is_some());
    }

    #[tokio::test]
    async fn distinct_entities_do_not_block_each_other() {
        let locks = EntityLocks::new();
        let _a = locks.acquire("a", WAIT).await.unwrap();
        let b = locks.acquire("b", WAIT).await;
        assert!(b.is_some());
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn entries_are_retired_when_idle() {
        let locks = EntityLocks::new();
        {
            let _g = locks.acquire("f1", WAIT).await.unwrap();
            assert_eq!(locks.active(), 1);
            assert!(locks.acquire("f1", WAIT).await.is_none());
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_release() {
        let locks = Arc::new(EntityLocks::new());
        let held = locks.acquire("f1", WAIT).await.unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire("f1", Duration::from_secs(5))
                    .await
                    .map(|g| g.entity_id().to_string())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert_eq!(waiter.await.unwrap().as_deref(), Some("f1"));
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn table_is_empty_after_contended_bursts() {
        let locks = Arc::new(EntityLocks::new());
        let mut tasks = Vec::new();
        for i in 0..64 {
            let locks = locks.clone();
            let id = format!("f{}", i % 4);
            tasks.push(tokio::spawn(async move {
                if let Some(guard) = locks.acquire(&id, Duration::from_secs(5)).await {
                    tokio::task::yield_now().await;
                    drop(guard);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(locks.active(), 0);
    }
}

use std::future::Future;
use std::sync::Arc;

use super::{commit_step, expect_snapshot, TestResult};
use crate::{LifecycleStorage, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "racing_writers_exactly_one_wins",
            racing_writers_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "racing_creators_exactly_one_wins",
            racing_creators_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "different_entities_all_succeed",
            different_entities_all_succeed(factory).await,
        ),
    ]
}

/// Spawn N tasks that each try to commit `version` for `entity_id` and count
/// how many won. Any error other than a lost CAS aborts the test.
async fn race<S: LifecycleStorage>(
    storage: &Arc<S>,
    entity_id: &str,
    version: i64,
) -> Result<(usize, usize), String> {
    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        let entity_id = entity_id.to_string();
        handles.push(tokio::spawn(async move {
            let from = if version > 1 { Some("exists") } else { None };
            let to = if i % 2 == 0 { "exists" } else { "deleted" };
            match commit_step(s.as_ref(), &entity_id, version, from, to).await {
                Ok(()) => Ok(true),
                Err(StorageError::ConcurrentConflict { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    let mut losers = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        } else {
            losers += 1;
        }
    }
    Ok((winners, losers))
}

// ── Racing writers on one entity: exactly one wins ───────────────────────────

async fn racing_writers_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    commit_step(storage.as_ref(), "f1", 1, None, "exists")
        .await
        .map_err(|e| format!("seed: {e}"))?;

    let (winners, losers) = race(&storage, "f1", 2).await?;
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    if losers != N - 1 {
        return Err(format!("expected {} losers, got {losers}", N - 1));
    }

    let events = storage
        .read_events("f1", 1)
        .await
        .map_err(|e| format!("read_events: {e}"))?;
    let versions: Vec<i64> = events.iter().map(|e| e.version).collect();
    if versions != vec![1, 2] {
        return Err(format!("expected log [1, 2], got {versions:?}"));
    }
    let snap = expect_snapshot(storage.as_ref(), "f1").await?;
    if snap.state != events[1].to_state {
        return Err(format!(
            "snapshot state {} does not match winning event {}",
            snap.state, events[1].to_state
        ));
    }
    Ok(())
}

// ── Racing creators: exactly one wins ───────────────────────────────────────

async fn racing_creators_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let (winners, _) = race(&storage, "f1", 1).await?;
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    Ok(())
}

// ── Different entities: no false conflicts ──────────────────────────────────

async fn different_entities_all_succeed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            commit_step(s.as_ref(), &format!("f{i}"), 1, None, "exists").await
        }));
    }
    for handle in handles {
        handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
    }
    let all = storage
        .list_snapshots(None, None)
        .await
        .map_err(|e| format!("list: {e}"))?;
    if all.len() != N {
        return Err(format!("expected {N} snapshots, got {}", all.len()));
    }
    Ok(())
}

use std::future::Future;

use super::{commit_step, expect_snapshot, make_event, make_snapshot, TestResult};
use crate::LifecycleStorage;

pub(super) async fn run_commit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "commit",
            "uncommitted_writes_invisible",
            uncommitted_writes_invisible(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "aborted_writes_discarded",
            aborted_writes_discarded(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "dropped_transaction_discarded",
            dropped_transaction_discarded(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "event_and_snapshot_visible_together",
            event_and_snapshot_visible_together(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "failed_snapshot_cas_discards_event",
            failed_snapshot_cas_discards_event(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "multi_entity_commit_is_atomic",
            multi_entity_commit_is_atomic(factory).await,
        ),
    ]
}

async fn uncommitted_writes_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut tx = storage
        .begin_transaction()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .append_event(&mut tx, make_event("f1", 1, None, "exists"))
        .await
        .map_err(|e| format!("append: {e}"))?;
    storage
        .put_snapshot(&mut tx, make_snapshot("f1", "exists", 1), None)
        .await
        .map_err(|e| format!("put: {e}"))?;

    let snap = storage
        .get_snapshot("f1")
        .await
        .map_err(|e| format!("get_snapshot: {e}"))?;
    let events = storage
        .read_events("f1", 1)
        .await
        .map_err(|e| format!("read_events: {e}"))?;
    storage
        .abort_transaction(tx)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    if snap.is_some() || !events.is_empty() {
        return Err("uncommitted writes were visible".to_string());
    }
    Ok(())
}

async fn aborted_writes_discarded<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut tx = storage
        .begin_transaction()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .append_event(&mut tx, make_event("f1", 1, None, "exists"))
        .await
        .map_err(|e| format!("append: {e}"))?;
    storage
        .put_snapshot(&mut tx, make_snapshot("f1", "exists", 1), None)
        .await
        .map_err(|e| format!("put: {e}"))?;
    storage
        .abort_transaction(tx)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    if storage
        .get_snapshot("f1")
        .await
        .map_err(|e| format!("get_snapshot: {e}"))?
        .is_some()
    {
        return Err("aborted snapshot was persisted".to_string());
    }
    // The same version must still be available after the abort.
    commit_step(&storage, "f1", 1, None, "exists")
        .await
        .map_err(|e| format!("commit after abort: {e}"))
}

async fn dropped_transaction_discarded<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    {
        let mut tx = storage
            .begin_transaction()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        storage
            .append_event(&mut tx, make_event("f1", 1, None, "exists"))
            .await
            .map_err(|e| format!("append: {e}"))?;
    }
    let events = storage
        .read_events("f1", 1)
        .await
        .map_err(|e| format!("read_events: {e}"))?;
    if !events.is_empty() {
        return Err("dropped transaction leaked an event".to_string());
    }
    Ok(())
}

async fn event_and_snapshot_visible_together<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    commit_step(&storage, "f1", 1, None, "exists")
        .await
        .map_err(|e| format!("commit: {e}"))?;
    let snap = expect_snapshot(&storage, "f1").await?;
    let events = storage
        .read_events("f1", 1)
        .await
        .map_err(|e| format!("read_events: {e}"))?;
    if events.len() != 1 || events[0].version != snap.version {
        return Err(format!(
            "log has {} events, snapshot at version {}",
            events.len(),
            snap.version
        ));
    }
    Ok(())
}

async fn failed_snapshot_cas_discards_event<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    commit_step(&storage, "f1", 1, None, "exists")
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut tx = storage
        .begin_transaction()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .append_event(&mut tx, make_event("f1", 2, Some("exists"), "deleted"))
        .await
        .map_err(|e| format!("append: {e}"))?;
    // Stale expectation: the stored snapshot is at version 1, not 5.
    storage
        .put_snapshot(&mut tx, make_snapshot("f1", "deleted", 2), Some(5))
        .await
        .map_err(|e| format!("put: {e}"))?;
    if storage.commit_transaction(tx).await.is_ok() {
        return Err("commit with stale snapshot version succeeded".to_string());
    }

    let events = storage
        .read_events("f1", 1)
        .await
        .map_err(|e| format!("read_events: {e}"))?;
    if events.len() != 1 {
        return Err(format!(
            "event from failed commit was appended (log has {})",
            events.len()
        ));
    }
    Ok(())
}

async fn multi_entity_commit_is_atomic<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut tx = storage
        .begin_transaction()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .append_event(&mut tx, make_event("a", 1, None, "exists"))
        .await
        .map_err(|e| format!("append a: {e}"))?;
    storage
        .put_snapshot(&mut tx, make_snapshot("a", "exists", 1), None)
        .await
        .map_err(|e| format!("put a: {e}"))?;
    // Second entity starts at version 2: a gap, so the whole commit must fail.
    storage
        .append_event(&mut tx, make_event("b", 2, None, "exists"))
        .await
        .map_err(|e| format!("append b: {e}"))?;
    if storage.commit_transaction(tx).await.is_ok() {
        return Err("commit with a version gap succeeded".to_string());
    }
    if storage
        .get_snapshot("a")
        .await
        .map_err(|e| format!("get_snapshot: {e}"))?
        .is_some()
    {
        return Err("partial commit: entity a was written".to_string());
    }
    Ok(())
}

use std::future::Future;

use super::{commit_step, expect_snapshot, TestResult};
use crate::LifecycleStorage;

pub(super) async fn run_log_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "log",
            "events_read_in_version_order",
            events_read_in_version_order(factory).await,
        ),
        TestResult::from_result(
            "log",
            "read_from_version_is_inclusive",
            read_from_version_is_inclusive(factory).await,
        ),
        TestResult::from_result(
            "log",
            "read_past_end_is_empty",
            read_past_end_is_empty(factory).await,
        ),
        TestResult::from_result(
            "log",
            "logs_are_per_entity",
            logs_are_per_entity(factory).await,
        ),
        TestResult::from_result(
            "log",
            "event_fields_round_trip",
            event_fields_round_trip(factory).await,
        ),
        TestResult::from_result(
            "log",
            "terminal_snapshot_is_kept",
            terminal_snapshot_is_kept(factory).await,
        ),
        TestResult::from_result(
            "log",
            "list_snapshots_filters",
            list_snapshots_filters(factory).await,
        ),
    ]
}

async fn seed_history<S: LifecycleStorage>(
    storage: &S,
    entity_id: &str,
    len: i64,
) -> Result<(), String> {
    commit_step(storage, entity_id, 1, None, "exists")
        .await
        .map_err(|e| format!("{entity_id} v1: {e}"))?;
    for v in 2..=len {
        commit_step(storage, entity_id, v, Some("exists"), "exists")
            .await
            .map_err(|e| format!("{entity_id} v{v}: {e}"))?;
    }
    Ok(())
}

async fn events_read_in_version_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_history(&storage, "f1", 4).await?;
    let versions: Vec<i64> = storage
        .read_events("f1", 1)
        .await
        .map_err(|e| format!("read_events: {e}"))?
        .iter()
        .map(|e| e.version)
        .collect();
    if versions != vec![1, 2, 3, 4] {
        return Err(format!("expected [1, 2, 3, 4], got {versions:?}"));
    }
    Ok(())
}

async fn read_from_version_is_inclusive<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_history(&storage, "f1", 4).await?;
    let versions: Vec<i64> = storage
        .read_events("f1", 3)
        .await
        .map_err(|e| format!("read_events: {e}"))?
        .iter()
        .map(|e| e.version)
        .collect();
    if versions != vec![3, 4] {
        return Err(format!("expected [3, 4], got {versions:?}"));
    }
    Ok(())
}

async fn read_past_end_is_empty<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_history(&storage, "f1", 2).await?;
    let events = storage
        .read_events("f1", 3)
        .await
        .map_err(|e| format!("read_events: {e}"))?;
    if !events.is_empty() {
        return Err(format!("expected no events, got {}", events.len()));
    }
    Ok(())
}

async fn logs_are_per_entity<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_history(&storage, "a", 3).await?;
    seed_history(&storage, "b", 1).await?;
    let a = storage
        .read_events("a", 1)
        .await
        .map_err(|e| format!("read a: {e}"))?;
    let b = storage
        .read_events("b", 1)
        .await
        .map_err(|e| format!("read b: {e}"))?;
    if a.len() != 3 || b.len() != 1 {
        return Err(format!("expected 3/1 events, got {}/{}", a.len(), b.len()));
    }
    if b.iter().any(|e| e.entity_id != "b") {
        return Err("entity b log contains foreign events".to_string());
    }
    Ok(())
}

async fn event_fields_round_trip<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_history(&storage, "f1", 2).await?;
    let events = storage
        .read_events("f1", 2)
        .await
        .map_err(|e| format!("read_events: {e}"))?;
    let expected = super::make_event("f1", 2, Some("exists"), "exists");
    match events.first() {
        Some(e) if *e == expected => Ok(()),
        Some(e) => Err(format!("stored event differs: {e:?}")),
        None => Err("event 2 missing".to_string()),
    }
}

async fn terminal_snapshot_is_kept<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    commit_step(&storage, "f1", 1, None, "exists")
        .await
        .map_err(|e| format!("v1: {e}"))?;
    commit_step(&storage, "f1", 2, Some("exists"), "deleted")
        .await
        .map_err(|e| format!("v2: {e}"))?;
    let snap = expect_snapshot(&storage, "f1").await?;
    if snap.state != "deleted" || snap.version != 2 {
        return Err(format!(
            "expected deleted@2 tombstone, got {}@{}",
            snap.state, snap.version
        ));
    }
    Ok(())
}

async fn list_snapshots_filters<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_history(&storage, "a", 1).await?;
    seed_history(&storage, "b", 1).await?;
    commit_step(&storage, "b", 2, Some("exists"), "deleted")
        .await
        .map_err(|e| format!("b v2: {e}"))?;

    let all = storage
        .list_snapshots(None, None)
        .await
        .map_err(|e| format!("list all: {e}"))?;
    let deleted = storage
        .list_snapshots(Some("file"), Some("deleted"))
        .await
        .map_err(|e| format!("list deleted: {e}"))?;
    let other_type = storage
        .list_snapshots(Some("invoice"), None)
        .await
        .map_err(|e| format!("list invoice: {e}"))?;

    if all.len() != 2 {
        return Err(format!("expected 2 snapshots, got {}", all.len()));
    }
    if deleted.len() != 1 || deleted[0].entity_id != "b" {
        return Err(format!("expected only b deleted, got {deleted:?}"));
    }
    if !other_type.is_empty() {
        return Err("entity type filter ignored".to_string());
    }
    Ok(())
}

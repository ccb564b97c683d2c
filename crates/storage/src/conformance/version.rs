use std::future::Future;

use super::{commit_step, expect_snapshot, make_event, make_snapshot, TestResult};
use crate::{LifecycleStorage, StorageError};

pub(super) async fn run_version_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "version",
            "versions_increment_sequentially",
            versions_increment_sequentially(factory).await,
        ),
        TestResult::from_result(
            "version",
            "stale_expected_version_conflicts",
            stale_expected_version_conflicts(factory).await,
        ),
        TestResult::from_result(
            "version",
            "conflict_reports_entity_and_expected_version",
            conflict_reports_entity_and_expected_version(factory).await,
        ),
        TestResult::from_result(
            "version",
            "conflict_does_not_change_state",
            conflict_does_not_change_state(factory).await,
        ),
        TestResult::from_result(
            "version",
            "skipped_event_version_is_a_gap",
            skipped_event_version_is_a_gap(factory).await,
        ),
        TestResult::from_result(
            "version",
            "repeated_event_version_is_a_gap",
            repeated_event_version_is_a_gap(factory).await,
        ),
        TestResult::from_result(
            "version",
            "snapshot_must_match_log_end",
            snapshot_must_match_log_end(factory).await,
        ),
        TestResult::from_result(
            "version",
            "lost_snapshot_can_be_restored",
            lost_snapshot_can_be_restored(factory).await,
        ),
    ]
}

async fn versions_increment_sequentially<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    commit_step(&storage, "f1", 1, None, "exists")
        .await
        .map_err(|e| format!("v1: {e}"))?;
    for v in 2..=5 {
        commit_step(&storage, "f1", v, Some("exists"), "exists")
            .await
            .map_err(|e| format!("v{v}: {e}"))?;
    }
    let snap = expect_snapshot(&storage, "f1").await?;
    if snap.version != 5 {
        return Err(format!("expected version 5, got {}", snap.version));
    }
    Ok(())
}

async fn stale_expected_version_conflicts<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    commit_step(&storage, "f1", 1, None, "exists")
        .await
        .map_err(|e| format!("v1: {e}"))?;
    commit_step(&storage, "f1", 2, Some("exists"), "exists")
        .await
        .map_err(|e| format!("v2: {e}"))?;

    // A writer that read version 1 tries to write version 2 again.
    match commit_step(&storage, "f1", 2, Some("exists"), "deleted").await {
        Err(StorageError::ConcurrentConflict { .. }) => Ok(()),
        Err(e) => Err(format!("expected ConcurrentConflict, got {e}")),
        Ok(()) => Err("stale write succeeded".to_string()),
    }
}

async fn conflict_reports_entity_and_expected_version<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    commit_step(&storage, "f1", 1, None, "exists")
        .await
        .map_err(|e| format!("v1: {e}"))?;
    commit_step(&storage, "f1", 2, Some("exists"), "exists")
        .await
        .map_err(|e| format!("v2: {e}"))?;

    match commit_step(&storage, "f1", 2, Some("exists"), "exists").await {
        Err(StorageError::ConcurrentConflict {
            entity_id,
            expected_version,
        }) => {
            if entity_id != "f1" {
                return Err(format!("expected entity_id f1, got {entity_id}"));
            }
            if expected_version != Some(1) {
                return Err(format!(
                    "expected expected_version Some(1), got {expected_version:?}"
                ));
            }
            Ok(())
        }
        Err(e) => Err(format!("expected ConcurrentConflict, got {e}")),
        Ok(()) => Err("stale write succeeded".to_string()),
    }
}

async fn conflict_does_not_change_state<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    commit_step(&storage, "f1", 1, None, "exists")
        .await
        .map_err(|e| format!("v1: {e}"))?;
    let _ = commit_step(&storage, "f1", 1, None, "deleted").await;

    let snap = expect_snapshot(&storage, "f1").await?;
    if snap.state != "exists" || snap.version != 1 {
        return Err(format!(
            "state changed after conflict: {}@{}",
            snap.state, snap.version
        ));
    }
    Ok(())
}

async fn skipped_event_version_is_a_gap<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    commit_step(&storage, "f1", 1, None, "exists")
        .await
        .map_err(|e| format!("v1: {e}"))?;

    let mut tx = storage
        .begin_transaction()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .append_event(&mut tx, make_event("f1", 3, Some("exists"), "exists"))
        .await
        .map_err(|e| format!("append: {e}"))?;
    match storage.commit_transaction(tx).await {
        Err(StorageError::VersionGap {
            last_version: 1,
            attempted_version: 3,
            ..
        }) => Ok(()),
        Err(e) => Err(format!("expected VersionGap(1, 3), got {e}")),
        Ok(()) => Err("gap was accepted".to_string()),
    }
}

async fn repeated_event_version_is_a_gap<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    commit_step(&storage, "f1", 1, None, "exists")
        .await
        .map_err(|e| format!("v1: {e}"))?;

    let mut tx = storage
        .begin_transaction()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .append_event(&mut tx, make_event("f1", 1, None, "exists"))
        .await
        .map_err(|e| format!("append: {e}"))?;
    match storage.commit_transaction(tx).await {
        Err(StorageError::VersionGap { .. }) => Ok(()),
        Err(e) => Err(format!("expected VersionGap, got {e}")),
        Ok(()) => Err("duplicate version was accepted".to_string()),
    }
}

async fn snapshot_must_match_log_end<S, F, Fut>(factory: &F) -> Result<(), String>
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
        .put_snapshot(&mut tx, make_snapshot("f1", "exists", 4), None)
        .await
        .map_err(|e| format!("put: {e}"))?;
    match storage.commit_transaction(tx).await {
        Err(StorageError::InconsistentTransaction { .. }) => Ok(()),
        Err(e) => Err(format!("expected InconsistentTransaction, got {e}")),
        Ok(()) => Err("snapshot ahead of the log was accepted".to_string()),
    }
}

/// A snapshot-only write with `expected_version = None` restores a snapshot
/// that was lost while the event log survived (cold rebuild).
async fn lost_snapshot_can_be_restored<S, F, Fut>(factory: &F) -> Result<(), String>
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
        .commit_transaction(tx)
        .await
        .map_err(|e| format!("commit event only: {e}"))?;

    let mut tx = storage
        .begin_transaction()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .put_snapshot(&mut tx, make_snapshot("f1", "exists", 1), None)
        .await
        .map_err(|e| format!("put: {e}"))?;
    storage
        .commit_transaction(tx)
        .await
        .map_err(|e| format!("commit snapshot: {e}"))?;

    let snap = expect_snapshot(&storage, "f1").await?;
    if snap.version != 1 {
        return Err(format!("expected restored version 1, got {}", snap.version));
    }
    Ok(())
}

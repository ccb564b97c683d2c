use std::future::Future;

use super::{commit_step, expect_snapshot, make_snapshot, TestResult};
use crate::{LifecycleStorage, StorageError};

pub(super) async fn run_init_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "init",
            "absent_entity_reads_none",
            absent_entity_reads_none(factory).await,
        ),
        TestResult::from_result(
            "init",
            "absent_entity_has_empty_log",
            absent_entity_has_empty_log(factory).await,
        ),
        TestResult::from_result(
            "init",
            "first_commit_creates_snapshot_at_version_1",
            first_commit_creates_snapshot_at_version_1(factory).await,
        ),
        TestResult::from_result(
            "init",
            "second_creation_conflicts",
            second_creation_conflicts(factory).await,
        ),
        TestResult::from_result(
            "init",
            "expecting_existing_snapshot_on_absent_entity_conflicts",
            expecting_existing_snapshot_on_absent_entity_conflicts(factory).await,
        ),
    ]
}

async fn absent_entity_reads_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    match storage.get_snapshot("missing").await {
        Ok(None) => Ok(()),
        Ok(Some(s)) => Err(format!("expected None, got snapshot at version {}", s.version)),
        Err(e) => Err(format!("get_snapshot: {e}")),
    }
}

async fn absent_entity_has_empty_log<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let events = storage
        .read_events("missing", 1)
        .await
        .map_err(|e| format!("read_events: {e}"))?;
    if !events.is_empty() {
        return Err(format!("expected empty log, got {} events", events.len()));
    }
    Ok(())
}

async fn first_commit_creates_snapshot_at_version_1<S, F, Fut>(factory: &F) -> Result<(), String>
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
    if snap.version != 1 || snap.state != "exists" {
        return Err(format!(
            "expected exists@1, got {}@{}",
            snap.state, snap.version
        ));
    }
    Ok(())
}

async fn second_creation_conflicts<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    commit_step(&storage, "f1", 1, None, "exists")
        .await
        .map_err(|e| format!("first commit: {e}"))?;
    match commit_step(&storage, "f1", 1, None, "exists").await {
        Err(StorageError::ConcurrentConflict {
            expected_version: None,
            ..
        }) => Ok(()),
        Err(e) => Err(format!("expected ConcurrentConflict, got {e}")),
        Ok(()) => Err("second creation unexpectedly succeeded".to_string()),
    }
}

async fn expecting_existing_snapshot_on_absent_entity_conflicts<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
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
        .put_snapshot(&mut tx, make_snapshot("f1", "exists", 3), Some(2))
        .await
        .map_err(|e| format!("put: {e}"))?;
    match storage.commit_transaction(tx).await {
        Err(StorageError::ConcurrentConflict { .. }) => Ok(()),
        Err(e) => Err(format!("expected ConcurrentConflict, got {e}")),
        Ok(()) => Err("commit unexpectedly succeeded".to_string()),
    }
}

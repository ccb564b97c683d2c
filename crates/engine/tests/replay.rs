//! Replay and rebuild integration tests.
//!
//! The snapshot the decider maintains incrementally must always equal a
//! from-scratch replay of the event log, and `rebuild` must restore, verify
//! or repair snapshots against that replay.

use std::sync::Arc;

use serde_json::json;
use waymark_engine::{
    file, replay, AllowAll, BuilderRegistry, Command, DecideError, Decider, RebuildPolicy,
};
use waymark_storage::{InMemoryStorage, JsonlStorage, LifecycleStorage};

fn file_decider<S: LifecycleStorage>(storage: Arc<S>) -> Decider<S> {
    let mut builders = BuilderRegistry::new();
    file::register_builders(&mut builders);
    Decider::new(
        Arc::new(file::machine().unwrap()),
        Arc::new(builders),
        Arc::new(AllowAll),
        storage,
    )
}

async fn run_history<S: LifecycleStorage>(decider: &Decider<S>, id: &str) {
    decider
        .decide(&Command::new("file", id, "initiate", "ops").with_payload(json!({
            "path": format!("reports/{id}.csv"),
            "hash": file::content_hash(b"v1"),
            "bucket": "primary",
        })))
        .await
        .unwrap();
    decider
        .decide(&Command::new("file", id, "update", "ops").with_payload(json!({
            "hash": file::content_hash(b"v2"),
            "size": 2,
        })))
        .await
        .unwrap();
    decider
        .decide(&Command::new("file", id, "log", "ops").with_payload(json!({"action": "shared"})))
        .await
        .unwrap();
    decider
        .decide(&Command::new("file", id, "delete", "ops"))
        .await
        .unwrap();
}

#[tokio::test]
async fn replay_equals_incremental_snapshot() {
    let storage = Arc::new(InMemoryStorage::new());
    let decider = file_decider(storage.clone());
    for id in ["a", "b", "c"] {
        run_history(&decider, id).await;
        let history = decider.history(id, 1).await.unwrap();
        let replayed = replay(&history).unwrap();
        assert_eq!(replayed, decider.snapshot(id).await.unwrap());
    }
}

#[tokio::test]
async fn history_from_version_is_inclusive() {
    let decider = file_decider(Arc::new(InMemoryStorage::new()));
    run_history(&decider, "f1").await;
    let tail: Vec<String> = decider
        .history("f1", 3)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(tail, vec!["logged", "deleted"]);
}

#[tokio::test]
async fn journal_survives_restart_and_replays() {
    let dir = tempfile::tempdir().unwrap();
    let before = {
        let decider = file_decider(Arc::new(JsonlStorage::open(dir.path()).unwrap()));
        run_history(&decider, "f1").await;
        decider.snapshot("f1").await.unwrap()
    };

    let reopened = file_decider(Arc::new(JsonlStorage::open(dir.path()).unwrap()));
    assert_eq!(reopened.snapshot("f1").await.unwrap(), before);
    let report = reopened.rebuild("f1", RebuildPolicy::Verify).await.unwrap();
    assert!(!report.written);
    assert_eq!(report.events, 4);
    assert_eq!(report.snapshot, before);
}

#[tokio::test]
async fn divergent_snapshot_is_reported_then_repaired() {
    let storage = Arc::new(InMemoryStorage::new());
    let decider = file_decider(storage.clone());
    decider
        .decide(&Command::new("file", "f1", "initiate", "ops").with_payload(json!({
            "path": "a.txt",
            "hash": file::content_hash(b"a"),
        })))
        .await
        .unwrap();

    // Corrupt the stored snapshot's attributes behind the decider's back.
    let mut corrupt = storage.get_snapshot("f1").await.unwrap().unwrap();
    corrupt.attributes.insert("hash".to_string(), json!("0".repeat(64)));
    let mut tx = storage.begin_transaction().await.unwrap();
    storage.put_snapshot(&mut tx, corrupt, Some(1)).await.unwrap();
    storage.commit_transaction(tx).await.unwrap();

    let err = decider.rebuild("f1", RebuildPolicy::Verify).await.unwrap_err();
    assert!(matches!(err, DecideError::ProjectionInvariantViolation { .. }));
    assert!(decider.is_halted("f1"));
    assert!(matches!(
        decider
            .decide(&Command::new("file", "f1", "log", "ops").with_payload(json!({"action": "x"})))
            .await,
        Err(DecideError::ProjectionInvariantViolation { .. })
    ));

    let report = decider.rebuild("f1", RebuildPolicy::Repair).await.unwrap();
    assert!(report.written && report.was_halted);
    assert_eq!(
        storage.get_snapshot("f1").await.unwrap().unwrap().attributes["hash"],
        json!(file::content_hash(b"a"))
    );
    assert!(!decider.is_halted("f1"));
    decider
        .decide(&Command::new("file", "f1", "log", "ops").with_payload(json!({"action": "x"})))
        .await
        .unwrap();
}

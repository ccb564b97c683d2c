//! File lifecycle integration tests.
//!
//! Drives the shipped file entity type end to end through the command
//! router and the in-memory backend:
//!
//! 1. Initiate creates version 1; a second initiate is an invalid transition
//! 2. Delete without capability is unauthorized and changes nothing
//! 3. Authorized delete leaves a tombstone; later commands are refused
//! 4. Versions are exactly 1, 2, 3, ... and snapshots carry the file attributes
//! 5. Accepted events reach the mirror sink; rejected commands do not

use std::sync::{Arc, Mutex};

use serde_json::json;
use waymark_engine::{
    file, BuilderRegistry, Command, CommandRouter, DecideError, Decider, Event, MirrorSink,
    StaticCapabilities,
};
use waymark_storage::{InMemoryStorage, LifecycleStorage};

// ──────────────────────────────────────────────
// Test fixtures
// ──────────────────────────────────────────────

#[derive(Default)]
struct RecordingMirror {
    seen: Mutex<Vec<String>>,
}

impl MirrorSink for RecordingMirror {
    fn dispatch(&self, event: &Event) {
        self.seen.lock().unwrap().push(event.natural_key());
    }
}

struct Fixture {
    router: CommandRouter<InMemoryStorage>,
    storage: Arc<InMemoryStorage>,
    mirror: Arc<RecordingMirror>,
}

fn fixture() -> Fixture {
    let caps = StaticCapabilities::new()
        .grant("alice", &["file:create", "file:log", "file:write"])
        .grant("ops", &["file:*"]);
    let mut builders = BuilderRegistry::new();
    file::register_builders(&mut builders);
    let storage = Arc::new(InMemoryStorage::new());
    let mirror = Arc::new(RecordingMirror::default());
    let decider = Decider::new(
        Arc::new(file::machine().unwrap()),
        Arc::new(builders),
        Arc::new(caps),
        storage.clone(),
    )
    .with_mirror(mirror.clone());
    Fixture {
        router: CommandRouter::for_machine(Arc::new(decider)),
        storage,
        mirror,
    }
}

fn initiate(id: &str, path: &str) -> Command {
    Command::new("file", id, "initiate", "alice").with_payload(json!({
        "path": path,
        "hash": file::content_hash(path.as_bytes()),
        "size": path.len(),
    }))
}

// ──────────────────────────────────────────────
// Scenarios
// ──────────────────────────────────────────────

#[tokio::test]
async fn initiate_then_second_initiate_is_invalid() {
    let fx = fixture();
    let event = fx.router.dispatch(&initiate("f1", "a.txt")).await.unwrap();
    assert_eq!(event.event_type, "initiated");
    assert_eq!(event.version, 1);

    let snap = fx.storage.get_snapshot("f1").await.unwrap().unwrap();
    assert_eq!((snap.state.as_str(), snap.version), ("exists", 1));

    let err = fx.router.dispatch(&initiate("f1", "b.txt")).await.unwrap_err();
    assert!(matches!(err, DecideError::InvalidTransition { .. }), "{err}");
    assert_eq!(fx.storage.get_snapshot("f1").await.unwrap().unwrap(), snap);
}

#[tokio::test]
async fn delete_without_capability_is_unauthorized() {
    let fx = fixture();
    fx.router.dispatch(&initiate("f1", "a.txt")).await.unwrap();
    let before = fx.storage.get_snapshot("f1").await.unwrap();

    let delete = Command::new("file", "f1", "delete", "alice");
    let err = fx.router.dispatch(&delete).await.unwrap_err();
    assert!(matches!(
        err,
        DecideError::Unauthorized { ref capability, .. } if capability == "file:delete"
    ));
    assert_eq!(fx.storage.get_snapshot("f1").await.unwrap(), before);
    assert_eq!(fx.storage.read_events("f1", 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn authorized_delete_leaves_tombstone() {
    let fx = fixture();
    fx.router.dispatch(&initiate("f1", "docs/a.txt")).await.unwrap();

    let delete = Command::new("file", "f1", "delete", "ops").with_payload(json!({"reason": "expired"}));
    let event = fx.router.dispatch(&delete).await.unwrap();
    assert_eq!(event.event_type, "deleted");
    assert_eq!(event.version, 2);
    assert_eq!(event.from_state.as_deref(), Some("exists"));
    assert_eq!(event.payload["path"], json!("docs/a.txt"));

    let snap = fx.storage.get_snapshot("f1").await.unwrap().unwrap();
    assert_eq!((snap.state.as_str(), snap.version), ("deleted", 2));
    assert_eq!(snap.attributes["path"], json!("docs/a.txt"));

    let log = Command::new("file", "f1", "log", "alice").with_payload(json!({"action": "viewed"}));
    assert!(matches!(
        fx.router.dispatch(&log).await,
        Err(DecideError::InvalidTransition { .. })
    ));
    assert!(matches!(
        fx.router.dispatch(&initiate("f1", "docs/a.txt")).await,
        Err(DecideError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn versions_are_contiguous_and_attributes_follow_updates() {
    let fx = fixture();
    fx.router.dispatch(&initiate("f1", "a.txt")).await.unwrap();
    for i in 0..3 {
        let log = Command::new("file", "f1", "log", "alice")
            .with_payload(json!({"action": "downloaded", "detail": i}));
        fx.router.dispatch(&log).await.unwrap();
    }
    let new_hash = file::content_hash(b"second revision");
    let update = Command::new("file", "f1", "update", "alice")
        .with_payload(json!({"hash": new_hash, "size": 15}));
    let event = fx.router.dispatch(&update).await.unwrap();
    assert_eq!(event.payload["previous_hash"], json!(file::content_hash(b"a.txt")));

    let versions: Vec<i64> = fx
        .storage
        .read_events("f1", 1)
        .await
        .unwrap()
        .iter()
        .map(|e| e.version)
        .collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);

    let snap = fx.storage.get_snapshot("f1").await.unwrap().unwrap();
    assert_eq!(snap.version, 5);
    assert_eq!(snap.last_event_type, "updated");
    assert_eq!(snap.attributes["hash"], json!(new_hash));
    assert_eq!(snap.attributes["size"], json!(15));
}

#[tokio::test]
async fn malformed_payload_is_invalid_command() {
    let fx = fixture();
    let cmd = Command::new("file", "f1", "initiate", "alice")
        .with_payload(json!({"path": "a.txt", "hash": "not-a-hash"}));
    let err = fx.router.dispatch(&cmd).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_command");
    assert!(!err.is_retryable());
    assert!(fx.storage.get_snapshot("f1").await.unwrap().is_none());
}

#[tokio::test]
async fn only_accepted_events_reach_the_mirror() {
    let fx = fixture();
    fx.router.dispatch(&initiate("f1", "a.txt")).await.unwrap();
    let _ = fx.router.dispatch(&initiate("f1", "a.txt")).await;
    let _ = fx
        .router
        .dispatch(&Command::new("file", "f1", "delete", "alice"))
        .await;
    fx.router
        .dispatch(&Command::new("file", "f1", "delete", "ops"))
        .await
        .unwrap();
    assert_eq!(
        *fx.mirror.seen.lock().unwrap(),
        vec!["f1@1".to_string(), "f1@2".to_string()]
    );
}

#[tokio::test]
async fn unknown_entity_type_and_command() {
    let fx = fixture();
    let err = fx
        .router
        .dispatch(&Command::new("invoice", "i1", "initiate", "ops"))
        .await
        .unwrap_err();
    assert!(matches!(err, DecideError::UnknownCommand { .. }));

    let err = fx
        .router
        .dispatch(&Command::new("file", "f1", "shred", "ops"))
        .await
        .unwrap_err();
    assert!(matches!(err, DecideError::UnknownCommand { .. }));
}

//! Conformance test suite for `LifecycleStorage` implementations.
//!
//! This module provides a backend-agnostic test suite that any
//! `LifecycleStorage` implementation can run to verify correctness. The suite
//! covers:
//!
//! - **First write**: snapshot creation, absent reads, duplicate creation
//! - **Atomic commit**: all-or-nothing semantics, abort and drop discard writes
//! - **Version validation / CAS**: stale snapshot writes and event gaps
//! - **Event log**: ordered range reads, per-entity independence, tombstones
//! - **Concurrency**: racing writers on one entity, exactly one wins
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use waymark_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn my_backend_conformance() {
//!     let report = run_conformance_suite(|| async { MyBackend::connect().await }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod commit;
mod concurrent;
mod init;
mod log;
mod version;

use std::fmt;
use std::future::Future;

use crate::record::{EventRecord, SnapshotRecord};
use crate::{LifecycleStorage, StorageError};

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "init", "commit", "version").
    pub category: String,
    /// Test name (e.g. "first_commit_creates_snapshot").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: LifecycleStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(init::run_init_tests(&factory).await);
    results.extend(commit::run_commit_tests(&factory).await);
    results.extend(version::run_version_tests(&factory).await);
    results.extend(log::run_log_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

pub(crate) fn make_event(
    entity_id: &str,
    version: i64,
    from_state: Option<&str>,
    to_state: &str,
) -> EventRecord {
    EventRecord {
        event_id: format!("evt-{entity_id}-{version}"),
        entity_id: entity_id.to_string(),
        entity_type: "file".to_string(),
        event_type: format!("moved_to_{to_state}"),
        version,
        from_state: from_state.map(|s| s.to_string()),
        to_state: to_state.to_string(),
        payload: serde_json::json!({"test": true}),
        attributes: serde_json::Map::new(),
        produced_at: "2025-01-01T00:00:00Z".to_string(),
        causation_id: format!("cmd-{entity_id}-{version}"),
        requester: "test-requester".to_string(),
    }
}

pub(crate) fn make_snapshot(entity_id: &str, state: &str, version: i64) -> SnapshotRecord {
    SnapshotRecord {
        entity_id: entity_id.to_string(),
        entity_type: "file".to_string(),
        state: state.to_string(),
        version,
        last_event_type: format!("moved_to_{state}"),
        last_event_at: "2025-01-01T00:00:00Z".to_string(),
        attributes: serde_json::Map::new(),
    }
}

/// Commit one event plus its snapshot in a single transaction, the way an
/// engine does for every accepted command.
pub(crate) async fn commit_step<S: LifecycleStorage>(
    storage: &S,
    entity_id: &str,
    version: i64,
    from_state: Option<&str>,
    to_state: &str,
) -> Result<(), StorageError> {
    let mut tx = storage.begin_transaction().await?;
    storage
        .append_event(&mut tx, make_event(entity_id, version, from_state, to_state))
        .await?;
    let expected = if version > 1 { Some(version - 1) } else { None };
    storage
        .put_snapshot(&mut tx, make_snapshot(entity_id, to_state, version), expected)
        .await?;
    storage.commit_transaction(tx).await
}

/// Read a snapshot that must exist.
async fn expect_snapshot<S: LifecycleStorage>(
    storage: &S,
    entity_id: &str,
) -> Result<SnapshotRecord, String> {
    storage
        .get_snapshot(entity_id)
        .await
        .map_err(|e| format!("get_snapshot: {e}"))?
        .ok_or_else(|| format!("snapshot for {entity_id} missing"))
}

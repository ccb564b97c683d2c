//! Durable storage backend on a JSON-lines journal.
//!
//! Every committed transaction becomes exactly one line of `journal.jsonl`:
//!
//! ```text
//! {"events":[...],"snapshots":[...]}
//! ```
//!
//! One line per commit keeps commits all-or-nothing on disk. A line only
//! counts once its newline is on disk: on open, trailing bytes after the last
//! newline (crash mid-write) are cut off with a warning, and every complete
//! line must parse and continue its entity's version sequence.
//!
//! The data directory is owned by one handle at a time through an exclusive
//! lock on `LOCK`, so the in-memory copy is the only writer of the journal.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::memory::{MemoryTransaction, StoreState};
use crate::record::{EventRecord, SnapshotRecord};
use crate::traits::LifecycleStorage;

const JOURNAL_FILE: &str = "journal.jsonl";
const LOCK_FILE: &str = "LOCK";

#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    #[serde(default)]
    events: Vec<EventRecord>,
    #[serde(default)]
    snapshots: Vec<SnapshotRecord>,
}

/// File-backed storage. State is served from memory; the journal is the
/// durable copy.
#[derive(Debug)]
pub struct JsonlStorage {
    journal: Arc<Journal>,
}

#[derive(Debug)]
struct Journal {
    path: PathBuf,
    /// Append handle, also serializes writers inside a blocking task.
    file: Mutex<File>,
    state: RwLock<StoreState>,
    /// Held for the lifetime of the handle; the lock is released on drop.
    _lock: File,
}

impl JsonlStorage {
    /// Open (or create) a journal under `dir`.
    ///
    /// Fails with [`StorageError::Locked`] while another handle has `dir` open.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            StorageError::Backend(format!("could not create '{}': {}", dir.display(), e))
        })?;
        let lock = acquire_lock(dir)?;

        let path = dir.join(JOURNAL_FILE);
        let loaded = load_journal(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error("open", &path, e))?;
        if let Some(valid_len) = loaded.torn_at {
            file.set_len(valid_len)
                .map_err(|e| io_error("truncate", &path, e))?;
        }

        Ok(Self {
            journal: Arc::new(Journal {
                path,
                file: Mutex::new(file),
                state: RwLock::new(loaded.state),
                _lock: lock,
            }),
        })
    }

    /// Path of the journal file.
    pub fn journal_path(&self) -> &Path {
        &self.journal.path
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> StorageError {
    StorageError::Backend(format!("could not {} '{}': {}", action, path.display(), e))
}

fn acquire_lock(dir: &Path) -> Result<File, StorageError> {
    let path = dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|e| io_error("open", &path, e))?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
            Err(StorageError::Locked(dir.display().to_string()))
        }
        Err(e) => Err(io_error("lock", &path, e)),
    }
}

struct LoadedJournal {
    state: StoreState,
    /// Length of the newline-terminated prefix when a torn tail follows it.
    torn_at: Option<u64>,
}

fn load_journal(path: &Path) -> Result<LoadedJournal, StorageError> {
    let mut state = StoreState::default();
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LoadedJournal {
                state,
                torn_at: None,
            })
        }
        Err(e) => return Err(io_error("read", path, e)),
    };

    let complete = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);
    let torn_at = if complete < bytes.len() {
        tracing::warn!(
            journal = %path.display(),
            bytes = bytes.len() - complete,
            "dropping torn journal tail"
        );
        Some(complete as u64)
    } else {
        None
    };

    for (idx, line) in bytes[..complete].split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let corrupt = |detail: String| {
            StorageError::Backend(format!(
                "corrupt journal '{}' line {}: {}",
                path.display(),
                idx + 1,
                detail
            ))
        };
        let entry: JournalEntry =
            serde_json::from_slice(line).map_err(|e| corrupt(e.to_string()))?;
        let snapshots = entry
            .snapshots
            .into_iter()
            .map(|s| {
                let current = state.snapshot(&s.entity_id).map(|c| c.version);
                (s, current)
            })
            .collect();
        let tx = MemoryTransaction {
            events: entry.events,
            snapshots,
        };
        state.apply(tx).map_err(|e| corrupt(e.to_string()))?;
    }

    Ok(LoadedJournal { state, torn_at })
}

impl Journal {
    /// Validate, write and apply one transaction. Runs as its own task so a
    /// caller that stops waiting cannot separate the disk write from the
    /// in-memory apply.
    async fn commit(self: Arc<Self>, tx: MemoryTransaction) -> Result<(), StorageError> {
        // Hold the write lock across the disk write so journal order matches
        // the order commits are validated in.
        let mut state = self.state.write().await;
        state.validate(&tx)?;

        let entry = JournalEntry {
            events: tx.events.clone(),
            snapshots: tx.snapshots.iter().map(|(s, _)| s.clone()).collect(),
        };
        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| StorageError::Backend(format!("serialization error: {}", e)))?;
        line.push(b'\n');

        let journal = Arc::clone(&self);
        tokio::task::spawn_blocking(move || journal.append(&line))
            .await
            .map_err(|e| StorageError::Backend(format!("task join error: {}", e)))??;

        state.apply_unchecked(tx);
        Ok(())
    }

    fn append(&self, line: &[u8]) -> Result<(), StorageError> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| StorageError::Backend("journal handle poisoned".to_string()))?;
        let end = file
            .metadata()
            .map_err(|e| io_error("stat", &self.path, e))?
            .len();
        if let Err(e) = file.write_all(line).and_then(|_| file.sync_data()) {
            // Cut any partial line so the next append starts on a fresh line.
            if let Err(trunc) = file.set_len(end) {
                tracing::error!(journal = %self.path.display(), error = %trunc, "could not truncate partial journal line");
            }
            return Err(io_error("write", &self.path, e));
        }
        Ok(())
    }
}

#[async_trait]
impl LifecycleStorage for JsonlStorage {
    type Transaction = MemoryTransaction;

    async fn begin_transaction(&self) -> Result<MemoryTransaction, StorageError> {
        Ok(MemoryTransaction::default())
    }

    async fn commit_transaction(&self, tx: MemoryTransaction) -> Result<(), StorageError> {
        if tx.is_empty() {
            return Ok(());
        }
        tokio::spawn(Arc::clone(&self.journal).commit(tx))
            .await
            .map_err(|e| StorageError::Backend(format!("commit task failed: {}", e)))?
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
        Ok(self.journal.state.read().await.snapshot(entity_id))
    }

    async fn read_events(
        &self,
        entity_id: &str,
        from_version: i64,
    ) -> Result<Vec<EventRecord>, StorageError> {
        Ok(self.journal.state.read().await.events_from(entity_id, from_version))
    }

    async fn list_snapshots(
        &self,
        entity_type: Option<&str>,
        state_filter: Option<&str>,
    ) -> Result<Vec<SnapshotRecord>, StorageError> {
        Ok(self.journal.state.read().await.list(entity_type, state_filter))
    }
}

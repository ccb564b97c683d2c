use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Where one event's mirror submission stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Submitted { transaction_id: String },
    Failed { reason: String },
    Skipped,
}

/// The adapter's advisory record of one mirrored event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub channel_id: String,
    pub contract_id: String,
    pub signer_identity: String,
    pub event_id: String,
    pub natural_key: String,
    #[serde(flatten)]
    pub status: SubmissionStatus,
    pub attempts: u32,
    pub updated_at: String,
}

/// Settled (`submitted` or `skipped`) records kept before the oldest are
/// evicted.
pub const DEFAULT_STATUS_RETENTION: usize = 4096;

impl SubmissionStatus {
    /// Nothing more will happen to the submission inside this process.
    fn is_settled(&self) -> bool {
        matches!(self, SubmissionStatus::Submitted { .. } | SubmissionStatus::Skipped)
    }
}

#[derive(Debug, Default)]
struct Records {
    by_key: BTreeMap<String, MirrorRecord>,
    /// Settled keys, oldest first.
    settled: VecDeque<String>,
    evicted_submitted: usize,
    evicted_skipped: usize,
}

/// In-process status table keyed by natural key.
///
/// Pending and failed records stay until they change. Settled records are
/// bounded: past the retention limit the oldest ones are dropped and only
/// counted, so a long-running server does not grow without bound. A dropped
/// `submitted` record no longer short-circuits a resubmission; the ledger
/// answers a repeated natural key with the original transaction.
#[derive(Debug)]
pub struct StatusTable {
    records: Mutex<Records>,
    retention: usize,
}

impl Default for StatusTable {
    fn default() -> Self {
        Self::with_retention(DEFAULT_STATUS_RETENTION)
    }
}

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            records: Mutex::new(Records::default()),
            retention,
        }
    }

    pub fn get(&self, natural_key: &str) -> Option<MirrorRecord> {
        self.lock().by_key.get(natural_key).cloned()
    }

    pub fn put(&self, record: MirrorRecord) {
        let mut records = self.lock();
        let key = record.natural_key.clone();
        let settles = record.status.is_settled();
        let was_settled = records
            .by_key
            .insert(key.clone(), record)
            .is_some_and(|old| old.status.is_settled());
        if settles && !was_settled {
            self.settle(&mut records, key);
        }
    }

    /// Update status and attempt count of an existing record.
    pub fn set_status(&self, natural_key: &str, status: SubmissionStatus, attempts: u32) {
        let mut records = self.lock();
        let Some(record) = records.by_key.get_mut(natural_key) else {
            return;
        };
        let settles = status.is_settled() && !record.status.is_settled();
        record.status = status;
        record.attempts = attempts;
        record.updated_at = now_rfc3339();
        if settles {
            self.settle(&mut records, natural_key.to_string());
        }
    }

    fn settle(&self, records: &mut Records, key: String) {
        records.settled.push_back(key);
        while records.settled.len() > self.retention {
            let Some(oldest) = records.settled.pop_front() else {
                break;
            };
            // The record may have moved on (e.g. re-tracked) since it settled.
            let status = records.by_key.get(&oldest).map(|r| r.status.clone());
            match status {
                Some(SubmissionStatus::Submitted { .. }) => records.evicted_submitted += 1,
                Some(SubmissionStatus::Skipped) => records.evicted_skipped += 1,
                _ => continue,
            }
            records.by_key.remove(&oldest);
        }
    }

    pub fn is_submitted(&self, natural_key: &str) -> bool {
        matches!(
            self.lock().by_key.get(natural_key).map(|r| &r.status),
            Some(SubmissionStatus::Submitted { .. })
        )
    }

    pub fn failed(&self) -> Vec<MirrorRecord> {
        self.lock()
            .by_key
            .values()
            .filter(|r| matches!(r.status, SubmissionStatus::Failed { .. }))
            .cloned()
            .collect()
    }

    /// Records still held in the table.
    pub fn all(&self) -> Vec<MirrorRecord> {
        self.lock().by_key.values().cloned().collect()
    }

    /// Counts of (pending, submitted, failed, skipped), evicted records
    /// included.
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let records = self.lock();
        let (p, s, f, k) = records
            .by_key
            .values()
            .fold((0, 0, 0, 0), |(p, s, f, k), r| match r.status {
                SubmissionStatus::Pending => (p + 1, s, f, k),
                SubmissionStatus::Submitted { .. } => (p, s + 1, f, k),
                SubmissionStatus::Failed { .. } => (p, s, f + 1, k),
                SubmissionStatus::Skipped => (p, s, f, k + 1),
            });
        (p, s + records.evicted_submitted, f, k + records.evicted_skipped)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

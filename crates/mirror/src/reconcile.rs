//! Dead-letter file and out-of-band reconciliation.
//!
//! Submissions that exhaust their retries are appended, one JSON object per
//! line, to the configured dead-letter file. `reconcile` resubmits every
//! entry once and rewrites the file with whatever still fails.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::client::LedgerClient;
use crate::envelope::SignedTransaction;
use crate::error::MirrorError;
use crate::status::now_rfc3339;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub transaction: SignedTransaction,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// `(natural_key, transaction_id)` of every entry now on the ledger.
    pub resubmitted: Vec<(String, String)>,
    /// Natural keys that still fail.
    pub remaining: Vec<String>,
}

pub fn append_dead_letter(path: &Path, entry: &DeadLetter) -> Result<(), MirrorError> {
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    file.sync_data()?;
    Ok(())
}

/// Every entry of a dead-letter file; a missing file has none.
pub fn read_dead_letters(path: &Path) -> Result<Vec<DeadLetter>, MirrorError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(MirrorError::from))
        .collect()
}

/// Resubmit every dead-lettered envelope once through `client`.
pub async fn reconcile(
    path: &Path,
    client: &dyn LedgerClient,
) -> Result<ReconcileReport, MirrorError> {
    let entries = read_dead_letters(path)?;
    let mut report = ReconcileReport::default();
    let mut still_failing = Vec::new();

    for mut entry in entries {
        let tx = &entry.transaction;
        match client
            .submit_transaction(&tx.channel_id, &tx.contract_id, tx)
            .await
        {
            Ok(transaction_id) => {
                tracing::info!(natural_key = %tx.natural_key, %transaction_id, "reconciled mirror submission");
                report
                    .resubmitted
                    .push((tx.natural_key.clone(), transaction_id));
            }
            Err(e) => {
                tracing::warn!(natural_key = %tx.natural_key, error = %e, "mirror submission still failing");
                report.remaining.push(tx.natural_key.clone());
                entry.reason = e.to_string();
                entry.attempts += 1;
                entry.failed_at = now_rfc3339();
                still_failing.push(entry);
            }
        }
    }

    rewrite(path, &still_failing)?;
    Ok(report)
}

fn rewrite(path: &Path, entries: &[DeadLetter]) -> Result<(), MirrorError> {
    let mut body = String::new();
    for entry in entries {
        body.push_str(&serde_json::to_string(entry)?);
        body.push('\n');
    }
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryLedger;
    use crate::envelope::sign_event;
    use crate::identity::SignerIdentity;
    use serde_json::json;
    use waymark_engine::Event;

    fn dead(version: i64) -> DeadLetter {
        let event = Event {
            event_id: format!("e-{version}"),
            entity_id: "f1".to_string(),
            entity_type: "file".to_string(),
            event_type: "logged".to_string(),
            version,
            from_state: Some("exists".to_string()),
            to_state: "exists".to_string(),
            payload: json!({"action": "viewed"}),
            attributes: serde_json::Map::new(),
            produced_at: "2026-03-01T12:00:00Z".to_string(),
            causation_id: "c".to_string(),
            requester: "alice".to_string(),
        };
        DeadLetter {
            transaction: sign_event(&event, &SignerIdentity::from_seed("op", [2u8; 32]), "audit", "files")
                .unwrap(),
            reason: "ledger unreachable".to_string(),
            attempts: 5,
            failed_at: "2026-03-01T12:00:10Z".to_string(),
        }
    }

    #[test]
    fn missing_file_has_no_entries() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_dead_letters(&dir.path().join("none.jsonl")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_resubmits_and_keeps_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.jsonl");
        append_dead_letter(&path, &dead(1)).unwrap();
        append_dead_letter(&path, &dead(2)).unwrap();
        assert_eq!(read_dead_letters(&path).unwrap().len(), 2);

        let ledger = InMemoryLedger::new();
        ledger.fail_next(1);
        let report = reconcile(&path, &ledger).await.unwrap();
        assert_eq!(report.remaining, vec!["f1@1".to_string()]);
        assert_eq!(report.resubmitted.len(), 1);
        assert_eq!(report.resubmitted[0].0, "f1@2");

        let left = read_dead_letters(&path).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].attempts, 6);

        let report = reconcile(&path, &ledger).await.unwrap();
        assert!(report.remaining.is_empty());
        assert!(read_dead_letters(&path).unwrap().is_empty());
        assert_eq!(ledger.transactions().len(), 2);
    }
}

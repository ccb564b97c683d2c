//! The mirror adapter and its background worker.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use waymark_engine::{Event, MirrorSink};

use crate::client::LedgerClient;
use crate::envelope::{sign_event, SignedTransaction};
use crate::error::MirrorError;
use crate::identity::SignerIdentity;
use crate::reconcile::{append_dead_letter, DeadLetter};
use crate::retry::RetryPolicy;
use crate::scope::MirrorScope;
use crate::status::{
    now_rfc3339, MirrorRecord, StatusTable, SubmissionStatus, DEFAULT_STATUS_RETENTION,
};

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub channel_id: String,
    pub contract_id: String,
    pub scope: MirrorScope,
    pub retry: RetryPolicy,
    pub queue_capacity: usize,
    /// Settled status records kept in memory.
    pub status_retention: usize,
    /// JSON-lines file receiving submissions that exhausted their retries.
    pub dead_letter: Option<PathBuf>,
}

impl MirrorConfig {
    pub fn new(channel_id: &str, contract_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            contract_id: contract_id.to_string(),
            scope: MirrorScope::everything(),
            retry: RetryPolicy::default(),
            queue_capacity: 1024,
            status_retention: DEFAULT_STATUS_RETENTION,
            dead_letter: None,
        }
    }
}

struct Inner {
    client: Arc<dyn LedgerClient>,
    identity: SignerIdentity,
    config: MirrorConfig,
    status: StatusTable,
}

/// Best-effort ledger mirror.
///
/// As a [`MirrorSink`] it queues accepted events on a bounded channel without
/// ever blocking; a worker task signs and submits them in order, retrying
/// with backoff. Nothing the worker does reaches the engine.
pub struct LedgerMirror {
    inner: Arc<Inner>,
    queue: mpsc::Sender<Event>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LedgerMirror {
    /// Start the adapter and its worker on the current tokio runtime.
    pub fn start(
        client: Arc<dyn LedgerClient>,
        identity: SignerIdentity,
        config: MirrorConfig,
    ) -> Self {
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, stop) = watch::channel(false);
        let status = StatusTable::with_retention(config.status_retention);
        let inner = Arc::new(Inner {
            client,
            identity,
            config,
            status,
        });
        let worker = tokio::spawn(run_worker(inner.clone(), rx, stop));
        Self {
            inner,
            queue,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Sign `event` and submit it with retries, bypassing the queue.
    /// Returns the ledger transaction id.
    pub async fn submit(&self, event: &Event) -> Result<String, MirrorError> {
        self.inner.track(event);
        self.inner.submit(event).await
    }

    pub fn status(&self) -> &StatusTable {
        &self.inner.status
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.inner.config
    }

    /// Stop the worker. An in-flight submission is abandoned at once, marked
    /// failed and dead-lettered; queued events stay `pending`. Committed
    /// engine state is untouched.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "mirror worker ended abnormally");
            }
        }
    }
}

impl MirrorSink for LedgerMirror {
    fn dispatch(&self, event: &Event) {
        if !self.inner.config.scope.includes(event) {
            self.inner.track(event);
            self.inner
                .status
                .set_status(&event.natural_key(), SubmissionStatus::Skipped, 0);
            return;
        }
        self.inner.track(event);
        if let Err(e) = self.queue.try_send(event.clone()) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "mirror queue full",
                mpsc::error::TrySendError::Closed(_) => "mirror worker stopped",
            };
            self.inner.give_up(event, None, reason.to_string(), 0);
        }
    }
}

async fn run_worker(inner: Arc<Inner>, mut rx: mpsc::Receiver<Event>, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            next = rx.recv() => match next {
                Some(event) => {
                    tokio::select! {
                        // Errors are recorded in the status table by `submit`.
                        _ = inner.submit(&event) => {}
                        _ = stop.changed() => {
                            let attempts = inner
                                .status
                                .get(&event.natural_key())
                                .map_or(0, |r| r.attempts);
                            inner.give_up(&event, None, "mirror stopped mid-submission".to_string(), attempts);
                            break;
                        }
                    }
                }
                None => break,
            },
        }
    }
    tracing::debug!("mirror worker stopped");
}

impl Inner {
    /// Insert a pending record unless the event is already known.
    fn track(&self, event: &Event) {
        let key = event.natural_key();
        if self.status.get(&key).is_some() {
            return;
        }
        self.status.put(MirrorRecord {
            channel_id: self.config.channel_id.clone(),
            contract_id: self.config.contract_id.clone(),
            signer_identity: self.identity.name().to_string(),
            event_id: event.event_id.clone(),
            natural_key: key,
            status: SubmissionStatus::Pending,
            attempts: 0,
            updated_at: now_rfc3339(),
        });
    }

    async fn submit(&self, event: &Event) -> Result<String, MirrorError> {
        let key = event.natural_key();
        if let Some(MirrorRecord {
            status: SubmissionStatus::Submitted { transaction_id },
            ..
        }) = self.status.get(&key)
        {
            return Ok(transaction_id);
        }

        let transaction = match sign_event(
            event,
            &self.identity,
            &self.config.channel_id,
            &self.config.contract_id,
        ) {
            Ok(tx) => tx,
            Err(e) => {
                self.give_up(event, None, e.to_string(), 0);
                return Err(e);
            }
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .client
                .submit_transaction(&self.config.channel_id, &self.config.contract_id, &transaction)
                .await;
            match result {
                Ok(transaction_id) => {
                    tracing::debug!(natural_key = %key, %transaction_id, attempt, "event mirrored");
                    self.status.set_status(
                        &key,
                        SubmissionStatus::Submitted {
                            transaction_id: transaction_id.clone(),
                        },
                        attempt,
                    );
                    return Ok(transaction_id);
                }
                Err(e) => {
                    let delay = if e.is_transient() {
                        self.config.retry.delay_after(attempt)
                    } else {
                        None
                    };
                    match delay {
                        Some(delay) => {
                            tracing::warn!(
                                natural_key = %key,
                                attempt,
                                error = %e,
                                retry_in_ms = delay.as_millis() as u64,
                                "mirror submission failed; retrying"
                            );
                            self.status.set_status(&key, SubmissionStatus::Pending, attempt);
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            self.give_up(event, Some(transaction), e.to_string(), attempt);
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    /// Mark the event failed, log it and append it to the dead-letter file.
    fn give_up(
        &self,
        event: &Event,
        transaction: Option<SignedTransaction>,
        reason: String,
        attempts: u32,
    ) {
        let key = event.natural_key();
        tracing::error!(natural_key = %key, attempts, %reason, "mirror submission failed");
        self.status.set_status(
            &key,
            SubmissionStatus::Failed {
                reason: reason.clone(),
            },
            attempts,
        );

        let Some(path) = &self.config.dead_letter else {
            return;
        };
        let transaction = match transaction {
            Some(tx) => tx,
            None => match sign_event(
                event,
                &self.identity,
                &self.config.channel_id,
                &self.config.contract_id,
            ) {
                Ok(tx) => tx,
                Err(e) => {
                    tracing::error!(natural_key = %key, error = %e, "cannot dead-letter unsignable event");
                    return;
                }
            },
        };
        let entry = DeadLetter {
            transaction,
            reason,
            attempts,
            failed_at: now_rfc3339(),
        };
        if let Err(e) = append_dead_letter(path, &entry) {
            tracing::error!(natural_key = %key, path = %path.display(), error = %e, "cannot write dead letter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryLedger;
    use crate::reconcile::read_dead_letters;
    use serde_json::json;
    use std::time::Duration;

    fn event(version: i64, directory: &str) -> Event {
        Event {
            event_id: format!("e-{version}"),
            entity_id: "f1".to_string(),
            entity_type: "file".to_string(),
            event_type: "logged".to_string(),
            version,
            from_state: Some("exists".to_string()),
            to_state: "exists".to_string(),
            payload: json!({"directory": directory}),
            attributes: serde_json::Map::new(),
            produced_at: "2026-03-01T12:00:00Z".to_string(),
            causation_id: "c".to_string(),
            requester: "alice".to_string(),
        }
    }

    fn fast_config() -> MirrorConfig {
        let mut config = MirrorConfig::new("audit", "files");
        config.retry = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };
        config
    }

    #[tokio::test]
    async fn submit_retries_transient_failures() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.fail_next(2);
        let mirror = LedgerMirror::start(ledger.clone(), SignerIdentity::generate("op"), fast_config());

        let tx_id = mirror.submit(&event(1, "")).await.unwrap();
        let record = mirror.status().get("f1@1").unwrap();
        assert_eq!(record.attempts, 3);
        assert_eq!(record.status, SubmissionStatus::Submitted { transaction_id: tx_id });
        mirror.shutdown().await;
    }

    #[tokio::test]
    async fn submitted_events_are_not_resubmitted() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mirror = LedgerMirror::start(ledger.clone(), SignerIdentity::generate("op"), fast_config());
        let first = mirror.submit(&event(1, "")).await.unwrap();
        ledger.set_partitioned(true);
        let second = mirror.submit(&event(1, "")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(ledger.transactions().len(), 1);
        mirror.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_retries_are_dead_lettered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.jsonl");
        let mut config = fast_config();
        config.dead_letter = Some(path.clone());

        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_partitioned(true);
        let mirror = LedgerMirror::start(ledger.clone(), SignerIdentity::generate("op"), config);
        assert!(mirror.submit(&event(1, "")).await.is_err());

        let record = mirror.status().get("f1@1").unwrap();
        assert_eq!(record.attempts, 3);
        assert!(matches!(record.status, SubmissionStatus::Failed { .. }));
        let dead = read_dead_letters(&path).unwrap();
        assert_eq!(dead.len(), 1);
        dead[0].transaction.verify().unwrap();
        mirror.shutdown().await;
    }

    #[tokio::test]
    async fn out_of_scope_events_are_skipped() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut config = fast_config();
        config.scope.directories = vec!["contracts".to_string()];
        let mirror = LedgerMirror::start(ledger.clone(), SignerIdentity::generate("op"), config);

        mirror.dispatch(&event(1, "scratch"));
        assert_eq!(
            mirror.status().get("f1@1").unwrap().status,
            SubmissionStatus::Skipped
        );
        mirror.shutdown().await;
        assert!(ledger.transactions().is_empty());
    }

    #[tokio::test]
    async fn dispatch_after_shutdown_marks_failed() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mirror = LedgerMirror::start(ledger, SignerIdentity::generate("op"), fast_config());
        mirror.shutdown().await;
        mirror.dispatch(&event(1, ""));
        assert!(matches!(
            mirror.status().get("f1@1").unwrap().status,
            SubmissionStatus::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn shutdown_interrupts_retry_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.jsonl");
        let mut config = MirrorConfig::new("audit", "files");
        config.retry = RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        };
        config.dead_letter = Some(path.clone());

        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_partitioned(true);
        let mirror = LedgerMirror::start(ledger, SignerIdentity::generate("op"), config);
        mirror.dispatch(&event(1, ""));
        for _ in 0..100 {
            if mirror.status().get("f1@1").is_some_and(|r| r.attempts >= 1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let started = std::time::Instant::now();
        mirror.shutdown().await;
        assert!(started.elapsed() < Duration::from_millis(500));

        let record = mirror.status().get("f1@1").unwrap();
        assert!(matches!(record.status, SubmissionStatus::Failed { .. }));
        assert_eq!(record.attempts, 1);
        assert_eq!(read_dead_letters(&path).unwrap().len(), 1);
    }
}

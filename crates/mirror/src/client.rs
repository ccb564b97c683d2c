//! Ledger clients.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::envelope::SignedTransaction;
use crate::error::LedgerError;

/// Submits signed transactions to an external ledger.
///
/// A duplicate submission (same natural key) must be reported as success
/// with the transaction id of the original.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn submit_transaction(
        &self,
        channel_id: &str,
        contract_id: &str,
        transaction: &SignedTransaction,
    ) -> Result<String, LedgerError>;
}

/// Client for a ledger REST gateway.
///
/// POSTs the envelope as JSON to
/// `{gateway}/channels/{channel}/contracts/{contract}/transactions` and reads
/// `{"transaction_id": "..."}` back. HTTP 409 means the natural key is
/// already on the ledger.
///
/// Uses `ureq` (sync) wrapped in `tokio::task::spawn_blocking` to avoid
/// blocking the async runtime. Every request is bounded by
/// [`DEFAULT_REQUEST_TIMEOUT`] unless overridden with
/// [`HttpLedgerClient::with_timeout`].
#[derive(Debug, Clone)]
pub struct HttpLedgerClient {
    gateway_url: String,
    auth_token: Option<String>,
    agent: ureq::Agent,
}

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn agent_with_timeout(timeout: Duration) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build();
    ureq::Agent::new_with_config(config)
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    transaction_id: String,
}

impl HttpLedgerClient {
    /// `auth_token` falls back to the `WAYMARK_LEDGER_TOKEN` env var.
    pub fn new(gateway_url: &str, auth_token: Option<String>) -> Self {
        HttpLedgerClient {
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.or_else(|| std::env::var("WAYMARK_LEDGER_TOKEN").ok()),
            agent: agent_with_timeout(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Bound each request (connect, send and read) by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = agent_with_timeout(timeout);
        self
    }

    pub fn transactions_url(&self, channel_id: &str, contract_id: &str) -> String {
        format!(
            "{}/channels/{}/contracts/{}/transactions",
            self.gateway_url, channel_id, contract_id
        )
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn submit_transaction(
        &self,
        channel_id: &str,
        contract_id: &str,
        transaction: &SignedTransaction,
    ) -> Result<String, LedgerError> {
        let url = self.transactions_url(channel_id, contract_id);
        let auth_token = self.auth_token.clone();
        let body = transaction.clone();
        let agent = self.agent.clone();

        tokio::task::spawn_blocking(move || {
            let mut request = agent.post(&url);
            if let Some(ref token) = auth_token {
                request = request.header("Authorization", &format!("Bearer {}", token));
            }

            match request.send_json(&body) {
                Ok(response) => {
                    let parsed: SubmitResponse = response
                        .into_body()
                        .read_json()
                        .map_err(|e| LedgerError::MalformedResponse(e.to_string()))?;
                    Ok(parsed.transaction_id)
                }
                Err(ureq::Error::StatusCode(409)) => Ok(format!("existing:{}", body.natural_key)),
                Err(ureq::Error::StatusCode(status)) => Err(LedgerError::Rejected {
                    status,
                    message: format!("gateway returned HTTP {status}"),
                }),
                Err(e) => Err(LedgerError::Unreachable(e.to_string())),
            }
        })
        .await
        .map_err(|e| LedgerError::Unreachable(format!("task join error: {}", e)))?
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    by_key: HashMap<String, String>,
    transactions: Vec<SignedTransaction>,
    partitioned: bool,
    fail_next: usize,
}

/// Ledger kept in process memory. Deduplicates by natural key, verifies
/// signatures, and can simulate a network partition or transient failures.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// While partitioned every submission fails as unreachable.
    pub fn set_partitioned(&self, partitioned: bool) {
        self.lock().partitioned = partitioned;
    }

    /// Fail the next `count` submissions as unreachable.
    pub fn fail_next(&self, count: usize) {
        self.lock().fail_next = count;
    }

    /// Accepted transactions in submission order.
    pub fn transactions(&self) -> Vec<SignedTransaction> {
        self.lock().transactions.clone()
    }

    pub fn contains(&self, natural_key: &str) -> bool {
        self.lock().by_key.contains_key(natural_key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn submit_transaction(
        &self,
        channel_id: &str,
        contract_id: &str,
        transaction: &SignedTransaction,
    ) -> Result<String, LedgerError> {
        let mut state = self.lock();
        if state.partitioned {
            return Err(LedgerError::Unreachable("simulated partition".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(LedgerError::Unreachable("simulated failure".to_string()));
        }
        if transaction.channel_id != channel_id || transaction.contract_id != contract_id {
            return Err(LedgerError::Rejected {
                status: 400,
                message: "envelope addressed to another channel or contract".to_string(),
            });
        }
        if let Err(e) = transaction.verify() {
            return Err(LedgerError::Rejected {
                status: 400,
                message: e.to_string(),
            });
        }
        if let Some(existing) = state.by_key.get(&transaction.natural_key) {
            return Ok(existing.clone());
        }
        let id = format!("tx-{}", state.transactions.len() + 1);
        state
            .by_key
            .insert(transaction.natural_key.clone(), id.clone());
        state.transactions.push(transaction.clone());
        Ok(id)
    }
}

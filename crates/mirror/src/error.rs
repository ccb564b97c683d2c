/// Failure reported by a ledger client for one submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The ledger could not be reached (network error, partition, timeout).
    #[error("ledger unreachable: {0}")]
    Unreachable(String),

    /// The ledger answered and refused the transaction.
    #[error("ledger rejected transaction ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The ledger accepted the request but its answer could not be read.
    #[error("malformed ledger response: {0}")]
    MalformedResponse(String),
}

impl LedgerError {
    /// Whether another attempt could succeed. A rejected transaction will be
    /// rejected again unless the ledger failed on its side (5xx).
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Unreachable(_) | LedgerError::MalformedResponse(_) => true,
            LedgerError::Rejected { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

/// Errors raised by the mirror adapter itself.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("signing key error: {0}")]
    Key(String),

    #[error("signature verification failed: {0}")]
    Signature(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

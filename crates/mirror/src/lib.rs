//! Ledger mirror adapter.
//!
//! Every event the engine accepts can be mirrored, best effort, to an
//! external tamper-evident ledger: the event is serialized canonically,
//! signed with an operator's Ed25519 identity and submitted as a
//! transaction to a configured channel and contract. Mirroring runs on its
//! own task; a ledger that is slow, down or rejecting never affects the
//! snapshot store or the caller of a command.

mod adapter;
mod client;
mod envelope;
mod error;
mod identity;
mod reconcile;
mod retry;
mod scope;
mod status;

pub use adapter::{LedgerMirror, MirrorConfig};
pub use client::{HttpLedgerClient, InMemoryLedger, LedgerClient};
pub use envelope::{canonical_json, sign_event, SignedTransaction};
pub use error::{LedgerError, MirrorError};
pub use identity::{key_fingerprint, read_public_key, read_secret_key, SignerIdentity};
pub use reconcile::{append_dead_letter, read_dead_letters, reconcile, DeadLetter, ReconcileReport};
pub use retry::RetryPolicy;
pub use scope::MirrorScope;
pub use status::{MirrorRecord, StatusTable, SubmissionStatus, DEFAULT_STATUS_RETENTION};

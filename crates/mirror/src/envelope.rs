//! Signed transaction envelopes.
//!
//! The envelope carries the event in its canonical JSON form (object keys
//! sorted, no insignificant whitespace), the hex SHA-256 digest of those
//! bytes, and an Ed25519 signature over the digest. The natural key
//! (`entity_id@version`) travels alongside so ledgers can deduplicate
//! resubmissions.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use waymark_engine::Event;

use crate::error::MirrorError;
use crate::identity::SignerIdentity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub channel_id: String,
    pub contract_id: String,
    pub natural_key: String,
    pub event_id: String,
    pub signer: String,
    /// Base64 verifying key of the signer.
    pub public_key: String,
    pub payload: Value,
    /// Hex SHA-256 of `canonical_json(payload)`.
    pub digest: String,
    /// Base64 Ed25519 signature over the raw digest bytes.
    pub signature: String,
}

impl SignedTransaction {
    /// Recompute the digest and check the signature against the embedded key.
    pub fn verify(&self) -> Result<(), MirrorError> {
        let digest = Sha256::digest(canonical_json(&self.payload)?.as_bytes());
        if hex(&digest) != self.digest {
            return Err(MirrorError::Signature("payload digest mismatch".to_string()));
        }

        let key_bytes: [u8; 32] = decode(&self.public_key, "public key")?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| MirrorError::Signature(format!("invalid public key: {e}")))?;
        let sig_bytes: [u8; 64] = decode(&self.signature, "signature")?;
        key.verify(&digest, &Signature::from_bytes(&sig_bytes))
            .map_err(|e| MirrorError::Signature(e.to_string()))
    }
}

/// Serialize, digest and sign `event` for submission to `channel_id` /
/// `contract_id`.
pub fn sign_event(
    event: &Event,
    identity: &SignerIdentity,
    channel_id: &str,
    contract_id: &str,
) -> Result<SignedTransaction, MirrorError> {
    let payload = serde_json::to_value(event)?;
    let digest = Sha256::digest(canonical_json(&payload)?.as_bytes());
    let signature = identity.sign(&digest);

    Ok(SignedTransaction {
        channel_id: channel_id.to_string(),
        contract_id: contract_id.to_string(),
        natural_key: event.natural_key(),
        event_id: event.event_id.clone(),
        signer: identity.name().to_string(),
        public_key: identity.public_key_base64(),
        payload,
        digest: hex(&digest),
        signature: BASE64.encode(signature.to_bytes()),
    })
}

/// Compact JSON with object keys in lexicographic order at every depth.
///
/// `serde_json::Map` is backed by `BTreeMap` (the default when the
/// `preserve_order` feature is not enabled), so plain serialization already
/// emits sorted keys.
pub fn canonical_json(value: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode<const N: usize>(encoded: &str, what: &str) -> Result<[u8; N], MirrorError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| MirrorError::Signature(format!("error decoding {what}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| MirrorError::Signature(format!("invalid {what} length")))
}

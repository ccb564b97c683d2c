use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::error::MirrorError;

/// An operator identity that signs mirrored transactions.
///
/// Key files hold base64-encoded 32-byte values: `<prefix>.secret` the
/// Ed25519 seed and `<prefix>.pub` the verifying key.
pub struct SignerIdentity {
    name: String,
    signing_key: SigningKey,
}

impl SignerIdentity {
    /// A fresh identity from the OS random number generator.
    pub fn generate(name: &str) -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            name: name.to_string(),
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    pub fn from_seed(name: &str, seed: [u8; 32]) -> Self {
        Self {
            name: name.to_string(),
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Load an identity from a `.secret` seed file.
    pub fn load(name: &str, secret_path: &Path) -> Result<Self, MirrorError> {
        Ok(Self {
            name: name.to_string(),
            signing_key: read_secret_key(secret_path)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Write `<prefix>.secret` and `<prefix>.pub`. The secret file is made
    /// readable by the owner only on Unix.
    pub fn write_keypair(&self, prefix: &Path) -> Result<(PathBuf, PathBuf), MirrorError> {
        let secret_path = with_suffix(prefix, "secret");
        let pub_path = with_suffix(prefix, "pub");

        std::fs::write(&secret_path, BASE64.encode(self.signing_key.to_bytes()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(&secret_path, perms) {
                tracing::warn!(path = %secret_path.display(), error = %e, "could not restrict secret key permissions");
            }
        }
        std::fs::write(&pub_path, self.public_key_base64())?;
        Ok((secret_path, pub_path))
    }
}

impl std::fmt::Debug for SignerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerIdentity")
            .field("name", &self.name)
            .field("key", &key_fingerprint(&self.verifying_key()))
            .finish()
    }
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn read_key_bytes(path: &Path, what: &str) -> Result<[u8; 32], MirrorError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| MirrorError::Key(format!("error reading {what} '{}': {e}", path.display())))?;
    let bytes = BASE64
        .decode(contents.trim())
        .map_err(|e| MirrorError::Key(format!("error decoding {what} '{}': {e}", path.display())))?;
    bytes.try_into().map_err(|_| {
        MirrorError::Key(format!(
            "invalid {what} length in '{}': expected 32 bytes",
            path.display()
        ))
    })
}

/// Read a base64 32-byte Ed25519 seed.
pub fn read_secret_key(path: &Path) -> Result<SigningKey, MirrorError> {
    Ok(SigningKey::from_bytes(&read_key_bytes(path, "secret key")?))
}

/// Read a base64 32-byte Ed25519 verifying key.
pub fn read_public_key(path: &Path) -> Result<VerifyingKey, MirrorError> {
    let bytes = read_key_bytes(path, "public key")?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| {
        MirrorError::Key(format!(
            "invalid public key material in '{}': {e}",
            path.display()
        ))
    })
}

/// Short hex fingerprint of a verifying key (its first 8 bytes).
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    key.to_bytes()[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;
    use tempfile::TempDir;

    #[test]
    fn keypair_round_trips_through_files() {
        let tmp = TempDir::new().unwrap();
        let identity = SignerIdentity::generate("operator-1");
        let (secret, public) = identity.write_keypair(&tmp.path().join("operator")).unwrap();
        assert!(secret.ends_with("operator.secret"));
        assert!(public.ends_with("operator.pub"));

        let loaded = SignerIdentity::load("operator-1", &secret).unwrap();
        let verifying = read_public_key(&public).unwrap();
        assert_eq!(loaded.verifying_key(), verifying);

        let sig = loaded.sign(b"mirror me");
        verifying.verify(b"mirror me", &sig).unwrap();
    }

    #[test]
    fn generated_identities_differ() {
        let a = SignerIdentity::generate("a");
        let b = SignerIdentity::generate("b");
        assert_ne!(a.public_key_base64(), b.public_key_base64());
    }

    #[test]
    fn bad_key_files_are_errors() {
        let tmp = TempDir::new().unwrap();
        let bad = tmp.path().join("bad.secret");
        std::fs::write(&bad, "not-valid-base64!!!").unwrap();
        assert!(matches!(read_secret_key(&bad), Err(MirrorError::Key(_))));

        let short = tmp.path().join("short.secret");
        std::fs::write(&short, BASE64.encode([7u8; 16])).unwrap();
        assert!(matches!(read_secret_key(&short), Err(MirrorError::Key(_))));

        assert!(read_secret_key(&tmp.path().join("missing.secret")).is_err());
    }

    #[test]
    fn debug_output_hides_the_seed() {
        let identity = SignerIdentity::from_seed("op", [1u8; 32]);
        let shown = format!("{identity:?}");
        assert!(shown.contains("op"));
        assert!(!shown.contains(&BASE64.encode([1u8; 32])));
        assert_eq!(key_fingerprint(&identity.verifying_key()).len(), 16);
    }
}

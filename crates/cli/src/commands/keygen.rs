use std::path::Path;
use std::process;

use waymark_mirror::{key_fingerprint, SignerIdentity};

use crate::{report_error, OutputFormat};

/// Generate an Ed25519 signing keypair for the ledger mirror.
///
/// Writes `<prefix>.secret` (base64-encoded 32-byte seed, mode 0o600 on
/// Unix) and `<prefix>.pub` (base64-encoded verifying key).
pub(crate) fn cmd_keygen(algorithm: &str, prefix: &Path, output: OutputFormat, quiet: bool) {
    if algorithm != "ed25519" {
        report_error(
            &format!(
                "unsupported algorithm '{}'; only 'ed25519' is supported",
                algorithm
            ),
            output,
            quiet,
        );
        process::exit(1);
    }

    let name = prefix
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "waymark".to_string());
    let identity = SignerIdentity::generate(&name);
    let (secret_path, pub_path) = match identity.write_keypair(prefix) {
        Ok(paths) => paths,
        Err(e) => {
            report_error(
                &format!("error writing keypair '{}': {}", prefix.display(), e),
                output,
                quiet,
            );
            process::exit(1);
        }
    };

    let fingerprint = key_fingerprint(&identity.verifying_key());
    match output {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "algorithm": "ed25519",
                "secret": secret_path.display().to_string(),
                "public": pub_path.display().to_string(),
                "fingerprint": fingerprint,
            })
        ),
        OutputFormat::Text => {
            if !quiet {
                println!(
                    "Generated Ed25519 keypair: {}, {} (fingerprint {})",
                    secret_path.display(),
                    pub_path.display(),
                    fingerprint
                );
            }
        }
    }
}

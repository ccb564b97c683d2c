//! `waymark.toml`, the runtime configuration read by `exec`, `serve`,
//! `replay` and `reconcile`.
//!
//! # Example
//!
//! ```toml
//! [engine]
//! lock_timeout_ms = 2000
//! machine = "machines/file.toml"
//!
//! [storage]
//! data_dir = "./data"
//!
//! [capabilities]
//! alice = ["file:create", "file:log"]
//! ops = ["*"]
//!
//! [mirror]
//! enabled = true
//! channel_id = "audit"
//! contract_id = "file-lifecycle"
//! signer_identity = "operator-1"
//! signing_key = "keys/operator.secret"
//! gateway_url = "http://127.0.0.1:7080"
//! directories = ["contracts/"]
//! dead_letter = "mirror-failed.jsonl"
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WaymarkConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    /// Requester → granted capabilities. Absent means every requester is
    /// allowed everything.
    pub capabilities: Option<BTreeMap<String, Vec<String>>>,
    pub mirror: Option<MirrorSettings>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Machine definition TOML; the built-in file machine when absent.
    pub machine: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            machine: None,
        }
    }
}

impl EngineSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// `[storage]` section. Without `data_dir` state lives only in memory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageSettings {
    pub data_dir: Option<PathBuf>,
}

/// `[mirror]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct MirrorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub channel_id: String,
    pub contract_id: String,
    pub signer_identity: String,
    /// Base64 Ed25519 seed as written by `waymark keygen`. A throwaway key is
    /// generated when absent.
    pub signing_key: Option<PathBuf>,
    /// Ledger REST gateway. An in-process ledger is used when absent.
    pub gateway_url: Option<String>,
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub directories: Vec<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_status_retention")]
    pub status_retention: usize,
    pub dead_letter: Option<PathBuf>,
}

fn default_lock_timeout_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_status_retention() -> usize {
    waymark_mirror::DEFAULT_STATUS_RETENTION
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Read, parse and validate a config file, resolving relative paths
/// against its directory.
pub fn read_config(path: &Path) -> Result<WaymarkConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("could not read '{}': {}", path.display(), e))?;
    let mut config = parse_config(&content)
        .map_err(|e| format!("could not parse '{}': {}", path.display(), e))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    config.resolve_paths(base);
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<WaymarkConfig, String> {
    let config: WaymarkConfig = toml::from_str(content).map_err(|e| e.to_string())?;
    config.validate()?;
    Ok(config)
}

impl WaymarkConfig {
    /// The enabled mirror section, if any.
    pub fn active_mirror(&self) -> Option<&MirrorSettings> {
        self.mirror.as_ref().filter(|m| m.enabled)
    }

    fn validate(&self) -> Result<(), String> {
        if self.engine.lock_timeout_ms == 0 {
            return Err("engine.lock_timeout_ms must be greater than zero".to_string());
        }
        if let Some(mirror) = self.active_mirror() {
            for (field, value) in [
                ("channel_id", &mirror.channel_id),
                ("contract_id", &mirror.contract_id),
                ("signer_identity", &mirror.signer_identity),
            ] {
                if value.trim().is_empty() {
                    return Err(format!("mirror.{} must not be empty", field));
                }
            }
            if mirror.max_attempts == 0 {
                return Err("mirror.max_attempts must be at least 1".to_string());
            }
            if mirror.queue_capacity == 0 {
                return Err("mirror.queue_capacity must be at least 1".to_string());
            }
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(p) = self.engine.machine.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.storage.data_dir.as_mut() {
            resolve(p);
        }
        if let Some(mirror) = self.mirror.as_mut() {
            if let Some(p) = mirror.signing_key.as_mut() {
                resolve(p);
            }
            if let Some(p) = mirror.dead_letter.as_mut() {
                resolve(p);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[engine]
lock_timeout_ms = 500
machine = "machines/file.toml"

[storage]
data_dir = "data"

[capabilities]
alice = ["file:create", "file:log"]
ops = ["*"]

[mirror]
channel_id = "audit"
contract_id = "file-lifecycle"
signer_identity = "operator-1"
signing_key = "keys/op.secret"
directories = ["contracts/"]
max_attempts = 3
dead_letter = "/var/lib/waymark/failed.jsonl"
"#;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.engine.lock_timeout(), Duration::from_secs(2));
        assert!(config.storage.data_dir.is_none());
        assert!(config.capabilities.is_none());
        assert!(config.active_mirror().is_none());
    }

    #[test]
    fn full_config_parses() {
        let config = parse_config(FULL).unwrap();
        assert_eq!(config.engine.lock_timeout_ms, 500);
        let caps = config.capabilities.as_ref().unwrap();
        assert_eq!(caps["ops"], vec!["*".to_string()]);
        let mirror = config.active_mirror().unwrap();
        assert_eq!(mirror.max_attempts, 3);
        assert_eq!(mirror.initial_backoff_ms, 200);
        assert_eq!(mirror.queue_capacity, 1024);
        assert_eq!(mirror.status_retention, 4096);
        assert!(mirror.gateway_url.is_none());
    }

    #[test]
    fn disabled_mirror_is_inactive() {
        let config = parse_config(
            "[mirror]\nenabled = false\nchannel_id = \"\"\ncontract_id = \"\"\nsigner_identity = \"\"\n",
        )
        .unwrap();
        assert!(config.mirror.is_some());
        assert!(config.active_mirror().is_none());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(parse_config("[engine]\nlock_timeout_ms = 0\n").is_err());
        let err = parse_config(
            "[mirror]\nchannel_id = \" \"\ncontract_id = \"c\"\nsigner_identity = \"s\"\n",
        )
        .unwrap_err();
        assert!(err.contains("channel_id"), "{err}");
        assert!(parse_config("[engine\n").is_err());
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waymark.toml");
        std::fs::write(&path, FULL).unwrap();

        let config = read_config(&path).unwrap();
        assert_eq!(config.storage.data_dir.unwrap(), dir.path().join("data"));
        assert_eq!(
            config.engine.machine.unwrap(),
            dir.path().join("machines/file.toml")
        );
        let mirror = config.mirror.unwrap();
        assert_eq!(mirror.signing_key.unwrap(), dir.path().join("keys/op.secret"));
        assert_eq!(
            mirror.dead_letter.unwrap(),
            PathBuf::from("/var/lib/waymark/failed.jsonl")
        );
    }

    #[test]
    fn missing_file_is_reported() {
        let err = read_config(Path::new("/nonexistent/waymark.toml")).unwrap_err();
        assert!(err.contains("could not read"));
    }
}

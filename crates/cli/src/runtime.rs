//! Assembles the engine, storage backend and ledger mirror from a
//! [`WaymarkConfig`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use waymark_engine::{
    file, AllowAll, BuilderRegistry, CapabilityCheck, CommandRouter, Decider, DeciderConfig,
    MachineDefinition, StaticCapabilities,
};
use waymark_mirror::{
    HttpLedgerClient, InMemoryLedger, LedgerClient, LedgerMirror, MirrorConfig, MirrorScope,
    RetryPolicy, SignerIdentity,
};
use waymark_storage::{
    EventRecord, InMemoryStorage, JsonlStorage, LifecycleStorage, MemoryTransaction,
    SnapshotRecord, StorageError,
};

use crate::config::{MirrorSettings, WaymarkConfig};

/// The backend selected by `[storage]`.
pub(crate) enum Store {
    Memory(InMemoryStorage),
    Journal(JsonlStorage),
}

impl Store {
    pub(crate) fn describe(&self) -> String {
        match self {
            Store::Memory(_) => "in-memory".to_string(),
            Store::Journal(s) => format!("journal {}", s.journal_path().display()),
        }
    }
}

#[async_trait]
impl LifecycleStorage for Store {
    type Transaction = MemoryTransaction;

    async fn begin_transaction(&self) -> Result<MemoryTransaction, StorageError> {
        match self {
            Store::Memory(s) => s.begin_transaction().await,
            Store::Journal(s) => s.begin_transaction().await,
        }
    }

    async fn commit_transaction(&self, tx: MemoryTransaction) -> Result<(), StorageError> {
        match self {
            Store::Memory(s) => s.commit_transaction(tx).await,
            Store::Journal(s) => s.commit_transaction(tx).await,
        }
    }

    async fn abort_transaction(&self, tx: MemoryTransaction) -> Result<(), StorageError> {
        match self {
            Store::Memory(s) => s.abort_transaction(tx).await,
            Store::Journal(s) => s.abort_transaction(tx).await,
        }
    }

    async fn append_event(
        &self,
        tx: &mut MemoryTransaction,
        event: EventRecord,
    ) -> Result<(), StorageError> {
        match self {
            Store::Memory(s) => s.append_event(tx, event).await,
            Store::Journal(s) => s.append_event(tx, event).await,
        }
    }

    async fn put_snapshot(
        &self,
        tx: &mut MemoryTransaction,
        snapshot: SnapshotRecord,
        expected_version: Option<i64>,
    ) -> Result<(), StorageError> {
        match self {
            Store::Memory(s) => s.put_snapshot(tx, snapshot, expected_version).await,
            Store::Journal(s) => s.put_snapshot(tx, snapshot, expected_version).await,
        }
    }

    async fn get_snapshot(&self, entity_id: &str) -> Result<Option<SnapshotRecord>, StorageError> {
        match self {
            Store::Memory(s) => s.get_snapshot(entity_id).await,
            Store::Journal(s) => s.get_snapshot(entity_id).await,
        }
    }

    async fn read_events(
        &self,
        entity_id: &str,
        from_version: i64,
    ) -> Result<Vec<EventRecord>, StorageError> {
        match self {
            Store::Memory(s) => s.read_events(entity_id, from_version).await,
            Store::Journal(s) => s.read_events(entity_id, from_version).await,
        }
    }

    async fn list_snapshots(
        &self,
        entity_type: Option<&str>,
        state_filter: Option<&str>,
    ) -> Result<Vec<SnapshotRecord>, StorageError> {
        match self {
            Store::Memory(s) => s.list_snapshots(entity_type, state_filter).await,
            Store::Journal(s) => s.list_snapshots(entity_type, state_filter).await,
        }
    }
}

/// Everything a command needs to run.
pub(crate) struct Runtime {
    pub(crate) router: CommandRouter<Store>,
    pub(crate) decider: Arc<Decider<Store>>,
    pub(crate) mirror: Option<Arc<LedgerMirror>>,
}

impl Runtime {
    /// Build the runtime. Must be called inside a tokio runtime because the
    /// mirror worker is spawned here.
    pub(crate) fn build(config: &WaymarkConfig) -> Result<Self, String> {
        let machine = load_machine(config)?;
        let mut builders = BuilderRegistry::new();
        file::register_builders(&mut builders);

        let capabilities: Arc<dyn CapabilityCheck> = match &config.capabilities {
            Some(grants) => Arc::new(StaticCapabilities::from_map(grants.clone())),
            None => {
                tracing::warn!("no [capabilities] configured; every requester is allowed");
                Arc::new(AllowAll)
            }
        };

        let store = match &config.storage.data_dir {
            Some(dir) => Store::Journal(
                JsonlStorage::open(dir)
                    .map_err(|e| format!("could not open storage '{}': {}", dir.display(), e))?,
            ),
            None => Store::Memory(InMemoryStorage::new()),
        };
        tracing::info!(storage = %store.describe(), "storage ready");

        let mut decider = Decider::new(
            Arc::new(machine),
            Arc::new(builders),
            capabilities,
            Arc::new(store),
        )
        .with_config(DeciderConfig {
            lock_timeout: config.engine.lock_timeout(),
        });

        let mirror = match config.active_mirror() {
            Some(settings) => {
                let mirror = Arc::new(start_mirror(settings)?);
                decider = decider.with_mirror(mirror.clone());
                Some(mirror)
            }
            None => None,
        };

        let decider = Arc::new(decider);
        Ok(Self {
            router: CommandRouter::for_machine(decider.clone()),
            decider,
            mirror,
        })
    }

    /// Give queued mirror submissions up to `grace` to settle, then stop
    /// the worker.
    pub(crate) async fn shutdown(&self, grace: Duration) {
        let Some(mirror) = &self.mirror else {
            return;
        };
        let deadline = tokio::time::Instant::now() + grace;
        while mirror.status().counts().0 > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let (pending, submitted, failed, skipped) = mirror.status().counts();
        if pending > 0 {
            tracing::warn!(pending, "mirror stopped with submissions still pending");
        }
        tracing::debug!(submitted, failed, skipped, "mirror summary");
        mirror.shutdown().await;
    }
}

fn load_machine(config: &WaymarkConfig) -> Result<MachineDefinition, String> {
    match &config.engine.machine {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .map_err(|e| format!("could not read '{}': {}", path.display(), e))?;
            MachineDefinition::from_toml_str(&source)
                .map_err(|e| format!("invalid machine '{}': {}", path.display(), e))
        }
        None => file::machine().map_err(|e| format!("built-in file machine: {}", e)),
    }
}

/// The ledger client `[mirror]` points at.
pub(crate) fn ledger_client(settings: &MirrorSettings) -> Arc<dyn LedgerClient> {
    match &settings.gateway_url {
        Some(url) => Arc::new(HttpLedgerClient::new(url, None)),
        None => {
            tracing::warn!("no mirror.gateway_url; mirroring to an in-process ledger");
            Arc::new(InMemoryLedger::new())
        }
    }
}

fn start_mirror(settings: &MirrorSettings) -> Result<LedgerMirror, String> {
    let identity = match &settings.signing_key {
        Some(path) => SignerIdentity::load(&settings.signer_identity, path)
            .map_err(|e| format!("could not load signing key '{}': {}", path.display(), e))?,
        None => {
            tracing::warn!(
                signer = %settings.signer_identity,
                "no mirror.signing_key; signing with a throwaway key"
            );
            SignerIdentity::generate(&settings.signer_identity)
        }
    };

    let mut config = MirrorConfig::new(&settings.channel_id, &settings.contract_id);
    config.scope = MirrorScope {
        entity_types: settings.entity_types.iter().cloned().collect(),
        directories: settings.directories.clone(),
    };
    config.retry = RetryPolicy {
        max_attempts: settings.max_attempts,
        initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
        max_backoff: Duration::from_millis(settings.max_backoff_ms),
    };
    config.queue_capacity = settings.queue_capacity;
    config.status_retention = settings.status_retention;
    config.dead_letter = settings.dead_letter.clone();

    tracing::info!(
        channel = %config.channel_id,
        contract = %config.contract_id,
        signer = %identity.name(),
        "ledger mirror started"
    );
    Ok(LedgerMirror::start(ledger_client(settings), identity, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use serde_json::json;
    use waymark_engine::{Command, DecideError};

    fn initiate(id: &str, requester: &str) -> Command {
        Command::new("file", id, "initiate", requester).with_payload(json!({
            "path": format!("contracts/{id}.pdf"),
            "hash": file::content_hash(id.as_bytes()),
        }))
    }

    #[tokio::test]
    async fn default_config_runs_file_lifecycle_in_memory() {
        let runtime = Runtime::build(&WaymarkConfig::default()).unwrap();
        assert!(runtime.mirror.is_none());
        let event = runtime.router.dispatch(&initiate("f1", "anyone")).await.unwrap();
        assert_eq!(event.version, 1);
        assert!(matches!(runtime.decider.storage().as_ref(), Store::Memory(_)));
    }

    #[tokio::test]
    async fn configured_capabilities_are_enforced() {
        let config = parse_config("[capabilities]\nalice = [\"file:create\"]\n").unwrap();
        let runtime = Runtime::build(&config).unwrap();
        runtime.router.dispatch(&initiate("f1", "alice")).await.unwrap();
        let err = runtime
            .router
            .dispatch(&Command::new("file", "f1", "delete", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, DecideError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn journal_backend_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WaymarkConfig::default();
        config.storage.data_dir = Some(dir.path().to_path_buf());

        let runtime = Runtime::build(&config).unwrap();
        runtime.router.dispatch(&initiate("f1", "ops")).await.unwrap();
        drop(runtime);

        let runtime = Runtime::build(&config).unwrap();
        let snap = runtime.decider.snapshot("f1").await.unwrap().unwrap();
        assert_eq!((snap.state.as_str(), snap.version), ("exists", 1));
    }

    #[tokio::test]
    async fn data_dir_has_one_owner_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WaymarkConfig::default();
        config.storage.data_dir = Some(dir.path().to_path_buf());

        let owner = Runtime::build(&config).unwrap();
        let err = Runtime::build(&config).err().unwrap();
        assert!(err.contains("locked"), "{err}");
        drop(owner);
        assert!(Runtime::build(&config).is_ok());
    }

    #[tokio::test]
    async fn mirror_without_gateway_uses_in_process_ledger() {
        let config = parse_config(
            "[mirror]\nchannel_id = \"audit\"\ncontract_id = \"files\"\nsigner_identity = \"op\"\n",
        )
        .unwrap();
        let runtime = Runtime::build(&config).unwrap();
        runtime.router.dispatch(&initiate("f1", "ops")).await.unwrap();
        runtime.shutdown(Duration::from_secs(5)).await;

        let mirror = runtime.mirror.as_ref().unwrap();
        assert!(mirror.status().is_submitted("f1@1"));
    }

    #[tokio::test]
    async fn missing_machine_file_is_an_error() {
        let mut config = WaymarkConfig::default();
        config.engine.machine = Some("/nonexistent/machine.toml".into());
        let err = Runtime::build(&config).err().unwrap();
        assert!(err.contains("could not read"), "{err}");
    }
}

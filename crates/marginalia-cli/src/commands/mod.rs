//! Command handlers

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use marginalia_core::{
    Config, DisabledRemote, DocumentKey, EngineOptions, LocalStore, RemoteStore, SyncEngine,
    WsRemoteStore,
};

pub mod annotations;
pub mod config;
pub mod failures;
pub mod queue;
pub mod status;
pub mod sync;
pub mod watch;

/// Open the local store and build an engine around it
///
/// Without an active sync URL the engine gets a remote that is always
/// unreachable, so saves stay queued until sync is configured.
pub fn open_engine(config: &Config, config_path: Option<&PathBuf>) -> Result<Arc<SyncEngine>> {
    let local = Arc::new(LocalStore::open(config).context("Failed to open annotation store")?);

    let remote: Arc<dyn RemoteStore> = match config.active_sync_url() {
        Some(url) => {
            let device_id = ensure_device_id(config, config_path)?;
            Arc::new(WsRemoteStore::new(url, &device_id))
        }
        None => Arc::new(DisabledRemote),
    };

    let engine = SyncEngine::new(local, remote, EngineOptions::from_config(config))
        .context("Failed to start sync engine")?;
    Ok(engine)
}

/// Device id from the config, generating and saving one on first use
fn ensure_device_id(config: &Config, config_path: Option<&PathBuf>) -> Result<String> {
    if let Some(ref id) = config.device_id {
        return Ok(id.clone());
    }

    let device_id = config.device_id_or_generate();
    let mut updated = config.clone();
    updated.device_id = Some(device_id.clone());

    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    updated
        .save_to_path(&save_path)
        .context("Failed to save generated device id")?;
    info!("Generated device id {}", device_id);

    Ok(device_id)
}

/// Turn a command-line argument into a document key
///
/// Anything with a scheme is used as-is. Paths that exist on disk are
/// canonicalized so the same file always maps to the same key.
pub fn parse_key(raw: &str) -> DocumentKey {
    if raw.contains("://") {
        return DocumentKey::new(raw);
    }
    let path = Path::new(raw);
    match path.canonicalize() {
        Ok(canonical) => DocumentKey::from_path(&canonical),
        Err(_) => DocumentKey::new(raw),
    }
}

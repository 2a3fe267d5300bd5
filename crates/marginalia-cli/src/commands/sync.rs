//! Sync command handler

use std::path::PathBuf;

use anyhow::{bail, Result};

use marginalia_core::{Config, SyncEvent, SyncStatus};

use super::open_engine;
use crate::output::Output;

/// Fail with setup hints unless sync is configured
pub fn require_sync_url(config: &Config) -> Result<&str> {
    if !config.sync_enabled {
        bail!(
            "Sync is not enabled. Enable it with:\n  \
             marginalia config set sync_enabled true\n  \
             marginalia config set sync_url ws://your-server:3030"
        );
    }

    let Some(ref sync_url) = config.sync_url else {
        bail!(
            "Sync URL not configured. Set it with:\n  \
             marginalia config set sync_url ws://your-server:3030"
        );
    };

    Ok(sync_url.as_str())
}

/// Push every pending save now
pub async fn sync(config: &Config, config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let sync_url = require_sync_url(config)?;
    let engine = open_engine(config, config_path)?;
    let mut events = engine.take_events();

    let pending = engine.pending_count().await;
    if pending == 0 {
        output.success("Nothing to sync - already up to date");
        engine.shutdown();
        return Ok(());
    }

    output.message(&format!("Pushing {} pending save(s) to {}...", pending, sync_url));
    let status = engine.sync_now().await;

    let mut abandoned = Vec::new();
    if let Some(ref mut rx) = events {
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::TerminalFailure(failure) = event {
                abandoned.push(failure);
            }
        }
    }

    let remaining = engine.pending_count().await;
    engine.shutdown();

    if !abandoned.is_empty() {
        output.warning(&format!(
            "{} document(s) could not be synchronized and were dropped from the queue:",
            abandoned.len()
        ));
        output.print_failures(&abandoned);
    }

    match status {
        SyncStatus::Success => {
            output.success("Sync complete");
            Ok(())
        }
        _ => bail!(
            "Sync incomplete: {} save(s) still pending. They will be retried on the next sync.",
            remaining
        ),
    }
}

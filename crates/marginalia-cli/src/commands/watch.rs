//! Watch command handler

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use marginalia_core::{spawn_probe, Config, ConnectivityMonitor, SyncEvent, TcpProbe};

use super::open_engine;
use super::sync::require_sync_url;
use crate::output::Output;

/// Run until interrupted, syncing whenever the server comes back
pub async fn watch(config: &Config, config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let sync_url = require_sync_url(config)?;
    let probe = TcpProbe::from_url(sync_url)
        .with_context(|| format!("Cannot determine host and port of {}", sync_url))?;

    let engine = open_engine(config, config_path)?;
    let mut events = engine
        .take_events()
        .context("Engine events already taken")?;

    let monitor = Arc::new(ConnectivityMonitor::new(true));
    engine.attach_connectivity(&monitor);
    let _probe_handle = spawn_probe(
        Arc::clone(&monitor),
        Arc::new(probe),
        config.probe_interval(),
    );

    output.message(&format!(
        "Watching {} ({} pending). Press Ctrl-C to stop.",
        sync_url,
        engine.pending_count().await
    ));

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                report(&event, output);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping watch");
                break;
            }
        }
    }

    engine.shutdown();
    output.message(&format!(
        "Stopped. {} save(s) still pending.",
        engine.pending_count().await
    ));
    Ok(())
}

fn report(event: &SyncEvent, output: &Output) {
    match event {
        SyncEvent::StatusChanged(status) => output.message(&format!("sync: {}", status)),
        SyncEvent::ConnectivityChanged(true) => output.message("server reachable"),
        SyncEvent::ConnectivityChanged(false) => output.message("server unreachable"),
        SyncEvent::TerminalFailure(failure) => output.warning(&format!(
            "gave up on {} after {} attempts: {}",
            failure.document_key, failure.attempts, failure.reason
        )),
    }
}

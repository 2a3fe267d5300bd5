//! Status command handler

use std::path::PathBuf;

use anyhow::Result;

use marginalia_core::{Config, ReachabilityProbe, TcpProbe};

use super::open_engine;
use crate::output::{human_size, Output, OutputFormat};

/// Show storage, queue and sync information
pub async fn show(config: &Config, config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let engine = open_engine(config, config_path)?;
    let stats = engine.local().stats()?;
    let pending = engine.pending_count().await;
    let sync_url = config.active_sync_url();

    let reachable = match sync_url.and_then(TcpProbe::from_url) {
        Some(probe) => Some(probe.probe().await),
        None => None,
    };
    engine.shutdown();

    match output.format {
        OutputFormat::Json => output.json(&serde_json::json!({
            "sync_enabled": config.sync_enabled,
            "sync_url": config.sync_url,
            "device_id": config.device_id,
            "reachable": reachable,
            "storage": {
                "location": config.database_path(),
                "database_size": stats.database_size,
                "records": stats.records,
                "pending": stats.pending,
            },
            "queue": {
                "pending": pending,
                "failures": stats.failures,
            }
        })),
        OutputFormat::Quiet => println!("{}", pending),
        OutputFormat::Human => {
            println!("Marginalia Status");
            println!("=================");
            println!();
            println!("Sync:");
            println!(
                "  Status: {}",
                if config.sync_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            if let Some(ref url) = config.sync_url {
                println!("  Server: {}", url);
            }
            if let Some(ref id) = config.device_id {
                println!("  Device: {}", id);
            }
            match reachable {
                Some(true) => println!("  Server reachable: yes"),
                Some(false) => println!("  Server reachable: no"),
                None => {}
            }
            println!();
            println!("Storage:");
            println!("  Location: {}", config.database_path().display());
            println!("  Size:     {}", human_size(stats.database_size));
            println!("  Records:  {}", stats.records);
            println!();
            println!("Queue:");
            println!("  Pending:  {}", pending);
            println!("  Failed:   {}", stats.failures);
            if stats.failures > 0 {
                println!();
                println!("Run 'marginalia failures' to see documents that could not sync.");
            }
        }
    }

    Ok(())
}

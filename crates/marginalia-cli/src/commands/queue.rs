//! Queue command handler

use std::path::PathBuf;

use anyhow::Result;

use marginalia_core::Config;

use super::open_engine;
use crate::output::Output;

/// List pending saves in the order they will be pushed
pub async fn list(config: &Config, config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let engine = open_engine(config, config_path)?;
    let entries = engine.pending().await;
    output.print_queue(&entries);
    engine.shutdown();
    Ok(())
}

//! Failures command handler

use std::path::PathBuf;

use anyhow::Result;

use marginalia_core::Config;

use super::{open_engine, parse_key};
use crate::output::Output;

/// List, clear or retry documents whose saves were abandoned
pub async fn run(
    config: &Config,
    config_path: Option<&PathBuf>,
    clear: bool,
    retry: Option<String>,
    output: &Output,
) -> Result<()> {
    let engine = open_engine(config, config_path)?;

    if clear {
        let cleared = engine.clear_failures()?;
        output.success(&format!("Cleared {} failure(s)", cleared));
    } else if let Some(raw_key) = retry {
        let key = parse_key(&raw_key);
        if engine.retry_failed(&key).await? {
            output.success(&format!("Queued {} for the next sync", key));
        } else {
            output.warning(&format!("No failed save recorded for {}", key));
        }
    } else {
        let failures = engine.terminal_failures()?;
        output.print_failures(&failures);
    }

    engine.shutdown();
    Ok(())
}

//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use marginalia_core::Config;

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "data_dir, sync_url, sync_enabled, device_id, load_timeout_ms, \
                          max_push_attempts, reconnect_settle_ms, probe_interval_ms, log_file";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => output.json(&config),
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!("  data_dir:            {}", config.data_dir.display());
            println!(
                "  sync_url:            {}",
                config.sync_url.as_deref().unwrap_or("(not set)")
            );
            println!("  sync_enabled:        {}", config.sync_enabled);
            println!(
                "  device_id:           {}",
                config.device_id.as_deref().unwrap_or("(generated on first sync)")
            );
            println!("  load_timeout_ms:     {}", config.load_timeout_ms);
            println!("  max_push_attempts:   {}", config.max_push_attempts);
            println!("  reconnect_settle_ms: {}", config.reconnect_settle_ms);
            println!("  probe_interval_ms:   {}", config.probe_interval_ms);
            println!(
                "  log_file:            {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(stderr)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        "data_dir" => {
            config.data_dir = value.into();
        }
        "sync_url" => {
            config.sync_url = optional(value);
        }
        "sync_enabled" => {
            config.sync_enabled = value
                .parse()
                .context("Invalid value for sync_enabled. Use 'true' or 'false'.")?;
        }
        "device_id" => {
            config.device_id = optional(value);
        }
        "load_timeout_ms" => {
            config.load_timeout_ms = parse_millis(key, value)?;
        }
        "max_push_attempts" => {
            let attempts: u32 = value
                .parse()
                .context("Invalid value for max_push_attempts. Use a whole number.")?;
            if attempts == 0 {
                bail!("max_push_attempts must be at least 1");
            }
            config.max_push_attempts = attempts;
        }
        "reconnect_settle_ms" => {
            config.reconnect_settle_ms = parse_millis(key, value)?;
        }
        "probe_interval_ms" => {
            config.probe_interval_ms = parse_millis(key, value)?;
        }
        "log_file" => {
            config.log_file = optional(value).map(PathBuf::from);
        }
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }
    Ok(())
}

/// Empty or "none" clears an optional setting
fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_millis(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .with_context(|| format!("Invalid value for {}. Use milliseconds.", key))
}

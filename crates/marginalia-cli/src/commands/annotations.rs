//! Annotation command handlers

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use marginalia_core::{codec, AnnotationPayload, Config, SaveOutcome};

use super::{open_engine, parse_key};
use crate::output::Output;

/// Show the local record for a document
pub fn show(
    config: &Config,
    config_path: Option<&PathBuf>,
    raw_key: &str,
    output: &Output,
) -> Result<()> {
    let engine = open_engine(config, config_path)?;
    let key = parse_key(raw_key);

    match engine.local().get(&key)? {
        Some(record) => output.print_record(&record),
        None if output.is_json() => println!("null"),
        None => output.message(&format!("No local annotations for {}.", key)),
    }

    Ok(())
}

/// Load a document's annotations, remote first
pub async fn load(
    config: &Config,
    config_path: Option<&PathBuf>,
    raw_key: &str,
    output: &Output,
) -> Result<()> {
    let engine = open_engine(config, config_path)?;
    let key = parse_key(raw_key);

    let loaded = engine.load(&key).await?;
    output.print_loaded(&key, loaded.as_ref());

    engine.shutdown();
    Ok(())
}

/// Save annotations read from a file or stdin
pub async fn save(
    config: &Config,
    config_path: Option<&PathBuf>,
    raw_key: &str,
    file: Option<&Path>,
    output: &Output,
) -> Result<()> {
    let payload = read_payload(file)?;
    let engine = open_engine(config, config_path)?;
    let key = parse_key(raw_key);

    let outcome = engine.save(&key, payload).await?;
    match outcome {
        SaveOutcome::Pushed => output.success(&format!("Saved and synced {}", key)),
        SaveOutcome::Queued => {
            output.success(&format!("Saved {}", key));
            output.warning("Server not reachable; the save is queued for the next sync.");
        }
    }

    engine.shutdown();
    Ok(())
}

/// Delete a document's local annotations
pub async fn delete(
    config: &Config,
    config_path: Option<&PathBuf>,
    raw_key: &str,
    output: &Output,
) -> Result<()> {
    let engine = open_engine(config, config_path)?;
    let key = parse_key(raw_key);

    if engine.delete(&key).await? {
        output.success(&format!("Deleted local annotations for {}", key));
    } else {
        output.message(&format!("No local annotations for {}.", key));
    }

    engine.shutdown();
    Ok(())
}

fn read_payload(file: Option<&Path>) -> Result<AnnotationPayload> {
    let text = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("Failed to read annotations from stdin")?;
            text
        }
    };

    codec::deserialize(&text).context("Annotation file is not valid annotation JSON")
}

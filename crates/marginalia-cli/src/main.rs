//! Marginalia CLI
//!
//! Command-line interface for the marginalia annotation sync engine.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use marginalia_core::{Config, StorageError, SyncError};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "marginalia")]
#[command(about = "Marginalia - offline-first annotation sync")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use an alternate config file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show status (storage, queue, connectivity)
    Status,
    /// Show the local record for a document
    Show {
        /// Document path or key
        key: String,
    },
    /// Load annotations, preferring the remote copy
    Load {
        /// Document path or key
        key: String,
    },
    /// Save annotations for a document
    Save {
        /// Document path or key
        key: String,
        /// Annotation JSON file (reads stdin when omitted)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Delete the local annotations for a document
    #[command(alias = "rm")]
    Delete {
        /// Document path or key
        key: String,
    },
    /// List saves waiting to reach the server
    Queue,
    /// List documents whose saves were abandoned
    Failures {
        /// Forget all recorded failures
        #[arg(long, conflicts_with = "retry")]
        clear: bool,
        /// Queue a failed document again
        #[arg(long, value_name = "KEY")]
        retry: Option<String>,
    },
    /// Push all pending saves now
    Sync,
    /// Stay running and sync whenever the server becomes reachable
    Watch,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, sync_url, sync_enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    let result = run(cli, &output).await;
    if let Err(ref e) = result {
        if let Some(hint) = recovery_hint(e) {
            output.warning(hint);
        }
    }
    result
}

async fn run(cli: Cli, output: &Output) -> Result<()> {
    let config_path = cli.config.as_ref();

    // Config commands work even when the config file is broken
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, config_path, output)
            }
        };
    }

    let config = Config::load_with_cli_override(config_path)?;
    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Status => commands::status::show(&config, config_path, output).await,
        Commands::Show { key } => commands::annotations::show(&config, config_path, &key, output),
        Commands::Load { key } => {
            commands::annotations::load(&config, config_path, &key, output).await
        }
        Commands::Save { key, file } => {
            commands::annotations::save(&config, config_path, &key, file.as_deref(), output)
                .await
        }
        Commands::Delete { key } => {
            commands::annotations::delete(&config, config_path, &key, output).await
        }
        Commands::Queue => commands::queue::list(&config, config_path, output).await,
        Commands::Failures { clear, retry } => {
            commands::failures::run(&config, config_path, clear, retry, output).await
        }
        Commands::Sync => commands::sync::sync(&config, config_path, output).await,
        Commands::Watch => commands::watch::watch(&config, config_path, output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

/// Suggestion attached to a local storage failure anywhere in the chain
fn recovery_hint(error: &anyhow::Error) -> Option<&'static str> {
    error.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<SyncError>() {
            e.recovery_suggestion()
        } else if let Some(e) = cause.downcast_ref::<StorageError>() {
            e.recovery_suggestion()
        } else {
            None
        }
    })
}

/// Initialize tracing
///
/// Log level comes from MARGINALIA_LOG, falling back to the -v count.
/// Logs go to the configured log file, or stderr when none is set.
fn init_logging(config: &Config, verbose: u8) {
    let log_level = std::env::var("MARGINALIA_LOG").unwrap_or_else(|_| level_for(verbose).into());
    let filter = EnvFilter::new(format!(
        "marginalia_core={},marginalia_cli={}",
        log_level, log_level
    ));

    if let Some(ref log_path) = config.log_file {
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(log_path) {
            Ok(file) => {
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .try_init();
                return;
            }
            Err(e) => eprintln!(
                "Could not open log file {}: {}; logging to stderr",
                log_path.display(),
                e
            ),
        }
    }

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn level_for(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

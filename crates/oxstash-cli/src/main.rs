#![deny(unsafe_code)]

mod commands;
mod config;
mod exit_code;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use oxstash_core::backend::{LocalBackend, LocalOptions};
use oxstash_core::{EncryptionConfig, StorageClient, StorageError, connect};

use crate::commands::{cat, ls, mirror, rm, stat, write};
use crate::config::CliConfig;

/// Command-line interface for encrypted oxstash stores
#[derive(Parser)]
#[command(name = "oxstash")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # List store contents (key from the environment)
    OXSTASH_KEY=... oxstash --store ~/stash ls /

    # Store a file from stdin
    tar cz ~/notes | oxstash --store ~/stash write /backups/notes.tgz

    # Copy changed files from a plain directory
    oxstash --store ~/stash mirror ~/Documents /docs
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress log output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// TOML settings file
    #[arg(long, value_name = "FILE", env = "OXSTASH_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Local directory holding the store
    #[arg(long, value_name = "DIR", env = "OXSTASH_STORE", global = true)]
    store: Option<PathBuf>,

    /// Create the store directory if it does not exist
    #[arg(long, global = true)]
    create: bool,

    /// Encryption key (omit to access the store unencrypted)
    #[arg(long, env = "OXSTASH_KEY", hide_env_values = true, global = true)]
    key: Option<String>,

    /// Base IV: 32 hex digits, or a seed to derive it from
    #[arg(long, env = "OXSTASH_IV", hide_env_values = true, global = true)]
    iv: Option<String>,

    /// Reject every modification
    #[arg(long, global = true)]
    read_only: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List directory contents
    Ls(ls::Args),

    /// Write a file to stdout
    Cat(cat::Args),

    /// Write stdin to a file
    Write(write::Args),

    /// Remove a file or directory
    Rm(rm::Args),

    /// Show metadata of a path
    Stat(stat::Args),

    /// Copy changed files from a plain local directory
    Mirror(mirror::Args),
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(categorize_error(&e))
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    if !cli.quiet {
        setup_tracing(cli.verbose);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(execute(cli))
}

async fn execute(cli: Cli) -> Result<()> {
    let client = open_store(&cli).await?;

    let result = match &cli.command {
        Commands::Ls(args) => ls::execute(&client, args).await,
        Commands::Cat(args) => cat::execute(&client, args).await,
        Commands::Write(args) => write::execute(&client, args).await,
        Commands::Rm(args) => rm::execute(&client, args).await,
        Commands::Stat(args) => stat::execute(&client, args).await,
        Commands::Mirror(args) => mirror::execute(&client, args).await,
    };

    client.destroy().await;
    result
}

/// Merge the settings file with flags and connect to the store.
async fn open_store(cli: &Cli) -> Result<StorageClient> {
    let mut config = match &cli.config {
        Some(path) => CliConfig::load(path)?,
        None => CliConfig::default(),
    };

    let store = cli
        .store
        .clone()
        .or(config.store.take())
        .context("No store given (use --store, OXSTASH_STORE or the config file)")?;

    if let Some(key) = &cli.key {
        let mut encryption = match config.connect.encryption.take() {
            Some(existing) => EncryptionConfig {
                key: key.clone().into(),
                ..existing
            },
            None => EncryptionConfig::new(key.clone()),
        };
        if let Some(iv) = &cli.iv {
            encryption = encryption.with_iv(iv.clone());
        }
        config.connect.encryption = Some(encryption);
    } else if let (Some(iv), Some(encryption)) = (&cli.iv, config.connect.encryption.take()) {
        config.connect.encryption = Some(encryption.with_iv(iv.clone()));
    }
    if cli.read_only {
        config.connect.read_only = true;
    }
    if config.connect.encryption.is_none() {
        tracing::warn!(store = %store.display(), "No key configured, accessing the store unencrypted");
    }

    let options = LocalOptions {
        create_if_not_exist: cli.create || config.create,
        ..LocalOptions::default()
    };
    let backend = LocalBackend::new(store.clone(), options)
        .with_context(|| format!("Cannot open store: {}", store.display()))?;
    let client = connect(Arc::new(backend), config.connect).await?;
    tracing::debug!(id = client.id(), "Connected");
    Ok(client)
}

/// Set up tracing/logging based on verbosity level
fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}

/// Categorize an error into an exit code using typed error downcasting
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(storage_err) = cause.downcast_ref::<StorageError>() {
            match storage_err {
                StorageError::NotFound { .. } => return exit_code::NOT_FOUND,
                StorageError::ReadOnly { .. } => return exit_code::READ_ONLY,
                StorageError::Cipher { .. } | StorageError::Consistency { .. } => {
                    return exit_code::CORRUPT;
                }
                _ => {}
            }
        }

        if let Some(io_err) = cause.downcast_ref::<io::Error>()
            && io_err.kind() == io::ErrorKind::NotFound
        {
            return exit_code::NOT_FOUND;
        }
    }
    exit_code::GENERAL_ERROR
}

//! Mirror command - copy a plain local directory into the store.
//!
//! Only files whose size differs from the copy already in the store are
//! transferred, so repeated runs are cheap.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Args as ClapArgs;
use tracing::instrument;

use oxstash_core::backend::{LocalBackend, LocalOptions};
use oxstash_core::{ConnectOptions, StorageClient, connect};

use super::normalize_path;

#[derive(ClapArgs)]
pub struct Args {
    /// Plain (unencrypted) local directory to copy from
    pub source: PathBuf,

    /// Destination directory within the store
    #[arg(default_value = "/")]
    pub target: String,
}

#[instrument(level = "info", name = "cmd::mirror", skip_all, fields(source = %args.source.display(), target = %args.target))]
pub async fn execute(client: &StorageClient, args: &Args) -> Result<()> {
    let backend = LocalBackend::new(args.source.clone(), LocalOptions::default())
        .with_context(|| format!("Cannot open source directory: {}", args.source.display()))?;
    let source = connect(
        Arc::new(backend),
        ConnectOptions::default().read_only(),
    )
    .await?;

    let results = client
        .mirror(&source, "", normalize_path(&args.target))
        .await?;
    for path in &results.success {
        println!("copied  /{path}");
    }
    for (path, err) in &results.errors {
        eprintln!("failed  /{path}: {err}");
    }
    eprintln!(
        "Mirrored {} files, {} failed",
        results.success.len(),
        results.errors.len()
    );

    if !results.errors.is_empty() {
        bail!("{} files could not be mirrored", results.errors.len());
    }
    Ok(())
}

use anyhow::{Result, bail};
use clap::Args as ClapArgs;
use tracing::instrument;

use oxstash_core::StorageClient;
use oxstash_core::backend::RemoveOptions;

use super::normalize_path;

#[derive(ClapArgs)]
pub struct Args {
    /// Path to remove
    pub path: String,

    /// Remove directories and their contents recursively
    #[arg(short, long)]
    pub recursive: bool,

    /// Ignore nonexistent paths
    #[arg(short, long)]
    pub force: bool,
}

#[instrument(level = "info", name = "cmd::rm", skip_all, fields(path = %args.path, recursive = args.recursive))]
pub async fn execute(client: &StorageClient, args: &Args) -> Result<()> {
    let path = normalize_path(&args.path);
    if path.is_empty() && !args.recursive {
        bail!("Refusing to remove the root without --recursive");
    }

    let options = RemoveOptions {
        recursive: args.recursive,
        quiet: args.force,
    };
    let removed = client.remove(path, options).await?;
    tracing::info!(count = removed.len(), "Removed entries");
    Ok(())
}

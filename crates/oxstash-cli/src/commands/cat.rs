use anyhow::Result;
use clap::Args as ClapArgs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

use oxstash_core::StorageClient;

use super::normalize_path;

#[derive(ClapArgs)]
pub struct Args {
    /// File path within the store
    pub file: String,
}

#[instrument(level = "info", name = "cmd::cat", skip_all, fields(file = %args.file))]
pub async fn execute(client: &StorageClient, args: &Args) -> Result<()> {
    let path = normalize_path(&args.file);
    let content = client.read_file(path).await?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&content).await?;
    stdout.flush().await?;
    Ok(())
}

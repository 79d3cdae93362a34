use anyhow::Result;
use clap::Args as ClapArgs;
use serde_json::json;
use tracing::instrument;

use oxstash_core::StorageClient;

use super::normalize_path;

#[derive(ClapArgs)]
pub struct Args {
    /// Path within the store
    pub path: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[instrument(level = "info", name = "cmd::stat", skip_all, fields(path = %args.path))]
pub async fn execute(client: &StorageClient, args: &Args) -> Result<()> {
    let path = normalize_path(&args.path);
    let meta = client.metadata(path).await?;

    if args.json {
        let output = json!({
            "path": format!("/{path}"),
            "metadata": meta,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("  Path: /{path}");
    println!("  Type: {}", if meta.is_dir() { "directory" } else { "file" });
    if let Some(size) = meta.size {
        println!("  Size: {size} bytes");
    }
    if let Some(mtime) = meta.mtime {
        println!("Modify: {mtime} ms since epoch");
    }
    Ok(())
}

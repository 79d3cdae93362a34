//! List command - list directory contents.
//!
//! # Examples
//!
//! ```bash
//! # List root directory
//! oxstash --store ~/stash ls
//!
//! # Sizes and types, whole tree
//! oxstash --store ~/stash ls -lR /photos
//!
//! # Output as JSON for scripting
//! oxstash --store ~/stash ls --json / | jq '.entries[].name'
//! ```

use anyhow::Result;
use clap::Args as ClapArgs;
use serde::Serialize;
use tracing::instrument;

use oxstash_core::backend::Metadata;
use oxstash_core::StorageClient;

use super::{format_size, normalize_path};

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Path within the store (default: root)
    #[arg(default_value = "/")]
    pub path: String,

    /// Show type and size
    #[arg(short, long)]
    pub long: bool,

    /// List every file below the path
    #[arg(short = 'R', long)]
    pub recursive: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct LsOutput<'a> {
    path: &'a str,
    entries: &'a [Metadata],
}

#[instrument(level = "info", name = "cmd::ls", skip_all, fields(path = %args.path))]
pub async fn execute(client: &StorageClient, args: &Args) -> Result<()> {
    let path = normalize_path(&args.path);
    let entries = client.list(path, args.recursive, None).await?;

    if args.json {
        let output = LsOutput {
            path,
            entries: &entries,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for entry in &entries {
        // Recursive listings show paths relative to the listed directory
        let name = if args.recursive {
            relative_name(path, &entry.name)
        } else {
            entry.base_name()
        };
        if args.long {
            let size = entry.size.map(format_size).unwrap_or_default();
            let kind = if entry.is_dir() { "dir" } else { "file" };
            println!("{kind:<5} {size:>10}  {name}");
        } else if entry.is_dir() {
            println!("{name}/");
        } else {
            println!("{name}");
        }
    }
    Ok(())
}

fn relative_name<'a>(dir: &str, name: &'a str) -> &'a str {
    if dir.is_empty() {
        return name;
    }
    name.strip_prefix(dir)
        .map_or(name, |rest| rest.trim_start_matches('/'))
}

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use tokio::io::AsyncReadExt;
use tracing::instrument;

use oxstash_core::StorageClient;
use oxstash_core::error::io_error;
use oxstash_core::stream::{ByteSink, ByteSource};

use super::normalize_path;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(ClapArgs)]
pub struct Args {
    /// File path within the store
    pub file: String,
}

/// Stream stdin into the store without buffering it whole.
#[instrument(level = "info", name = "cmd::write", skip_all, fields(file = %args.file))]
pub async fn execute(client: &StorageClient, args: &Args) -> Result<()> {
    let path = normalize_path(&args.file);
    let (sink, source) = ByteSource::channel(4);

    let (written, ()) = tokio::join!(client.write(path, source), pump_stdin(sink));
    let written = written.with_context(|| format!("Failed to write /{path}"))?;
    tracing::info!(bytes = written, "Wrote file");
    Ok(())
}

async fn pump_stdin(sink: ByteSink) {
    let mut stdin = tokio::io::stdin();
    loop {
        let mut buf = vec![0u8; CHUNK_SIZE];
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                buf.truncate(n);
                // A send error means the writer gave up; its error is reported
                if sink.send(buf).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                sink.fail(io_error(e, "<stdin>", "write")).await;
                return;
            }
        }
    }
    sink.finish();
}

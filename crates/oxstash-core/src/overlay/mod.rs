//! Transparent encryption overlay.
//!
//! Turns a flat, key-addressed [`StorageBackend`](crate::backend::StorageBackend)
//! into a hierarchical, encrypted virtual filesystem:
//!
//! - [`codec`]: logical paths to salted, sharded hash keys
//! - `dirent`: per-directory indexes of encrypted child entries
//! - `scheduler`: bounded worker pool resolving listings concurrently
//! - [`EncryptedClient`]: the filesystem façade tying these together
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use oxstash_core::backend::{MemoryBackend, StorageBackend};
//! use oxstash_core::overlay::{EncryptedClient, EncryptionConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), oxstash_core::StorageError> {
//! let store = Arc::new(MemoryBackend::new());
//! let fs = EncryptedClient::uncached(store, &EncryptionConfig::new("correct horse"))?;
//!
//! fs.write("docs/a.txt", "hello".into()).await?;
//! let listing = fs.list("docs", false, None).await?;
//! assert_eq!(listing[0].name, "docs/a.txt");
//! assert_eq!(listing[0].size, Some(5));
//! # Ok(())
//! # }
//! ```

pub mod codec;
mod client;
mod config;
mod core;
mod dirent;
mod scheduler;

pub use client::EncryptedClient;
pub use codec::PathCodec;
pub use config::{
    DEFAULT_DIR_LEVELS, DEFAULT_META_TIMEOUT, DEFAULT_META_WORKERS, EncryptionConfig, FanOutPolicy,
    MAX_DIR_LEVELS,
};
pub use self::core::MetaSidecar;
pub use scheduler::SchedulerStatsSnapshot;

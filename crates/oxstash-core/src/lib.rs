//! Encrypted hierarchical storage over flat key-value backends.
//!
//! Start with [`client::connect`] for a cached client with utility
//! operations, or use [`overlay::EncryptedClient`] directly to stack the
//! encryption overlay on any [`backend::StorageBackend`].

pub mod backend;
pub mod cache;
pub mod client;
pub mod crypto;
pub mod error;
pub mod overlay;
pub mod path;
pub mod stream;

// Re-export commonly used types at crate root
pub use backend::{EntryType, Metadata, RemoveOptions, StorageBackend};
pub use client::{ConnectOptions, MirrorResults, StorageClient, connect};
pub use error::{OpContext, StorageError};
pub use overlay::{EncryptedClient, EncryptionConfig, FanOutPolicy};
pub use path::StoragePath;
pub use stream::{ByteSink, ByteSource, ByteStream};

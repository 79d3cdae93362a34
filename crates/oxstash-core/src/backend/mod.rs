//! Storage backends.
//!
//! A backend is the minimal capability set every storage driver provides:
//! flat keys addressed by slash-separated strings, prefix listing, streamed
//! reads and writes, and removal. The encryption overlay
//! ([`crate::overlay::EncryptedClient`]) implements the same trait on top of
//! another backend, so callers can stack it transparently.

pub mod memory;

#[cfg(feature = "local")]
pub mod local;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::stream::{ByteSource, ByteStream};

pub use memory::MemoryBackend;

#[cfg(feature = "local")]
pub use local::{LocalBackend, LocalOptions};

/// Kind of a listed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Dir,
    Link,
    Special,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryType::File => "file",
            EntryType::Dir => "dir",
            EntryType::Link => "link",
            EntryType::Special => "special",
        };
        f.write_str(name)
    }
}

/// Metadata of one entry, as returned by `list` and `metadata`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Full path (backend key, or logical path above the overlay)
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Modification time in milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<u64>,
}

impl Metadata {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            entry_type: EntryType::File,
            size: Some(size),
            mtime: None,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry_type: EntryType::Dir,
            size: None,
            mtime: None,
        }
    }

    #[must_use]
    pub fn with_mtime(mut self, mtime: Option<u64>) -> Self {
        self.mtime = mtime;
        self
    }

    pub fn is_file(&self) -> bool {
        self.entry_type == EntryType::File
    }

    pub fn is_dir(&self) -> bool {
        self.entry_type == EntryType::Dir
    }

    /// Last path segment of `name`.
    pub fn base_name(&self) -> &str {
        base_name(&self.name)
    }
}

pub(crate) fn base_name(name: &str) -> &str {
    let trimmed = name.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Options for `remove`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Remove everything beneath the path too
    pub recursive: bool,
    /// Treat missing paths as success
    pub quiet: bool,
}

impl RemoveOptions {
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            quiet: false,
        }
    }

    #[must_use]
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

/// Static description of a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    /// Driver name ("memory", "local", ...)
    pub driver: String,
    /// Canonical location (base dir, bucket, ...)
    pub canonical_name: String,
}

/// Optional behaviors a backend asks its wrappers for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    /// An empty listing may mean "this is a file": retry with `metadata`.
    pub list_try_meta_if_empty: bool,
}

/// Callback invoked once per listed entry, in listing order.
#[async_trait]
pub trait Visitor: Send {
    async fn visit(&mut self, entry: &Metadata) -> Result<(), StorageError>;
}

#[async_trait]
impl<F> Visitor for F
where
    F: FnMut(&Metadata) -> Result<(), StorageError> + Send,
{
    async fn visit(&mut self, entry: &Metadata) -> Result<(), StorageError> {
        self(entry)
    }
}

/// Minimal capability set of a storage driver.
///
/// Paths are slash-separated keys; a leading separator is not significant.
/// `NotFound` must be reported as [`StorageError::NotFound`] so wrappers can
/// tell it apart from real failures.
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    fn info(&self) -> BackendInfo;

    fn flags(&self) -> FeatureFlags {
        FeatureFlags::default()
    }

    /// Check that the backend is reachable and usable.
    async fn test_config(&self) -> Result<(), StorageError>;

    /// List entries under `path`. A visitor, when given, sees every returned
    /// entry before the call completes.
    async fn list(
        &self,
        path: &str,
        recursive: bool,
        visitor: Option<&mut dyn Visitor>,
    ) -> Result<Vec<Metadata>, StorageError>;

    async fn metadata(&self, path: &str) -> Result<Metadata, StorageError>;

    async fn read(&self, path: &str) -> Result<ByteStream, StorageError>;

    /// Write all bytes of `source` to `path`; returns the number of bytes
    /// consumed from `source`.
    async fn write(&self, path: &str, source: ByteSource) -> Result<u64, StorageError>;

    /// Remove `path`; returns the removed paths.
    async fn remove(&self, path: &str, options: RemoveOptions)
    -> Result<Vec<String>, StorageError>;

    /// Release resources held by the backend.
    async fn destroy(&self) {}
}

/// Run `visitor` over `entries`, if there is one.
pub(crate) async fn visit_all(
    visitor: Option<&mut dyn Visitor>,
    entries: &[Metadata],
) -> Result<(), StorageError> {
    if let Some(visitor) = visitor {
        for entry in entries {
            visitor.visit(entry).await?;
        }
    }
    Ok(())
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

//! Local-disk backend rooted at a base directory.
//!
//! Keys map to files below `base_dir`. Writes go to a temporary file in the
//! destination directory and are renamed into place once complete, so a
//! reader never observes a half-written object.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, trace, warn};

use super::{BackendInfo, EntryType, Metadata, RemoveOptions, StorageBackend, Visitor, visit_all};
use crate::error::{OpContext, StorageError, io_error};
use crate::path::StoragePath;
use crate::stream::{ByteSource, ByteStream};

/// Chunk size used when streaming files back.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Prefix of in-flight temporary files; hidden from listings.
const TEMP_PREFIX: &str = ".tmp_";

fn default_file_mode() -> u32 {
    0o600
}

fn default_dir_mode() -> u32 {
    0o700
}

/// Options for [`LocalBackend`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalOptions {
    /// Create the base directory if it does not exist
    #[serde(default)]
    pub create_if_not_exist: bool,
    /// Unix mode of created files
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
    /// Unix mode of created directories
    #[serde(default = "default_dir_mode")]
    pub dir_mode: u32,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            create_if_not_exist: false,
            file_mode: default_file_mode(),
            dir_mode: default_dir_mode(),
        }
    }
}

/// Backend storing keys as files below a base directory.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    base_dir: PathBuf,
    options: LocalOptions,
}

impl LocalBackend {
    pub fn new(base_dir: impl Into<PathBuf>, options: LocalOptions) -> Result<Self, StorageError> {
        let base_dir = base_dir.into();
        match std::fs::metadata(&base_dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(StorageError::config(format!(
                    "base directory {} is not a directory",
                    base_dir.display()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && options.create_if_not_exist => {
                let mut builder = std::fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                std::os::unix::fs::DirBuilderExt::mode(&mut builder, options.dir_mode);
                builder.create(&base_dir).map_err(|e| {
                    StorageError::config(format!(
                        "cannot create base directory {}: {e}",
                        base_dir.display()
                    ))
                })?;
                debug!(base_dir = %base_dir.display(), "Created base directory");
            }
            Err(e) => {
                return Err(StorageError::config(format!(
                    "base directory {} is not accessible: {e}",
                    base_dir.display()
                )));
            }
        }
        Ok(Self { base_dir, options })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn resolve(&self, path: &str) -> Result<(String, PathBuf), StorageError> {
        let key = StoragePath::new(path);
        if key.has_parent_refs() {
            return Err(StorageError::invalid_path(path, "'..' segments are not allowed"));
        }
        let full = key
            .as_relative_path()
            .to_path(&self.base_dir);
        Ok((key.as_str().to_string(), full))
    }

    async fn list_dir(&self, key: &str, dir: &Path, recursive: bool) -> Result<Vec<Metadata>, StorageError> {
        let mut entries = Vec::new();
        let mut pending = vec![(key.to_string(), dir.to_path_buf())];

        while let Some((dir_key, dir_path)) = pending.pop() {
            let mut read_dir = tokio::fs::read_dir(&dir_path)
                .await
                .map_err(|e| io_error(e, &dir_key, "list"))?;
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| io_error(e, &dir_key, "list"))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                let child_key = join_key(&dir_key, &name);
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| io_error(e, &child_key, "list"))?;
                let md = to_metadata(child_key.clone(), &meta);
                if recursive && md.is_dir() {
                    pending.push((child_key, entry.path()));
                }
                entries.push(md);
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn stat(&self, key: &str, full: &Path) -> Result<Metadata, StorageError> {
        let meta = tokio::fs::symlink_metadata(full)
            .await
            .map_err(|e| io_error(e, key, "metadata"))?;
        Ok(to_metadata(key.to_string(), &meta))
    }

    async fn write_temp(
        &self,
        key: &str,
        temp_path: &Path,
        source: ByteSource,
    ) -> Result<u64, StorageError> {
        let mut open = tokio::fs::OpenOptions::new();
        open.write(true).create_new(true);
        #[cfg(unix)]
        open.mode(self.options.file_mode);
        let mut file = open
            .open(temp_path)
            .await
            .map_err(|e| io_error(e, key, "write"))?;

        let mut input = source.into_stream();
        let mut written = 0u64;
        while let Some(chunk) = input.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| io_error(e, key, "write"))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| io_error(e, key, "write"))?;
        file.sync_all().await.map_err(|e| io_error(e, key, "write"))?;
        Ok(written)
    }
}

fn join_key(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn to_metadata(name: String, meta: &std::fs::Metadata) -> Metadata {
    let file_type = meta.file_type();
    let entry_type = if file_type.is_dir() {
        EntryType::Dir
    } else if file_type.is_file() {
        EntryType::File
    } else if file_type.is_symlink() {
        EntryType::Link
    } else {
        EntryType::Special
    };
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
    Metadata {
        name,
        entry_type,
        size: (entry_type == EntryType::File).then_some(meta.len()),
        mtime,
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            driver: "local".to_string(),
            canonical_name: self.base_dir.display().to_string(),
        }
    }

    async fn test_config(&self) -> Result<(), StorageError> {
        let meta = tokio::fs::metadata(&self.base_dir).await.map_err(|e| {
            StorageError::config(format!("base directory {} unusable: {e}", self.base_dir.display()))
        })?;
        if !meta.is_dir() {
            return Err(StorageError::config(format!(
                "base directory {} is not a directory",
                self.base_dir.display()
            )));
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self, visitor))]
    async fn list(
        &self,
        path: &str,
        recursive: bool,
        visitor: Option<&mut dyn Visitor>,
    ) -> Result<Vec<Metadata>, StorageError> {
        let (key, full) = self.resolve(path)?;
        let entries = match self.list_dir(&key, &full, recursive).await {
            Ok(entries) => entries,
            Err(err) if err.is_not_found() && !key.is_empty() => {
                // Not a directory: list the parent and keep the exact match
                let meta = self.stat(&key, &full).await?;
                if meta.is_dir() {
                    return Err(err);
                }
                vec![meta]
            }
            Err(err) => return Err(err),
        };
        trace!(count = entries.len(), "Listed local directory");
        visit_all(visitor, &entries).await?;
        Ok(entries)
    }

    async fn metadata(&self, path: &str) -> Result<Metadata, StorageError> {
        let (key, full) = self.resolve(path)?;
        let meta = self.stat(&key, &full).await?;
        if meta.is_dir() && !key.is_empty() {
            // An empty directory is indistinguishable from a missing one on
            // object stores; report it the same way
            let mut read_dir = tokio::fs::read_dir(&full)
                .await
                .map_err(|e| io_error(e, &key, "metadata"))?;
            let first = read_dir
                .next_entry()
                .await
                .map_err(|e| io_error(e, &key, "metadata"))?;
            if first.is_none() {
                return Err(StorageError::not_found(key));
            }
        }
        Ok(meta)
    }

    async fn read(&self, path: &str) -> Result<ByteStream, StorageError> {
        let (key, full) = self.resolve(path)?;
        let meta = self.stat(&key, &full).await?;
        if meta.is_dir() {
            return Err(StorageError::backend(
                "is a directory",
                OpContext::for_operation("read").with_storage_key(key),
            ));
        }
        let file = tokio::fs::File::open(&full)
            .await
            .map_err(|e| io_error(e, &key, "read"))?;

        let chunks = stream::unfold(Some((file, key)), |state| async move {
            let (mut file, key) = state?;
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(Bytes::from(buf)), Some((file, key))))
                }
                Err(e) => Some((Err(io_error(e, &key, "read")), None)),
            }
        });
        Ok(chunks.boxed())
    }

    #[instrument(level = "debug", skip(self, source))]
    async fn write(&self, path: &str, source: ByteSource) -> Result<u64, StorageError> {
        let (key, full) = self.resolve(path)?;
        if key.is_empty() {
            return Err(StorageError::invalid_path(path, "cannot write to the base directory"));
        }
        let parent = full.parent().unwrap_or(&self.base_dir).to_path_buf();

        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(self.options.dir_mode);
        builder
            .create(&parent)
            .await
            .map_err(|e| io_error(e, &key, "write"))?;

        let mut suffix = [0u8; 8];
        rand::rng().fill_bytes(&mut suffix);
        let temp_path = parent.join(format!("{TEMP_PREFIX}{}", hex::encode(suffix)));

        match self.write_temp(&key, &temp_path, source).await {
            Ok(written) => {
                tokio::fs::rename(&temp_path, &full)
                    .await
                    .map_err(|e| io_error(e, &key, "write"))?;
                trace!(key, written, "File written and renamed");
                Ok(written)
            }
            Err(err) => {
                if let Err(e) = tokio::fs::remove_file(&temp_path).await {
                    warn!(temp_path = %temp_path.display(), error = %e, "Failed to clean up temp file");
                }
                Err(err)
            }
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn remove(
        &self,
        path: &str,
        options: RemoveOptions,
    ) -> Result<Vec<String>, StorageError> {
        let (key, full) = self.resolve(path)?;
        if key.is_empty() {
            return Err(StorageError::invalid_path(path, "refusing to remove the base directory"));
        }

        let meta = match self.stat(&key, &full).await {
            Ok(meta) => meta,
            Err(err) if err.is_not_found() && options.quiet => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut removed = Vec::new();
        if meta.is_dir() {
            if options.recursive {
                removed.extend(
                    self.list_dir(&key, &full, true)
                        .await?
                        .into_iter()
                        .filter(Metadata::is_file)
                        .map(|m| m.name),
                );
                tokio::fs::remove_dir_all(&full)
                    .await
                    .map_err(|e| io_error(e, &key, "remove"))?;
            } else {
                tokio::fs::remove_dir(&full)
                    .await
                    .map_err(|e| io_error(e, &key, "remove"))?;
            }
        } else {
            tokio::fs::remove_file(&full)
                .await
                .map_err(|e| io_error(e, &key, "remove"))?;
        }
        removed.push(key);
        Ok(removed)
    }
}

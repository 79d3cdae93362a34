//! Rich client: a backend composed with caching and utility operations.
//!
//! [`connect`] checks a backend, optionally stacks the encryption overlay on
//! top of it, and wraps the result in a [`StorageClient`]. The client adds
//! what every caller would otherwise re-implement: cached listings and
//! metadata, "safe" variants that turn `NotFound` into empty results, whole
//! file reads and writes, copying between clients and mirroring trees.
//!
//! Mutating operations flush the client's cache so later reads see them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use futures::StreamExt;
use ring::digest;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendInfo, FeatureFlags, Metadata, RemoveOptions, StorageBackend, Visitor, visit_all};
use crate::cache::{Cache, CacheConfig, CacheScope, CacheValue};
use crate::error::{OpContext, StorageError};
use crate::overlay::{EncryptedClient, EncryptionConfig};
use crate::path::StoragePath;
use crate::stream::{ByteSource, ByteStream, collect_stream};

/// Files below this size are kept in the `read_file` cache scope.
pub const READ_FILE_CACHE_LIMIT: usize = 128 * 1024;

/// How [`connect`] builds a client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectOptions {
    /// Stack the encryption overlay with these settings
    #[serde(default)]
    pub encryption: Option<EncryptionConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Reject every mutating operation
    #[serde(default)]
    pub read_only: bool,
}

impl ConnectOptions {
    #[must_use]
    pub fn with_encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.encryption = Some(encryption);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Outcome of [`StorageClient::mirror`].
#[derive(Debug, Default)]
pub struct MirrorResults {
    /// Destination paths that were copied
    pub success: Vec<String>,
    /// Destination paths that failed, with the reason
    pub errors: Vec<(String, StorageError)>,
}

/// Check `backend` and build a client around it.
#[instrument(level = "debug", skip(backend, options), fields(driver = %backend.info().driver))]
pub async fn connect(
    backend: Arc<dyn StorageBackend>,
    options: ConnectOptions,
) -> Result<StorageClient, StorageError> {
    backend
        .test_config()
        .await
        .map_err(|e| StorageError::config(format!("backend check failed: {e}")))?;

    let raw_info = backend.info();
    let flags = backend.flags();
    let cache = options.cache.build();

    let (backend, fingerprint): (Arc<dyn StorageBackend>, Option<String>) = match &options.encryption {
        Some(encryption) => {
            let fingerprint = encryption.derive_key()?.fingerprint();
            let overlay = EncryptedClient::new(backend, encryption, Arc::clone(&cache))?;
            (Arc::new(overlay), Some(fingerprint))
        }
        None => (backend, None),
    };

    let id = client_id(&raw_info, &options, fingerprint.as_deref());
    debug!(%id, encrypted = fingerprint.is_some(), read_only = options.read_only, "Connected");
    Ok(StorageClient {
        id,
        backend,
        cache,
        flags,
        read_only: options.read_only,
    })
}

/// `"<driver>_" + sha256(canonical name, layout options, key fingerprint)`.
fn client_id(info: &BackendInfo, options: &ConnectOptions, fingerprint: Option<&str>) -> String {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(info.canonical_name.as_bytes());
    if let Some(encryption) = &options.encryption {
        ctx.update(b"\0");
        ctx.update(encryption.algo.as_str().as_bytes());
        ctx.update(&encryption.dir_levels.to_le_bytes());
    }
    if let Some(fingerprint) = fingerprint {
        ctx.update(b"\0");
        ctx.update(fingerprint.as_bytes());
    }
    ctx.update(&[u8::from(options.read_only)]);
    format!("{}_{}", info.driver, hex::encode(&ctx.finish().as_ref()[..8]))
}

/// A backend (possibly encrypted) plus cache and utility operations.
pub struct StorageClient {
    id: String,
    backend: Arc<dyn StorageBackend>,
    cache: Arc<dyn Cache>,
    flags: FeatureFlags,
    read_only: bool,
}

impl StorageClient {
    /// Stable identity derived from the backend location and options.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> BackendInfo {
        self.backend.info()
    }

    /// The backend this client talks to (the overlay when encrypted).
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn check_writable(&self, operation: &'static str) -> Result<(), StorageError> {
        if self.read_only {
            return Err(StorageError::ReadOnly { operation });
        }
        Ok(())
    }

    /// List `path`, serving repeated calls from the cache.
    ///
    /// On a cache miss the visitor sees each entry as the backend produces
    /// it, so a listing that fails part way has already visited some.
    pub async fn list(
        &self,
        path: &str,
        recursive: bool,
        mut visitor: Option<&mut dyn Visitor>,
    ) -> Result<Vec<Metadata>, StorageError> {
        let path = StoragePath::new(path);
        let cache = self.cache.scoped(CacheScope::List);
        let cache_key = format!("{} ~ {recursive}", path.as_str());

        match cache.get(&cache_key).await {
            Some(CacheValue::Listing(entries)) => {
                visit_all(visitor, &entries).await?;
                return Ok(entries);
            }
            Some(CacheValue::NotFound) => return Err(StorageError::not_found(path.as_str())),
            _ => {}
        }

        let listed = self
            .backend
            .list(
                path.as_str(),
                recursive,
                visitor.as_mut().map(|v| &mut **v as &mut dyn Visitor),
            )
            .await;
        let mut entries = match listed {
            Ok(entries) => entries,
            Err(e) if e.is_not_found_at(path.as_str()) => {
                cache.set(&cache_key, CacheValue::NotFound).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if entries.is_empty() && self.flags.list_try_meta_if_empty && !path.is_root() {
            match self.backend.metadata(path.as_str()).await {
                Ok(metadata) => {
                    if let Some(visitor) = visitor.as_deref_mut() {
                        visitor.visit(&metadata).await?;
                    }
                    entries.push(metadata);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        cache.set(&cache_key, CacheValue::Listing(entries.clone())).await;
        Ok(entries)
    }

    /// Like [`list`](Self::list), with `NotFound` as an empty listing.
    pub async fn safe_list(&self, path: &str, recursive: bool) -> Result<Vec<Metadata>, StorageError> {
        match self.list(path, recursive, None).await {
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            other => other,
        }
    }

    pub async fn metadata(&self, path: &str) -> Result<Metadata, StorageError> {
        let path = StoragePath::new(path);
        let cache = self.cache.scoped(CacheScope::Metadata);
        if let Some(CacheValue::Metadata(metadata)) = cache.get(path.as_str()).await {
            return Ok(metadata);
        }
        let metadata = self.backend.metadata(path.as_str()).await?;
        cache.set(path.as_str(), CacheValue::Metadata(metadata.clone())).await;
        Ok(metadata)
    }

    /// Like [`metadata`](Self::metadata), with `NotFound` as `None`.
    pub async fn safe_metadata(&self, path: &str) -> Result<Option<Metadata>, StorageError> {
        match self.metadata(path).await {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn read(&self, path: &str) -> Result<ByteStream, StorageError> {
        self.backend.read(path).await
    }

    /// Stream `path` into `on_chunk`; returns the number of bytes read.
    pub async fn read_stream<F>(&self, path: &str, mut on_chunk: F) -> Result<u64, StorageError>
    where
        F: FnMut(Bytes) -> Result<(), StorageError> + Send,
    {
        let mut stream = self.backend.read(path).await?;
        let mut total = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total += chunk.len() as u64;
            on_chunk(chunk)?;
        }
        Ok(total)
    }

    /// Whole contents of `path`; small files are cached.
    pub async fn read_file(&self, path: &str) -> Result<Bytes, StorageError> {
        let path = StoragePath::new(path);
        let cache = self.cache.scoped(CacheScope::ReadFile);
        if let Some(CacheValue::Bytes(data)) = cache.get(path.as_str()).await {
            return Ok(data);
        }
        let data = collect_stream(self.backend.read(path.as_str()).await?).await?;
        if data.len() < READ_FILE_CACHE_LIMIT {
            cache.set(path.as_str(), CacheValue::Bytes(data.clone())).await;
        }
        Ok(data)
    }

    /// Like [`read_file`](Self::read_file), with any failure as empty contents.
    pub async fn safe_read_file(&self, path: &str) -> Bytes {
        match self.read_file(path).await {
            Ok(data) => data,
            Err(e) => {
                info!(path, error = %e, "Read failed, returning empty contents");
                Bytes::new()
            }
        }
    }

    pub async fn write(&self, path: &str, source: ByteSource) -> Result<u64, StorageError> {
        self.check_writable("write")?;
        let path = path.strip_prefix('/').unwrap_or(path);
        let written = self.backend.write(path, source).await?;
        self.cache.flush().await;
        Ok(written)
    }

    pub async fn write_file(&self, path: &str, data: impl Into<Bytes>) -> Result<u64, StorageError> {
        self.check_writable("write_file")?;
        self.write(path, ByteSource::from_bytes(data)).await
    }

    pub async fn remove(
        &self,
        path: &str,
        options: RemoveOptions,
    ) -> Result<Vec<String>, StorageError> {
        self.check_writable("remove")?;
        let removed = self.backend.remove(path, options).await?;
        self.cache.flush().await;
        Ok(removed)
    }

    /// Copy `from` to `to` within this client.
    pub async fn copy_file(&self, from: &str, to: &str) -> Result<u64, StorageError> {
        self.copy_from(self, from, to).await
    }

    /// Stream `from` of `source` into `to` of this client.
    ///
    /// Fails with [`StorageError::Consistency`] if the number of bytes
    /// written differs from the number read.
    #[instrument(level = "debug", skip(self, source), fields(source = %source.id))]
    pub async fn copy_from(
        &self,
        source: &StorageClient,
        from: &str,
        to: &str,
    ) -> Result<u64, StorageError> {
        self.check_writable("copy_file")?;
        let read = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&read);
        let stream = source.read(from).await?.inspect(move |chunk| {
            if let Ok(chunk) = chunk {
                counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
        });

        let written = self.write(to, ByteSource::from_stream(stream)).await?;
        let read = read.load(Ordering::Relaxed);
        if read != written {
            return Err(StorageError::consistency(
                format!("copied {written} of {read} bytes"),
                OpContext::for_operation("copy_file").with_path(to),
            ));
        }
        Ok(written)
    }

    /// Copy every file below `source_dir` of `source` to the same relative
    /// path below `target_dir`, skipping files whose size already matches.
    ///
    /// Per-file failures are collected; only a failure to list the source
    /// fails the whole call.
    #[instrument(level = "debug", skip(self, source), fields(source = %source.id))]
    pub async fn mirror(
        &self,
        source: &StorageClient,
        source_dir: &str,
        target_dir: &str,
    ) -> Result<MirrorResults, StorageError> {
        self.check_writable("mirror")?;
        let source_dir = StoragePath::new(source_dir);
        let target_dir = StoragePath::new(target_dir);

        let mut files: Vec<Metadata> = source
            .list(source_dir.as_str(), true, None)
            .await?
            .into_iter()
            .filter(Metadata::is_file)
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        let mut results = MirrorResults::default();
        for file in files {
            let relative = file
                .name
                .strip_prefix(source_dir.as_str())
                .unwrap_or(&file.name)
                .trim_start_matches('/');
            let target = target_dir.join(relative);

            match self.safe_metadata(target.as_str()).await {
                Ok(Some(existing)) if existing.size == file.size => {
                    debug!(path = %target, "Sizes match, skipping");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %target, error = %e, "Mirror target check failed");
                    results.errors.push((target.as_str().to_string(), e));
                    continue;
                }
            }

            match self.copy_from(source, &file.name, target.as_str()).await {
                Ok(_) => results.success.push(target.as_str().to_string()),
                Err(e) => {
                    warn!(path = %target, error = %e, "Mirror copy failed");
                    results.errors.push((target.as_str().to_string(), e));
                }
            }
        }
        debug!(
            copied = results.success.len(),
            failed = results.errors.len(),
            "Mirror complete"
        );
        Ok(results)
    }

    /// Drop every cached value.
    pub async fn flush(&self) {
        self.cache.flush().await;
    }

    /// Release the backend (stopping metadata workers) and the cache.
    pub async fn destroy(&self) {
        self.backend.destroy().await;
        self.cache.flush().await;
        debug!(id = %self.id, "Client destroyed");
    }
}

impl fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageClient")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

//! The encrypted virtual filesystem.
//!
//! [`EncryptedClient`] wraps any [`StorageBackend`] and implements the same
//! trait on top of it: callers see a hierarchical filesystem of cleartext
//! paths, the wrapped backend only ever sees hashed keys and ciphertext.
//!
//! Each logical file `F` is stored as three artifacts:
//!
//! - its content object at `encrypt_path(F)`;
//! - its meta sidecar (`{"name", "size", "type"}`) at `meta_path(F)`;
//! - one dirent file in the dirent directory of its parent.
//!
//! Writes and removals touch these one after the other without any rollback.
//! An interrupted write can leave a subset of them behind; listings skip
//! dirent entries whose path no longer resolves.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, trace};

use super::codec::PathCodec;
use super::config::{EncryptionConfig, FanOutPolicy};
use super::core::{MetaSidecar, OverlayCore};
use super::scheduler::{MetaScheduler, SchedulerStatsSnapshot};
use crate::backend::{
    BackendInfo, EntryType, Metadata, RemoveOptions, StorageBackend, Visitor, visit_all,
};
use crate::cache::{Cache, CacheScope, CacheValue, DisabledCache};
use crate::crypto::ContentCipher;
use crate::error::{OpContext, StorageError};
use crate::path::StoragePath;
use crate::stream::{ByteSource, ByteStream};

/// Hierarchical encrypted filesystem over a flat backend.
pub struct EncryptedClient {
    core: Arc<OverlayCore>,
    meta_workers: usize,
    meta_timeout: Duration,
    policy: FanOutPolicy,
    scheduler: OnceCell<MetaScheduler>,
    destroyed: AtomicBool,
}

impl EncryptedClient {
    /// Wrap `backend`. Fails with [`StorageError::Config`] on invalid
    /// settings.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        config: &EncryptionConfig,
        cache: Arc<dyn Cache>,
    ) -> Result<Self, StorageError> {
        let key = config.derive_key()?;
        let codec = PathCodec::new(&key, config.dir_levels);
        debug!(
            inner = %backend.info().driver,
            algo = %key.algorithm(),
            dir_levels = config.dir_levels,
            meta_workers = config.meta_workers,
            "Encrypted client created"
        );
        Ok(Self {
            core: Arc::new(OverlayCore {
                backend,
                codec,
                cipher: ContentCipher::new(key),
                cache,
            }),
            meta_workers: config.meta_workers,
            meta_timeout: config.meta_timeout,
            policy: config.fan_out_policy,
            scheduler: OnceCell::new(),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Wrap `backend` without any caching.
    pub fn uncached(
        backend: Arc<dyn StorageBackend>,
        config: &EncryptionConfig,
    ) -> Result<Self, StorageError> {
        Self::new(backend, config, Arc::new(DisabledCache))
    }

    pub(crate) fn core(&self) -> &OverlayCore {
        &self.core
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &Arc<dyn StorageBackend> {
        &self.core.backend
    }

    pub fn codec(&self) -> &PathCodec {
        &self.core.codec
    }

    pub fn fan_out_policy(&self) -> FanOutPolicy {
        self.policy
    }

    /// Worker pool, started on first use.
    pub(crate) async fn scheduler(&self) -> Result<&MetaScheduler, StorageError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(StorageError::SchedulerClosed);
        }
        Ok(self
            .scheduler
            .get_or_init(|| async {
                MetaScheduler::start(Arc::clone(&self.core), self.meta_workers, self.meta_timeout)
            })
            .await)
    }

    /// Counters of the metadata workers; all zero before the first listing.
    pub fn scheduler_stats(&self) -> SchedulerStatsSnapshot {
        self.scheduler
            .get()
            .map(|s| s.stats().snapshot())
            .unwrap_or_default()
    }

    /// Children of `path`, with the parent fallback for files.
    async fn list_entries(&self, path: &StoragePath) -> Result<Vec<Metadata>, StorageError> {
        match self.list_children(path, self.policy).await {
            Ok(children) => Ok(children),
            Err(e) if e.is_not_found() && path.is_root() => {
                trace!("Root has no entries yet");
                Ok(Vec::new())
            }
            Err(e) if e.is_not_found() => {
                trace!(path = %path, "No dirent directory, trying parent fallback");
                self.list_single(path, self.policy).await
            }
            Err(e) => Err(e),
        }
    }

    /// Breadth-first walk below `path`, visiting every entry once as it is
    /// discovered.
    ///
    /// A sub-directory that disappears during the walk fails the listing with
    /// `NotFound` for that sub-directory.
    async fn list_tree(
        &self,
        path: &StoragePath,
        mut visitor: Option<&mut dyn Visitor>,
    ) -> Result<Vec<Metadata>, StorageError> {
        let mut results = Vec::new();
        let mut seen = HashSet::new();
        let mut pending = VecDeque::from([path.clone()]);
        let mut first = true;

        while let Some(dir) = pending.pop_front() {
            let entries = if first {
                first = false;
                self.list_entries(&dir).await?
            } else {
                self.list_children(&dir, self.policy).await.inspect_err(|e| {
                    if e.is_not_found() {
                        debug!(dir = %dir, "Directory vanished during traversal");
                    }
                })?
            };

            for entry in entries {
                if !seen.insert(entry.name.clone()) {
                    continue;
                }
                if let Some(visitor) = visitor.as_deref_mut() {
                    visitor.visit(&entry).await?;
                }
                if entry.is_dir() && entry.name != dir.as_str() {
                    pending.push_back(StoragePath::new(&entry.name));
                }
                results.push(entry);
            }
        }
        Ok(results)
    }

    /// Post-order removal of everything below `dir`, re-listing each
    /// directory right before emptying it.
    ///
    /// Entries that no longer resolve are dropped with their dirent
    /// directory. A sub-directory that vanished before it was re-listed is
    /// `NotFound` unless `quiet`.
    async fn remove_tree(
        &self,
        dir: &StoragePath,
        quiet: bool,
    ) -> Result<Vec<String>, StorageError> {
        let core = self.core();
        let mut removed = Vec::new();
        let mut stack = vec![(dir.clone(), false)];

        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                if current.is_root() {
                    continue;
                }
                let dirent_key = core.codec.dirent_dir(current.as_str());
                // Also clears entries that no longer resolved to anything
                core.backend
                    .remove(&dirent_key, RemoveOptions::recursive().quiet())
                    .await
                    .map_err(|e| {
                        e.with_context(
                            OpContext::for_operation("remove")
                                .with_path(current.as_str())
                                .with_step("dirent directory"),
                        )
                    })?;
                if core.remove_leaf(&current).await? {
                    removed.push(current.as_str().to_string());
                }
                continue;
            }

            stack.push((current.clone(), true));
            let children = match self.list_children(&current, FanOutPolicy::SkipFailed).await {
                Ok(children) => children,
                Err(e) if e.is_not_found() && (quiet || current.is_root()) => {
                    trace!(dir = %current, "No dirent directory left to empty");
                    Vec::new()
                }
                Err(e) => return Err(e),
            };
            for child in children {
                let child_path = StoragePath::new(&child.name);
                if child.is_dir() {
                    stack.push((child_path, false));
                } else if core.remove_leaf(&child_path).await? {
                    removed.push(child_path.as_str().to_string());
                } else if !quiet {
                    return Err(StorageError::not_found(child_path.as_str()));
                }
            }
        }
        Ok(removed)
    }

    /// Remove a single file (or empty directory) and cascade upward.
    async fn remove_child(
        &self,
        path: &StoragePath,
        quiet: bool,
    ) -> Result<Vec<String>, StorageError> {
        if self.core.has_dirent_entries(path).await? {
            return Err(StorageError::invalid_path(
                path.as_str(),
                "directory is not empty, remove it recursively",
            ));
        }
        if !self.core.remove_leaf(path).await? {
            if quiet {
                debug!(path = %path, "Nothing to remove");
                return Ok(Vec::new());
            }
            return Err(StorageError::not_found(path.as_str()));
        }
        // A leftover, empty dirent directory of an emptied directory
        let dirent_key = self.core.codec.dirent_dir(path.as_str());
        self.core
            .backend
            .remove(&dirent_key, RemoveOptions::recursive().quiet())
            .await?;

        if let Some(parent) = path.parent() {
            self.cascade_remove_empty(parent).await?;
        }
        Ok(vec![path.as_str().to_string()])
    }

    /// Stop the metadata workers. Later listings fail with
    /// [`StorageError::SchedulerClosed`].
    pub fn shutdown(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel)
            && let Some(scheduler) = self.scheduler.get()
        {
            scheduler.shutdown();
        }
    }
}

impl std::fmt::Debug for EncryptedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedClient")
            .field("inner", &self.core.backend)
            .field("codec", &self.core.codec)
            .field("meta_workers", &self.meta_workers)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn list_cache_key(path: &StoragePath, recursive: bool) -> String {
    format!("{} ~ {recursive}", path.as_str())
}

#[async_trait]
impl StorageBackend for EncryptedClient {
    fn info(&self) -> BackendInfo {
        let inner = self.core.backend.info();
        BackendInfo {
            driver: format!("encrypted({})", inner.driver),
            canonical_name: inner.canonical_name,
        }
    }

    async fn test_config(&self) -> Result<(), StorageError> {
        self.core.backend.test_config().await
    }

    #[instrument(level = "debug", skip(self, visitor))]
    async fn list(
        &self,
        path: &str,
        recursive: bool,
        visitor: Option<&mut dyn Visitor>,
    ) -> Result<Vec<Metadata>, StorageError> {
        let path = StoragePath::new(path);
        let cache = self.core.cache.scoped(CacheScope::EncList);
        let cache_key = list_cache_key(&path, recursive);

        match cache.get(&cache_key).await {
            Some(CacheValue::Listing(entries)) => {
                trace!("Listing cache hit");
                visit_all(visitor, &entries).await?;
                return Ok(entries);
            }
            Some(CacheValue::NotFound) => return Err(StorageError::not_found(path.as_str())),
            _ => {}
        }

        let listed = if recursive {
            self.list_tree(&path, visitor).await
        } else {
            match self.list_entries(&path).await {
                Ok(entries) => visit_all(visitor, &entries).await.map(|()| entries),
                Err(e) => Err(e),
            }
        };

        match listed {
            Ok(entries) => {
                debug!(count = entries.len(), "Listed");
                cache.set(&cache_key, CacheValue::Listing(entries.clone())).await;
                Ok(entries)
            }
            Err(e) if e.is_not_found_at(path.as_str()) => {
                cache.set(&cache_key, CacheValue::NotFound).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn metadata(&self, path: &str) -> Result<Metadata, StorageError> {
        let path = StoragePath::new(path);
        self.core.metadata(&path).await
    }

    #[instrument(level = "debug", skip(self))]
    async fn read(&self, path: &str) -> Result<ByteStream, StorageError> {
        let path = StoragePath::new(path);
        let content_key = self.core.codec.encrypt_path(path.as_str());
        let context = OpContext::for_operation("read")
            .with_path(path.as_str())
            .with_storage_key(&content_key);
        let ciphertext = self.core.backend.read(&content_key).await.map_err(|e| {
            if e.is_not_found() {
                StorageError::not_found(path.as_str())
            } else {
                e.with_context(context.clone())
            }
        })?;
        Ok(self.core.cipher.decrypt_stream(ciphertext, context))
    }

    #[instrument(level = "debug", skip(self, source))]
    async fn write(&self, path: &str, source: ByteSource) -> Result<u64, StorageError> {
        let path = StoragePath::new(path);
        if path.is_root() {
            return Err(StorageError::invalid_path(path.as_str(), "cannot write to the root"));
        }
        if path.has_parent_refs() {
            return Err(StorageError::invalid_path(path.as_str(), "'..' segments are not allowed"));
        }
        let core = self.core();

        core.record_child(&path).await?;

        let content_key = core.codec.encrypt_path(path.as_str());
        let context = OpContext::for_operation("write").with_path(path.as_str());
        let plaintext_bytes = Arc::new(AtomicU64::new(0));
        let ciphertext = core
            .cipher
            .encrypt_source(source, Arc::clone(&plaintext_bytes))
            .map_err(|e| StorageError::cipher(e, context.clone()))?;
        core.backend
            .write(&content_key, ciphertext)
            .await
            .map_err(|e| e.with_context(context.clone().with_storage_key(&content_key).with_step("content")))?;
        let size = plaintext_bytes.load(Ordering::Acquire);

        let sidecar = MetaSidecar {
            name: path.as_str().to_string(),
            size,
            entry_type: EntryType::File,
        };
        let sidecar_json = serde_json::to_vec(&sidecar).map_err(|e| {
            StorageError::backend_with_source(
                "failed to encode meta sidecar",
                context.clone().with_step("meta sidecar"),
                e,
            )
        })?;
        core.write_sealed(
            &core.codec.meta_path(path.as_str()),
            &sidecar_json,
            context.with_step("meta sidecar"),
        )
        .await?;

        core.cache
            .scoped(CacheScope::Metadata)
            .invalidate(path.as_str())
            .await;
        debug!(size, "Wrote file");
        Ok(size)
    }

    #[instrument(level = "debug", skip(self))]
    async fn remove(
        &self,
        path: &str,
        options: RemoveOptions,
    ) -> Result<Vec<String>, StorageError> {
        let path = StoragePath::new(path);
        if !options.recursive {
            if path.is_root() {
                return Err(StorageError::invalid_path("/", "cannot remove the root"));
            }
            return self.remove_child(&path, options.quiet).await;
        }

        let is_dir = path.is_root() || self.core.has_dirent_entries(&path).await?;
        if !is_dir {
            return self.remove_child(&path, options.quiet).await;
        }

        let removed = self.remove_tree(&path, options.quiet).await?;
        if let Some(parent) = path.parent() {
            self.cascade_remove_empty(parent).await?;
        }
        debug!(count = removed.len(), "Removed tree");
        Ok(removed)
    }

    async fn destroy(&self) {
        self.shutdown();
        self.core.backend.destroy().await;
    }
}

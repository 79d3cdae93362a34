//! Directory index (dirent) management.
//!
//! A flat backend has no directories, so the overlay keeps one *dirent
//! directory* per logical directory. It holds one encrypted *dirent file* per
//! child, whose plaintext is the child's full logical path plus random
//! padding. Listing a directory means listing its dirent directory and
//! decrypting every entry (see [`super::scheduler`]).
//!
//! Dirent files are written for every ancestor on each write and removed
//! bottom-up: once a dirent directory has no entries left, its directory is
//! removed from its own parent, up to (never including) the root.

use futures::future::try_join_all;
use tracing::{debug, trace, warn};

use super::client::EncryptedClient;
use super::config::FanOutPolicy;
use super::core::{OverlayCore, encode_dirent};
use crate::backend::{Metadata, RemoveOptions};
use crate::cache::CacheScope;
use crate::error::{OpContext, StorageError};
use crate::path::StoragePath;

impl OverlayCore {
    /// Record `path` and each of its ancestors in their parents' dirent
    /// directories.
    ///
    /// Entries are written concurrently. A failure leaves the entries already
    /// written in place.
    pub(crate) async fn record_child(&self, path: &StoragePath) -> Result<(), StorageError> {
        let targets: Vec<StoragePath> = std::iter::once(path.clone())
            .chain(path.ancestors())
            .filter(|p| !p.is_root())
            .collect();

        try_join_all(targets.iter().map(|target| async move {
            let Some(entry_key) = self.codec.dirent_entry(target) else {
                return Ok(());
            };
            trace!(path = %target, "Recording dirent entry");
            self.write_sealed(
                &entry_key,
                encode_dirent(target).as_bytes(),
                OpContext::for_operation("write")
                    .with_path(target.as_str())
                    .with_step("dirent entry"),
            )
            .await
        }))
        .await?;
        Ok(())
    }

    /// Remove the three artifacts of one leaf: its dirent entry, its content
    /// object and its meta sidecar.
    ///
    /// Returns `false` if none of them existed.
    pub(crate) async fn remove_leaf(&self, path: &StoragePath) -> Result<bool, StorageError> {
        let mut removed = false;
        if let Some(entry_key) = self.codec.dirent_entry(path) {
            removed |= self.remove_artifact(path, &entry_key, "dirent entry").await?;
        }
        let content_key = self.codec.encrypt_path(path.as_str());
        removed |= self.remove_artifact(path, &content_key, "content").await?;
        let meta_key = self.codec.meta_path(path.as_str());
        removed |= self.remove_artifact(path, &meta_key, "meta sidecar").await?;

        self.cache
            .scoped(CacheScope::Metadata)
            .invalidate(path.as_str())
            .await;
        Ok(removed)
    }

    async fn remove_artifact(
        &self,
        path: &StoragePath,
        key: &str,
        step: &'static str,
    ) -> Result<bool, StorageError> {
        match self.backend.remove(key, RemoveOptions::default()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.with_context(
                OpContext::for_operation("remove")
                    .with_path(path.as_str())
                    .with_storage_key(key)
                    .with_step(step),
            )),
        }
    }

    /// `true` if the dirent directory of `dir` holds at least one entry.
    pub(crate) async fn has_dirent_entries(&self, dir: &StoragePath) -> Result<bool, StorageError> {
        let dirent_key = self.codec.dirent_dir(dir.as_str());
        match self.backend.list(&dirent_key, false, None).await {
            Ok(entries) => Ok(entries.iter().any(Metadata::is_file)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.with_context(OpContext::for_operation("remove").with_path(dir.as_str()))),
        }
    }
}

impl EncryptedClient {
    /// Resolve the children of `dir` through the metadata workers.
    ///
    /// Fails with `NotFound` if `dir` has no dirent directory. An entry whose
    /// dirent file vanished after the listing is skipped. Every other failure,
    /// including an entry naming a path that no longer exists, is handled
    /// according to `policy`. The result is sorted by name.
    pub(crate) async fn list_children(
        &self,
        dir: &StoragePath,
        policy: FanOutPolicy,
    ) -> Result<Vec<Metadata>, StorageError> {
        let core = self.core();
        let dirent_key = core.codec.dirent_dir(dir.as_str());
        let raw = core
            .backend
            .list(&dirent_key, false, None)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    StorageError::not_found(dir.as_str())
                } else {
                    e.with_context(
                        OpContext::for_operation("list")
                            .with_path(dir.as_str())
                            .with_storage_key(&dirent_key),
                    )
                }
            })?;

        let entry_names: Vec<String> = raw
            .iter()
            .filter(|m| m.is_file())
            .map(|m| m.base_name().to_string())
            .collect();
        if entry_names.is_empty() {
            return Ok(Vec::new());
        }

        let outcomes = self.scheduler().await?.resolve(&dirent_key, entry_names).await?;

        let mut children = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome.result {
                Ok(Some(metadata)) => children.push(metadata),
                Ok(None) => {
                    debug!(
                        dir = %dir,
                        job_id = outcome.job_id,
                        entry = %outcome.entry_name,
                        "Dirent entry removed during listing"
                    );
                }
                Err(e) => match policy {
                    FanOutPolicy::FailFast => return Err(e),
                    FanOutPolicy::SkipFailed => {
                        warn!(
                            dir = %dir,
                            job_id = outcome.job_id,
                            entry = %outcome.entry_name,
                            error = %e,
                            "Skipping unresolvable entry"
                        );
                    }
                },
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    /// Remove emptied directories from `start` upward, stopping at the root
    /// or at the first directory that still has entries.
    pub(crate) async fn cascade_remove_empty(&self, start: StoragePath) -> Result<(), StorageError> {
        let core = self.core();
        let mut current = start;
        while !current.is_root() {
            if core.has_dirent_entries(&current).await? {
                trace!(dir = %current, "Directory still has entries, cascade stops");
                break;
            }
            let dirent_key = core.codec.dirent_dir(current.as_str());
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
            core.remove_leaf(&current).await?;
            debug!(dir = %current, "Removed empty directory");

            let Some(parent) = current.parent() else {
                break;
            };
            current = parent;
        }
        Ok(())
    }

    /// Parent fallback: `path` has no dirent directory, so it may name a file.
    /// Look for it among its parent's children.
    pub(crate) async fn list_single(
        &self,
        path: &StoragePath,
        policy: FanOutPolicy,
    ) -> Result<Vec<Metadata>, StorageError> {
        let Some(parent) = path.parent() else {
            return Err(StorageError::not_found(path.as_str()));
        };
        let siblings = match self.list_children(&parent, policy).await {
            Ok(siblings) => siblings,
            Err(e) if e.is_not_found() => return Err(StorageError::not_found(path.as_str())),
            Err(e) => return Err(e),
        };
        let matches: Vec<Metadata> = siblings
            .into_iter()
            .filter(|m| m.name == path.as_str())
            .collect();
        match matches.len() {
            0 => Err(StorageError::not_found(path.as_str())),
            1 => Ok(matches),
            n => Err(StorageError::consistency(
                format!("{n} entries match a single path"),
                OpContext::for_operation("list").with_path(path.as_str()),
            )),
        }
    }
}

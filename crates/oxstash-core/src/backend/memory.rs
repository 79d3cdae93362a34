//! In-memory object store.
//!
//! Behaves like a flat object store (S3-style): keys are opaque strings,
//! "directories" only exist as prefixes of stored keys, and a non-recursive
//! listing synthesizes one directory entry per distinct next segment.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};

use super::{
    BackendInfo, FeatureFlags, Metadata, RemoveOptions, StorageBackend, Visitor, now_millis,
    visit_all,
};
use crate::error::{OpContext, StorageError};
use crate::stream::{ByteSource, ByteStream, chunked};

/// Chunk size used when streaming stored objects back.
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    mtime: u64,
}

/// Object store kept in process memory.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    flags: FeatureFlags,
    /// Countdown until an injected write failure; negative when disarmed
    fail_write_in: AtomicI64,
    writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Backend with a distinguishable canonical name (several stores in one process).
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(BTreeMap::new()),
            flags: FeatureFlags::default(),
            fail_write_in: AtomicI64::new(-1),
            writes: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: FeatureFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Make the write `n` calls from now (0 = the next one) fail with a
    /// backend error without storing anything.
    pub fn fail_write_after(&self, n: u32) {
        self.fail_write_in.store(i64::from(n), Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Snapshot of all stored keys, in order.
    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    /// Raw stored bytes of `key`.
    pub async fn raw(&self, key: &str) -> Option<Bytes> {
        self.objects
            .read()
            .await
            .get(normalize_key(key))
            .map(|o| o.data.clone())
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn should_fail_write(&self) -> bool {
        let previous = self
            .fail_write_in
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n >= 0).then_some(n - 1)
            });
        // Fires when the countdown passes zero, then stays disarmed at -1
        matches!(previous, Ok(0))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_key(path: &str) -> &str {
    path.trim_matches('/')
}

fn prefix_of(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{key}/")
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            driver: "memory".to_string(),
            canonical_name: self.name.clone(),
        }
    }

    fn flags(&self) -> FeatureFlags {
        self.flags
    }

    async fn test_config(&self) -> Result<(), StorageError> {
        Ok(())
    }

    #[instrument(level = "trace", skip(self, visitor))]
    async fn list(
        &self,
        path: &str,
        recursive: bool,
        visitor: Option<&mut dyn Visitor>,
    ) -> Result<Vec<Metadata>, StorageError> {
        let key = normalize_key(path);
        let prefix = prefix_of(key);
        let entries = {
            let objects = self.objects.read().await;
            let mut files = Vec::new();
            let mut dirs = BTreeSet::new();
            for (name, object) in objects.range(prefix.clone()..) {
                let Some(rest) = name.strip_prefix(&prefix) else {
                    break;
                };
                match rest.split_once('/') {
                    Some((dir, _)) if !recursive => {
                        dirs.insert(format!("{prefix}{dir}"));
                    }
                    _ => files.push(
                        Metadata::file(name.clone(), object.data.len() as u64)
                            .with_mtime(Some(object.mtime)),
                    ),
                }
            }

            if files.is_empty() && dirs.is_empty() && !key.is_empty() {
                // Listing a key that is an object yields that object alone
                match objects.get(key) {
                    Some(object) => vec![
                        Metadata::file(key, object.data.len() as u64)
                            .with_mtime(Some(object.mtime)),
                    ],
                    None => return Err(StorageError::not_found(key)),
                }
            } else {
                let mut entries: Vec<Metadata> = dirs.into_iter().map(Metadata::dir).collect();
                entries.extend(files);
                entries
            }
        };
        trace!(count = entries.len(), "Listed memory prefix");
        visit_all(visitor, &entries).await?;
        Ok(entries)
    }

    async fn metadata(&self, path: &str) -> Result<Metadata, StorageError> {
        let key = normalize_key(path);
        let objects = self.objects.read().await;
        if let Some(object) = objects.get(key) {
            return Ok(Metadata::file(key, object.data.len() as u64).with_mtime(Some(object.mtime)));
        }
        let prefix = prefix_of(key);
        let has_children = objects
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(name, _)| name.starts_with(&prefix));
        if has_children {
            Ok(Metadata::dir(key))
        } else {
            Err(StorageError::not_found(key))
        }
    }

    async fn read(&self, path: &str) -> Result<ByteStream, StorageError> {
        let key = normalize_key(path);
        let data = self
            .objects
            .read()
            .await
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StorageError::not_found(key))?;
        Ok(chunked(data, READ_CHUNK_SIZE))
    }

    #[instrument(level = "trace", skip(self, source))]
    async fn write(&self, path: &str, source: ByteSource) -> Result<u64, StorageError> {
        let key = normalize_key(path);
        if key.is_empty() {
            return Err(StorageError::invalid_path(path, "cannot write to the root"));
        }

        let mut stream = source.into_stream();
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }

        if self.should_fail_write() {
            debug!(key, "Injected write failure");
            return Err(StorageError::backend(
                "injected write failure",
                OpContext::for_operation("write").with_storage_key(key),
            ));
        }

        let size = buf.len() as u64;
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data: buf.freeze(),
                mtime: now_millis(),
            },
        );
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(size)
    }

    #[instrument(level = "trace", skip(self))]
    async fn remove(
        &self,
        path: &str,
        options: RemoveOptions,
    ) -> Result<Vec<String>, StorageError> {
        let key = normalize_key(path);
        let mut objects = self.objects.write().await;
        let mut removed = Vec::new();

        if objects.remove(key).is_some() {
            removed.push(key.to_string());
        }
        if options.recursive {
            let prefix = prefix_of(key);
            let doomed: Vec<String> = objects
                .range(prefix.clone()..)
                .take_while(|(name, _)| name.starts_with(&prefix))
                .map(|(name, _)| name.clone())
                .collect();
            for name in doomed {
                objects.remove(&name);
                removed.push(name);
            }
        }

        if removed.is_empty() && !options.quiet {
            return Err(StorageError::not_found(key));
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EntryType;
    use crate::stream::collect_stream;

    async fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        for key in ["a/1.txt", "a/b/2.txt", "a/b/c/3.txt", "z.txt"] {
            backend.write(key, ByteSource::from(key.to_string())).await.unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn test_list_synthesizes_dirs() {
        let backend = seeded().await;
        let names: Vec<_> = backend
            .list("a", false, None)
            .await
            .unwrap()
            .into_iter()
            .map(|m| (m.name, m.entry_type))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a/b".to_string(), EntryType::Dir),
                ("a/1.txt".to_string(), EntryType::File),
            ]
        );
    }

    #[tokio::test]
    async fn test_list_recursive_and_root() {
        let backend = seeded().await;
        assert_eq!(backend.list("/a/", true, None).await.unwrap().len(), 3);
        assert_eq!(backend.list("", false, None).await.unwrap().len(), 2);
        assert!(MemoryBackend::new().list("", false, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_single_file_and_missing() {
        let backend = seeded().await;
        let single = backend.list("z.txt", false, None).await.unwrap();
        assert_eq!(single, vec![Metadata::file("z.txt", 5).with_mtime(single[0].mtime)]);
        assert!(backend.list("nope", false, None).await.unwrap_err().is_not_found());
        // "a/b" must not match "a/bc"
        backend.write("a/bc", ByteSource::from("x")).await.unwrap();
        assert_eq!(backend.list("a/b", false, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_metadata_file_dir_missing() {
        let backend = seeded().await;
        assert!(backend.metadata("a/1.txt").await.unwrap().is_file());
        assert!(backend.metadata("a/b").await.unwrap().is_dir());
        assert!(backend.metadata("a/b/c/3").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_read_write_roundtrip() {
        let backend = MemoryBackend::new();
        let data = vec![42u8; READ_CHUNK_SIZE * 2 + 10];
        let written = backend.write("big.bin", ByteSource::from(data.clone())).await.unwrap();
        assert_eq!(written, data.len() as u64);
        let read = collect_stream(backend.read("big.bin").await.unwrap()).await.unwrap();
        assert_eq!(read, data);
        assert!(backend.read("missing").await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_semantics() {
        let backend = seeded().await;
        assert!(backend.remove("nope", RemoveOptions::default()).await.unwrap_err().is_not_found());
        assert!(backend
            .remove("nope", RemoveOptions::default().quiet())
            .await
            .unwrap()
            .is_empty());

        let removed = backend.remove("a/b", RemoveOptions::recursive()).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(backend.keys().await, vec!["a/1.txt", "z.txt"]);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let backend = MemoryBackend::new();
        backend.fail_write_after(1);
        backend.write("one", ByteSource::from("1")).await.unwrap();
        let err = backend.write("two", ByteSource::from("2")).await.unwrap_err();
        assert!(matches!(err, StorageError::Backend { .. }));
        backend.write("three", ByteSource::from("3")).await.unwrap();
        assert_eq!(backend.keys().await, vec!["one", "three"]);
        assert_eq!(backend.write_count(), 2);
    }
}

//! Shared helpers for the integration tests.

#![allow(dead_code)] // Each test binary uses a different subset

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use oxstash_core::backend::{
    BackendInfo, FeatureFlags, MemoryBackend, Metadata, RemoveOptions, StorageBackend, Visitor,
};
use oxstash_core::overlay::{EncryptedClient, EncryptionConfig};
use oxstash_core::stream::{ByteSource, ByteStream};
use oxstash_core::StorageError;

pub const TEST_KEY: &str = "test-key-material-12345";

/// Route `RUST_LOG`-filtered logs to the test harness output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> EncryptionConfig {
    EncryptionConfig::new(TEST_KEY)
}

/// Fresh in-memory store with an uncached encrypted client on top.
pub fn encrypted_memory() -> (Arc<MemoryBackend>, EncryptedClient) {
    let store = Arc::new(MemoryBackend::new());
    let fs = EncryptedClient::uncached(store.clone(), &test_config()).expect("valid config");
    (store, fs)
}

/// Content of exactly `size` bytes with a recognizable pattern.
pub fn sized_content(size: usize) -> Vec<u8> {
    let pattern = b"0123456789ABCDEF";
    (0..size).map(|i| pattern[i % pattern.len()]).collect()
}

/// Base names of a listing, sorted.
pub fn names(entries: &[Metadata]) -> Vec<String> {
    let mut names: Vec<String> = entries.iter().map(|m| m.base_name().to_string()).collect();
    names.sort();
    names
}

/// Backend wrapper measuring how many reads run at the same time, with an
/// optional delay per read and a switch that makes reads hang.
#[derive(Debug)]
pub struct InstrumentedBackend {
    inner: Arc<MemoryBackend>,
    read_delay: Duration,
    in_flight: AtomicU64,
    peak: AtomicU64,
    stall_reads: AtomicBool,
}

impl InstrumentedBackend {
    pub fn new(inner: Arc<MemoryBackend>, read_delay: Duration) -> Self {
        Self {
            inner,
            read_delay,
            in_flight: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            stall_reads: AtomicBool::new(false),
        }
    }

    pub fn peak_reads(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn reset_peak(&self) {
        self.peak.store(0, Ordering::SeqCst);
    }

    pub fn stall_reads(&self, stall: bool) {
        self.stall_reads.store(stall, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageBackend for InstrumentedBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            driver: "instrumented".to_string(),
            canonical_name: "instrumented".to_string(),
        }
    }

    fn flags(&self) -> FeatureFlags {
        self.inner.flags()
    }

    async fn test_config(&self) -> Result<(), StorageError> {
        self.inner.test_config().await
    }

    async fn list(
        &self,
        path: &str,
        recursive: bool,
        visitor: Option<&mut dyn Visitor>,
    ) -> Result<Vec<Metadata>, StorageError> {
        self.inner.list(path, recursive, visitor).await
    }

    async fn metadata(&self, path: &str) -> Result<Metadata, StorageError> {
        self.inner.metadata(path).await
    }

    async fn read(&self, path: &str) -> Result<ByteStream, StorageError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if self.stall_reads.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        tokio::time::sleep(self.read_delay).await;
        let result = self.inner.read(path).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn write(&self, path: &str, source: ByteSource) -> Result<u64, StorageError> {
        self.inner.write(path, source).await
    }

    async fn remove(
        &self,
        path: &str,
        options: RemoveOptions,
    ) -> Result<Vec<String>, StorageError> {
        self.inner.remove(path, options).await
    }
}

/// Backend wrapper that can fail the listing of one key with `NotFound`, as
/// if it had just been removed, and list a file that is not there under
/// another key.
#[derive(Debug)]
pub struct MaskedListingBackend {
    inner: Arc<MemoryBackend>,
    hidden: Mutex<Option<String>>,
    phantom: Mutex<Option<(String, String)>>,
}

impl MaskedListingBackend {
    pub fn new(inner: Arc<MemoryBackend>) -> Self {
        Self {
            inner,
            hidden: Mutex::new(None),
            phantom: Mutex::new(None),
        }
    }

    /// Listings of exactly `key` fail with `NotFound` from now on.
    pub fn hide_listing(&self, key: &str) {
        *self.hidden.lock().unwrap() = Some(key.to_string());
    }

    /// Listings of `key` also report a file `name` that was never written.
    pub fn add_phantom(&self, key: &str, name: &str) {
        *self.phantom.lock().unwrap() = Some((key.to_string(), name.to_string()));
    }
}

#[async_trait]
impl StorageBackend for MaskedListingBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            driver: "masked".to_string(),
            canonical_name: "masked".to_string(),
        }
    }

    fn flags(&self) -> FeatureFlags {
        self.inner.flags()
    }

    async fn test_config(&self) -> Result<(), StorageError> {
        self.inner.test_config().await
    }

    async fn list(
        &self,
        path: &str,
        recursive: bool,
        visitor: Option<&mut dyn Visitor>,
    ) -> Result<Vec<Metadata>, StorageError> {
        if self.hidden.lock().unwrap().as_deref() == Some(path) {
            return Err(StorageError::not_found(path));
        }
        let mut entries = self.inner.list(path, recursive, None).await?;
        let phantom = self.phantom.lock().unwrap().clone();
        if let Some((key, name)) = phantom
            && key == path
        {
            entries.push(Metadata::file(format!("{path}/{name}"), 0));
        }
        if let Some(visitor) = visitor {
            for entry in &entries {
                visitor.visit(entry).await?;
            }
        }
        Ok(entries)
    }

    async fn metadata(&self, path: &str) -> Result<Metadata, StorageError> {
        self.inner.metadata(path).await
    }

    async fn read(&self, path: &str) -> Result<ByteStream, StorageError> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, source: ByteSource) -> Result<u64, StorageError> {
        self.inner.write(path, source).await
    }

    async fn remove(
        &self,
        path: &str,
        options: RemoveOptions,
    ) -> Result<Vec<String>, StorageError> {
        self.inner.remove(path, options).await
    }
}

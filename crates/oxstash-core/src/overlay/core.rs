//! Shared state of an encrypted client.
//!
//! [`OverlayCore`] owns everything the façade and the metadata workers need:
//! the wrapped backend, the path codec, the content cipher and the cache. It
//! is shared behind an `Arc` between the [`super::EncryptedClient`] and its
//! worker tasks; the workers never hold the client itself.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use super::codec::{PADDING_SEPARATOR, PathCodec};
use crate::backend::{EntryType, Metadata, StorageBackend};
use crate::cache::{Cache, CacheScope, CacheValue};
use crate::crypto::{CipherError, ContentCipher, NONCE_SIZE};
use crate::error::{OpContext, StorageError};
use crate::path::StoragePath;
use crate::stream::{ByteSource, collect_stream};

/// Plaintext of a meta sidecar object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaSidecar {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
}

pub(crate) struct OverlayCore {
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) codec: PathCodec,
    pub(crate) cipher: ContentCipher,
    pub(crate) cache: Arc<dyn Cache>,
}

impl OverlayCore {
    /// Read and decrypt a whole (small) object.
    pub(crate) async fn read_sealed(&self, key: &str, context: OpContext) -> Result<Bytes, StorageError> {
        let stream = self.backend.read(key).await?;
        let ciphertext = collect_stream(stream).await?;
        self.cipher
            .decrypt(&ciphertext)
            .map_err(|e| StorageError::cipher(e, context.with_storage_key(key)))
    }

    /// Encrypt and write a whole (small) object.
    pub(crate) async fn write_sealed(
        &self,
        key: &str,
        plaintext: &[u8],
        context: OpContext,
    ) -> Result<(), StorageError> {
        let ciphertext = self
            .cipher
            .encrypt(plaintext)
            .map_err(|e| StorageError::cipher(e, context.clone().with_storage_key(key)))?;
        self.backend
            .write(key, ByteSource::from_bytes(ciphertext))
            .await
            .map_err(|e| e.with_context(context.with_storage_key(key)))?;
        Ok(())
    }

    /// Best-effort read of the meta sidecar of `path`.
    async fn read_sidecar(&self, path: &StoragePath) -> Option<MetaSidecar> {
        let key = self.codec.meta_path(path.as_str());
        let context = OpContext::for_operation("metadata")
            .with_path(path.as_str())
            .with_step("meta sidecar");
        let plaintext = match self.read_sealed(&key, context).await {
            Ok(plaintext) => plaintext,
            Err(e) if e.is_not_found() => return None,
            Err(e) => {
                warn!(path = %path, error = %e, "Unreadable meta sidecar, using native metadata");
                return None;
            }
        };
        match serde_json::from_slice::<MetaSidecar>(&plaintext) {
            Ok(sidecar) => Some(sidecar),
            Err(e) => {
                warn!(path = %path, error = %e, "Malformed meta sidecar, using native metadata");
                None
            }
        }
    }

    /// Resolve logical metadata of `path`: sidecar over native content
    /// metadata, falling back to the dirent directory for directories.
    #[instrument(level = "trace", skip(self, path), fields(path = %path))]
    pub(crate) async fn metadata(&self, path: &StoragePath) -> Result<Metadata, StorageError> {
        let metadata_cache = self.cache.scoped(CacheScope::Metadata);
        if let Some(CacheValue::Metadata(cached)) = metadata_cache.get(path.as_str()).await {
            trace!("Metadata cache hit");
            return Ok(cached);
        }

        let sidecar = self.read_sidecar(path).await;
        let content_key = self.codec.encrypt_path(path.as_str());
        let resolved = match self.backend.metadata(&content_key).await {
            Ok(native) => Metadata {
                name: path.as_str().to_string(),
                entry_type: sidecar.as_ref().map_or(native.entry_type, |s| s.entry_type),
                size: sidecar
                    .as_ref()
                    .map(|s| s.size)
                    .or_else(|| native.size.map(|n| n.saturating_sub(NONCE_SIZE as u64))),
                mtime: native.mtime,
            },
            Err(e) if e.is_not_found() => self.directory_metadata(path).await?,
            Err(e) => {
                return Err(e.with_context(
                    OpContext::for_operation("metadata")
                        .with_path(path.as_str())
                        .with_storage_key(content_key),
                ));
            }
        };

        metadata_cache
            .set(path.as_str(), CacheValue::Metadata(resolved.clone()))
            .await;
        Ok(resolved)
    }

    /// No content object: `path` is a directory if its dirent directory exists
    /// or has entries.
    async fn directory_metadata(&self, path: &StoragePath) -> Result<Metadata, StorageError> {
        let dirent_key = self.codec.dirent_dir(path.as_str());
        match self.backend.metadata(&dirent_key).await {
            Ok(native) => return Ok(Metadata::dir(path.as_str()).with_mtime(native.mtime)),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.with_context(OpContext::for_operation("metadata").with_path(path.as_str()))),
        }
        match self.backend.list(&dirent_key, false, None).await {
            Ok(entries) if !entries.is_empty() => Ok(Metadata::dir(path.as_str())),
            Ok(_) => Err(StorageError::not_found(path.as_str())),
            Err(e) if e.is_not_found() => {
                if path.is_root() {
                    // The root always exists, even before the first write
                    Ok(Metadata::dir(""))
                } else {
                    Err(StorageError::not_found(path.as_str()))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Worker job body: decrypt one dirent file and resolve the path it names.
    ///
    /// `Ok(None)` means the dirent file itself is gone (removed after the
    /// directory was listed). An entry naming a path that no longer resolves
    /// is a `Consistency` error.
    pub(crate) async fn resolve_dirent_entry(
        &self,
        dirent_key: &str,
        entry_name: &str,
    ) -> Result<Option<Metadata>, StorageError> {
        let key = format!("{dirent_key}/{entry_name}");
        let plaintext = match self
            .read_sealed(&key, OpContext::for_operation("list").with_step("dirent entry"))
            .await
        {
            Ok(plaintext) => plaintext,
            Err(e) if e.is_not_found() => {
                trace!(key = %key, "Dirent entry vanished before it was read");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let child = decode_dirent(&plaintext)
            .map_err(|e| StorageError::cipher(e, OpContext::for_operation("list").with_storage_key(&key)))?;
        debug!(child = %child, "Resolved dirent entry");
        match self.metadata(&child).await {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) if e.is_not_found() => Err(StorageError::consistency(
                "dirent entry names a missing path",
                OpContext::for_operation("list")
                    .with_path(child.as_str())
                    .with_storage_key(&key),
            )),
            Err(e) => Err(e),
        }
    }
}

/// Plaintext of a dirent file: the child path, a separator, random padding.
pub(crate) fn encode_dirent(path: &StoragePath) -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let pad_len = rng.random_range(8..=32);
    let mut pad = vec![0u8; pad_len];
    rng.fill(&mut pad[..]);
    format!("{}{PADDING_SEPARATOR}{}", path.as_str(), hex::encode(pad))
}

pub(crate) fn decode_dirent(plaintext: &[u8]) -> Result<StoragePath, CipherError> {
    let text = std::str::from_utf8(plaintext).map_err(|_| CipherError::MalformedPlaintext {
        reason: "dirent entry is not valid UTF-8".to_string(),
    })?;
    let (path, _pad) =
        text.rsplit_once(PADDING_SEPARATOR)
            .ok_or_else(|| CipherError::MalformedPlaintext {
                reason: "dirent entry has no padding separator".to_string(),
            })?;
    Ok(StoragePath::new(path))
}

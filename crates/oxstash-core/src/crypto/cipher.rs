//! Streaming content encryption.
//!
//! # Stored object format
//!
//! | Offset | Size | Description |
//! |--------|------|-------------|
//! | 0      | 16   | Random per-object nonce |
//! | 16     | n    | AES-CTR ciphertext of the n plaintext bytes |
//!
//! The CTR IV of an object is `nonce XOR base_iv`, where `base_iv` comes from
//! the configured IV (or its seed). CTR is length-preserving, so plaintext
//! sizes are always `stored size - 16` and chunk boundaries never matter:
//! encryption and decryption can be fed arbitrarily sized chunks.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use ctr::cipher::{KeyIvInit, StreamCipher};
use futures::stream::{self, StreamExt};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::CipherError;
use super::keys::{CipherKey, IV_SIZE};
use crate::error::{OpContext, StorageError};
use crate::stream::{ByteSource, ByteStream};

/// Size of the per-object nonce header in bytes.
pub const NONCE_SIZE: usize = IV_SIZE;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Supported content cipher algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CipherAlgorithm {
    #[default]
    #[serde(rename = "aes-256-ctr")]
    Aes256Ctr,
    #[serde(rename = "aes-128-ctr")]
    Aes128Ctr,
}

impl CipherAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            CipherAlgorithm::Aes256Ctr => "aes-256-ctr",
            CipherAlgorithm::Aes128Ctr => "aes-128-ctr",
        }
    }

    pub(crate) fn key_len(self) -> usize {
        match self {
            CipherAlgorithm::Aes256Ctr => 32,
            CipherAlgorithm::Aes128Ctr => 16,
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-256-ctr" => Ok(CipherAlgorithm::Aes256Ctr),
            "aes-128-ctr" => Ok(CipherAlgorithm::Aes128Ctr),
            _ => Err(CipherError::UnsupportedAlgorithm {
                name: s.to_string(),
            }),
        }
    }
}

enum Keystream {
    Aes128(Aes128Ctr),
    Aes256(Aes256Ctr),
}

impl Keystream {
    fn new(key: &CipherKey, nonce: &[u8; NONCE_SIZE]) -> Result<Self, CipherError> {
        let mut iv = *key.base_iv();
        for (b, n) in iv.iter_mut().zip(nonce) {
            *b ^= n;
        }
        let invalid = |_| CipherError::InvalidKey {
            reason: format!("key length does not fit {}", key.algorithm()),
        };
        Ok(match key.algorithm() {
            CipherAlgorithm::Aes128Ctr => {
                Keystream::Aes128(Aes128Ctr::new_from_slices(key.content_key(), &iv).map_err(invalid)?)
            }
            CipherAlgorithm::Aes256Ctr => {
                Keystream::Aes256(Aes256Ctr::new_from_slices(key.content_key(), &iv).map_err(invalid)?)
            }
        })
    }

    fn apply(&mut self, buf: &mut [u8]) -> Result<(), CipherError> {
        let result = match self {
            Keystream::Aes128(c) => c.try_apply_keystream(buf),
            Keystream::Aes256(c) => c.try_apply_keystream(buf),
        };
        result.map_err(|_| CipherError::KeystreamExhausted)
    }
}

/// Content cipher bound to one derived key set. Cheap to clone.
#[derive(Clone)]
pub struct ContentCipher {
    key: Arc<CipherKey>,
}

impl ContentCipher {
    pub fn new(key: CipherKey) -> Self {
        Self { key: Arc::new(key) }
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        self.key.algorithm()
    }

    pub fn key(&self) -> &CipherKey {
        &self.key
    }

    /// Start encrypting a new object under a fresh random nonce.
    pub fn encryptor(&self) -> Result<StreamEncryptor, CipherError> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        self.encryptor_with_nonce(nonce)
    }

    pub(crate) fn encryptor_with_nonce(
        &self,
        nonce: [u8; NONCE_SIZE],
    ) -> Result<StreamEncryptor, CipherError> {
        Ok(StreamEncryptor {
            keystream: Keystream::new(&self.key, &nonce)?,
            pending_header: Some(nonce),
        })
    }

    /// Start decrypting a stored object.
    pub fn decryptor(&self) -> StreamDecryptor {
        StreamDecryptor {
            key: Arc::clone(&self.key),
            header: Vec::with_capacity(NONCE_SIZE),
            keystream: None,
        }
    }

    /// Encrypt a whole buffer.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Bytes, CipherError> {
        // The first update carries the nonce, so finish() has nothing left to emit
        self.encryptor()?.update(plaintext)
    }

    /// Decrypt a whole stored object.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Bytes, CipherError> {
        let mut decryptor = self.decryptor();
        let plaintext = decryptor.update(ciphertext)?;
        decryptor.finish()?;
        Ok(plaintext)
    }

    /// Wrap a plaintext source into a ciphertext source.
    ///
    /// Plaintext bytes are added to `counter` as they are pulled, so after
    /// the consumer drained the returned source, `counter` holds the number of
    /// plaintext bytes written. A failure of the input stream or of the cipher
    /// ends the output with that error.
    pub fn encrypt_source(
        &self,
        source: ByteSource,
        counter: Arc<AtomicU64>,
    ) -> Result<ByteSource, CipherError> {
        let encryptor = self.encryptor()?;
        let output = stream::unfold(
            (source.into_stream(), Some(encryptor)),
            move |(mut input, mut encryptor)| {
                let counter = Arc::clone(&counter);
                async move {
                    encryptor.as_ref()?;
                    match input.next().await {
                        Some(Ok(chunk)) => {
                            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                            match encryptor.as_mut()?.update(&chunk) {
                                Ok(out) => Some((Ok(out), (input, encryptor))),
                                Err(err) => {
                                    warn!(error = %err, "Encryption failed mid-stream");
                                    Some((Err(StorageError::from(err)), (input, None)))
                                }
                            }
                        }
                        Some(Err(err)) => Some((Err(err), (input, None))),
                        None => {
                            let tail = encryptor.take()?.finish();
                            trace!(
                                plaintext_bytes = counter.load(Ordering::Relaxed),
                                "Encryption stream finished"
                            );
                            Some((Ok(tail), (input, None)))
                        }
                    }
                }
            },
        )
        .filter(|item| futures::future::ready(!matches!(item, Ok(chunk) if chunk.is_empty())));
        Ok(ByteSource::from_stream(output))
    }

    /// Wrap a ciphertext stream into a plaintext stream.
    pub fn decrypt_stream(&self, input: ByteStream, context: OpContext) -> ByteStream {
        let decryptor = self.decryptor();
        stream::unfold(
            (input, Some(decryptor), context),
            |(mut input, mut decryptor, context)| async move {
                decryptor.as_ref()?;
                match input.next().await {
                    Some(Ok(chunk)) => match decryptor.as_mut()?.update(&chunk) {
                        Ok(out) => Some((Ok(out), (input, decryptor, context))),
                        Err(err) => Some((
                            Err(StorageError::cipher(err, context.clone())),
                            (input, None, context),
                        )),
                    },
                    Some(Err(err)) => Some((Err(err), (input, None, context))),
                    None => match decryptor.take()?.finish() {
                        Ok(()) => None,
                        Err(err) => Some((
                            Err(StorageError::cipher(err, context.clone())),
                            (input, None, context),
                        )),
                    },
                }
            },
        )
        .filter(|item| futures::future::ready(!matches!(item, Ok(chunk) if chunk.is_empty())))
        .boxed()
    }
}

impl fmt::Debug for ContentCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentCipher")
            .field("key", &self.key)
            .finish()
    }
}

/// Incremental encryptor for one object.
pub struct StreamEncryptor {
    keystream: Keystream,
    pending_header: Option<[u8; NONCE_SIZE]>,
}

impl StreamEncryptor {
    /// Encrypt the next plaintext chunk. The first call also emits the nonce.
    pub fn update(&mut self, chunk: &[u8]) -> Result<Bytes, CipherError> {
        let mut out = BytesMut::with_capacity(chunk.len() + NONCE_SIZE);
        if let Some(nonce) = self.pending_header.take() {
            out.extend_from_slice(&nonce);
        }
        let start = out.len();
        out.extend_from_slice(chunk);
        self.keystream.apply(&mut out[start..])?;
        Ok(out.freeze())
    }

    /// End of plaintext. Emits the nonce if no chunk was ever encrypted, so an
    /// empty file still produces a well-formed object.
    pub fn finish(self) -> Bytes {
        match self.pending_header {
            Some(nonce) => Bytes::copy_from_slice(&nonce),
            None => Bytes::new(),
        }
    }
}

/// Incremental decryptor for one object; tolerates the nonce being split
/// across chunks.
pub struct StreamDecryptor {
    key: Arc<CipherKey>,
    header: Vec<u8>,
    keystream: Option<Keystream>,
}

impl StreamDecryptor {
    pub fn update(&mut self, chunk: &[u8]) -> Result<Bytes, CipherError> {
        let mut body = chunk;
        if self.keystream.is_none() {
            let needed = NONCE_SIZE - self.header.len();
            let take = needed.min(body.len());
            self.header.extend_from_slice(&body[..take]);
            body = &body[take..];
            if self.header.len() < NONCE_SIZE {
                return Ok(Bytes::new());
            }
            let mut nonce = [0u8; NONCE_SIZE];
            nonce.copy_from_slice(&self.header);
            self.keystream = Some(Keystream::new(&self.key, &nonce)?);
        }

        let mut out = BytesMut::from(body);
        if let Some(keystream) = self.keystream.as_mut() {
            keystream.apply(&mut out)?;
        }
        Ok(out.freeze())
    }

    /// End of ciphertext: fails if the nonce header never completed.
    pub fn finish(self) -> Result<(), CipherError> {
        if self.keystream.is_none() {
            return Err(CipherError::Truncated {
                expected: NONCE_SIZE,
                actual: self.header.len(),
            });
        }
        Ok(())
    }
}

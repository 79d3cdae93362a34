//! Cryptographic primitives for the storage overlay

pub mod cipher;
pub mod keys;

use thiserror::Error;

/// Errors that can occur while deriving keys or transforming content.
///
/// Key errors are **configuration errors** raised when a client is built.
/// Stream errors are raised mid-transform and abort the whole read or write.
#[derive(Error, Debug)]
pub enum CipherError {
    // =========================================================================
    // CONFIGURATION ERRORS - Raised at construction time
    // =========================================================================
    #[error("Invalid key material: {reason}")]
    InvalidKey { reason: String },

    #[error("Invalid initialization vector: {reason}")]
    InvalidIv { reason: String },

    #[error("Unsupported cipher algorithm '{name}' (expected aes-256-ctr or aes-128-ctr)")]
    UnsupportedAlgorithm { name: String },

    // =========================================================================
    // STREAM ERRORS - Stored data is unreadable with this key
    // =========================================================================
    /// The stored object ended before its nonce header was complete.
    #[error("Ciphertext truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// The CTR counter would wrap; the object is larger than the cipher allows.
    #[error("Keystream exhausted")]
    KeystreamExhausted,

    /// Decrypted bytes do not have the expected shape (dirent text, sidecar JSON).
    #[error("Malformed plaintext: {reason}")]
    MalformedPlaintext { reason: String },
}

pub use cipher::{CipherAlgorithm, ContentCipher, NONCE_SIZE, StreamDecryptor, StreamEncryptor};
pub use keys::CipherKey;

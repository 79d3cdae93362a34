//! Key derivation for content encryption and path hashing.
//!
//! Callers supply free-form key material (and optionally an IV or IV seed).
//! Everything the overlay needs is derived from it with HMAC-SHA256 under
//! distinct labels, so the raw secret is never used directly as a cipher key
//! or as the salt of the path hash:
//!
//! | Label | Output |
//! |-------|--------|
//! | `content-key` | 32-byte AES key (first 16 bytes for AES-128) |
//! | `path-salt` | hex string prefixed to every hashed logical path |
//! | `content-iv` | 16-byte base IV when no IV is configured |

use std::fmt;

use ring::hmac;
use zeroize::Zeroizing;

use super::CipherError;
use super::cipher::CipherAlgorithm;

const CONTENT_KEY_LABEL: &[u8] = b"content-key";
const PATH_SALT_LABEL: &[u8] = b"path-salt";
const CONTENT_IV_LABEL: &[u8] = b"content-iv";

/// Size of the base IV in bytes.
pub const IV_SIZE: usize = 16;

/// Derived key set for one encrypted client.
pub struct CipherKey {
    algorithm: CipherAlgorithm,
    content_key: Zeroizing<[u8; 32]>,
    base_iv: [u8; IV_SIZE],
    path_salt: Zeroizing<String>,
}

impl CipherKey {
    /// Derive the key set from caller-supplied material.
    ///
    /// `iv` is either 32 hex digits (used verbatim as the base IV) or any other
    /// non-empty string (a seed the base IV is derived from). Without it the
    /// base IV is derived from the key material.
    pub fn derive(
        material: &str,
        iv: Option<&str>,
        algorithm: CipherAlgorithm,
    ) -> Result<Self, CipherError> {
        if material.is_empty() {
            return Err(CipherError::InvalidKey {
                reason: "key material is empty".to_string(),
            });
        }

        let master = hmac::Key::new(hmac::HMAC_SHA256, material.as_bytes());

        let mut content_key = Zeroizing::new([0u8; 32]);
        content_key.copy_from_slice(hmac::sign(&master, CONTENT_KEY_LABEL).as_ref());

        let path_salt = Zeroizing::new(hex::encode(hmac::sign(&master, PATH_SALT_LABEL)));

        let base_iv = match iv {
            None => truncate_iv(hmac::sign(&master, CONTENT_IV_LABEL).as_ref()),
            Some("") => {
                return Err(CipherError::InvalidIv {
                    reason: "iv is empty".to_string(),
                });
            }
            Some(iv) => parse_iv(iv),
        };

        Ok(Self {
            algorithm,
            content_key,
            base_iv,
            path_salt,
        })
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Key bytes sized for the configured algorithm.
    pub(crate) fn content_key(&self) -> &[u8] {
        &self.content_key[..self.algorithm.key_len()]
    }

    pub(crate) fn base_iv(&self) -> &[u8; IV_SIZE] {
        &self.base_iv
    }

    /// Salt mixed into every path hash.
    pub(crate) fn path_salt(&self) -> &str {
        &self.path_salt
    }

    /// Short public identifier of this key set (for client ids and logs).
    pub fn fingerprint(&self) -> String {
        let digest = ring::digest::digest(&ring::digest::SHA256, self.path_salt.as_bytes());
        hex::encode(&digest.as_ref()[..8])
    }
}

fn parse_iv(iv: &str) -> [u8; IV_SIZE] {
    if iv.len() == IV_SIZE * 2 {
        let mut out = [0u8; IV_SIZE];
        if hex::decode_to_slice(iv, &mut out).is_ok() {
            return out;
        }
    }
    let seed = hmac::Key::new(hmac::HMAC_SHA256, iv.as_bytes());
    truncate_iv(hmac::sign(&seed, CONTENT_IV_LABEL).as_ref())
}

fn truncate_iv(bytes: &[u8]) -> [u8; IV_SIZE] {
    let mut out = [0u8; IV_SIZE];
    out.copy_from_slice(&bytes[..IV_SIZE]);
    out
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherKey")
            .field("algorithm", &self.algorithm)
            .field("fingerprint", &self.fingerprint())
            .field("content_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

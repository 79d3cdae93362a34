//! Mapping of logical paths to opaque backend keys.
//!
//! All functions here are pure: the same (key, path) always yields the same
//! backend key, and no plaintext path segment ever appears in a key.
//!
//! # Key layout
//!
//! | Artifact | Backend key |
//! |----------|-------------|
//! | Content of `F` | `encrypt_path(F)` |
//! | Meta sidecar of `F` | `encrypt_path(F + " ~ META")` |
//! | Dirent directory of `D` | `encrypt_path(D + "__.dirent")` |
//! | Dirent file for child `C` of `D` | `dirent_dir(D) + "/" + sha256("dirent__ " + C)` |
//!
//! where `encrypt_path(p) = shard(H) + "/" + H` and
//! `H = sha256_hex(salt + " " + p)`.

use ring::digest;

use crate::crypto::CipherKey;
use crate::path::StoragePath;

/// Suffix appended to a directory path before hashing its dirent directory.
pub const DIRENT_DIR_SUFFIX: &str = "__.dirent";

/// Prefix hashed together with a child path to name its dirent file.
pub const DIRENT_FILE_PREFIX: &str = "dirent__";

/// Separator between a path and its random padding in dirent files.
pub const PADDING_SEPARATOR: &str = " ~ ";

/// Suffix appended to a file path before hashing its meta sidecar.
pub const META_SUFFIX: &str = " ~ META";

fn sha256_hex(input: &str) -> String {
    hex::encode(digest::digest(&digest::SHA256, input.as_bytes()))
}

/// Computes backend keys for logical paths.
#[derive(Clone)]
pub struct PathCodec {
    salt: String,
    dir_levels: usize,
}

impl PathCodec {
    pub fn new(key: &CipherKey, dir_levels: usize) -> Self {
        Self {
            salt: key.path_salt().to_string(),
            dir_levels,
        }
    }

    pub fn dir_levels(&self) -> usize {
        self.dir_levels
    }

    fn encrypt_normalized(&self, normalized: &str) -> String {
        let hash = sha256_hex(&format!("{} {normalized}", self.salt));
        if self.dir_levels == 0 {
            return hash;
        }
        let mut key = String::with_capacity(self.dir_levels * 3 + hash.len());
        for level in 0..self.dir_levels.min(hash.len() / 2) {
            key.push_str(&hash[level * 2..level * 2 + 2]);
            key.push('/');
        }
        key.push_str(&hash);
        key
    }

    /// Backend key of the content object of `path`.
    pub fn encrypt_path(&self, path: &str) -> String {
        self.encrypt_normalized(StoragePath::new(path).as_str())
    }

    /// Backend key of the meta sidecar of `path`.
    pub fn meta_path(&self, path: &str) -> String {
        let normalized = StoragePath::new(path);
        self.encrypt_normalized(&format!("{}{META_SUFFIX}", normalized.as_str()))
    }

    /// Backend key of the dirent directory listing the children of `dir`.
    pub fn dirent_dir(&self, dir: &str) -> String {
        let normalized = StoragePath::new(dir);
        self.encrypt_normalized(&format!("{}{DIRENT_DIR_SUFFIX}", normalized.as_str()))
    }

    /// Backend key of the dirent file for `path` inside `dirent_dir`.
    pub fn dirent_file(&self, dirent_dir: &str, path: &str) -> String {
        let normalized = StoragePath::new(path);
        format!(
            "{dirent_dir}/{}",
            sha256_hex(&format!("{DIRENT_FILE_PREFIX} {}", normalized.as_str()))
        )
    }

    /// Dirent file recording `path` in its parent's dirent directory.
    pub fn dirent_entry(&self, path: &StoragePath) -> Option<String> {
        let parent = path.parent()?;
        Some(self.dirent_file(&self.dirent_dir(parent.as_str()), path.as_str()))
    }
}

impl std::fmt::Debug for PathCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathCodec")
            .field("dir_levels", &self.dir_levels)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherAlgorithm;
    use proptest::prelude::*;

    fn codec(dir_levels: usize) -> PathCodec {
        let key = CipherKey::derive("codec-key", None, CipherAlgorithm::Aes256Ctr).unwrap();
        PathCodec::new(&key, dir_levels)
    }

    #[test]
    fn test_shard_layout() {
        let key = codec(3).encrypt_path("a/b.txt");
        let parts: Vec<_> = key.split('/').collect();
        assert_eq!(parts.len(), 4);
        let hash = parts[3];
        assert_eq!(hash.len(), 64);
        assert_eq!(parts[0], &hash[0..2]);
        assert_eq!(parts[1], &hash[2..4]);
        assert_eq!(parts[2], &hash[4..6]);
    }

    #[test]
    fn test_zero_levels_is_bare_hash() {
        let key = codec(0).encrypt_path("a/b.txt");
        assert_eq!(key.len(), 64);
        assert!(!key.contains('/'));
    }

    #[test]
    fn test_separator_forms_share_keys() {
        let c = codec(2);
        assert_eq!(c.encrypt_path("a/b"), c.encrypt_path("/a/b/"));
        assert_eq!(c.dirent_dir(""), c.dirent_dir("/"));
        assert_eq!(c.meta_path("x"), c.meta_path("/x"));
    }

    #[test]
    fn test_artifacts_are_distinct() {
        let c = codec(2);
        let keys = [c.encrypt_path("f"), c.meta_path("f"), c.dirent_dir("f")];
        assert_ne!(keys[0], keys[1]);
        assert_ne!(keys[0], keys[2]);
        assert_ne!(keys[1], keys[2]);
    }

    #[test]
    fn test_dirent_file_lives_under_dirent_dir() {
        let c = codec(2);
        let dir = c.dirent_dir("docs");
        let file = c.dirent_file(&dir, "docs/a.txt");
        assert!(file.starts_with(&format!("{dir}/")));
        assert_eq!(
            c.dirent_entry(&StoragePath::new("docs/a.txt")),
            Some(file)
        );
        assert_eq!(c.dirent_entry(&StoragePath::root()), None);
    }

    #[test]
    fn test_keys_depend_on_key_material() {
        let other = CipherKey::derive("other-key", None, CipherAlgorithm::Aes256Ctr).unwrap();
        assert_ne!(
            codec(2).encrypt_path("a"),
            PathCodec::new(&other, 2).encrypt_path("a")
        );
    }

    #[test]
    fn test_no_plaintext_in_keys() {
        let c = codec(2);
        for key in [c.encrypt_path("secret-name"), c.dirent_dir("secret-name")] {
            assert!(!key.contains("secret"));
        }
    }

    proptest! {
        #[test]
        fn prop_encrypt_path_is_deterministic(path in "[a-zA-Z0-9/ ._-]{0,40}") {
            let c = codec(2);
            prop_assert_eq!(c.encrypt_path(&path), c.encrypt_path(&path));
            let decorated = format!("/{path}/");
            prop_assert_eq!(c.encrypt_path(&path), c.encrypt_path(&decorated));
        }
    }
}

//! Logical paths in the virtual filesystem.
//!
//! A [`StoragePath`] is the user-facing, slash-separated name of a file or
//! directory. It is normalized on construction (leading and trailing
//! separators, empty segments and `.` segments are dropped, unicode is NFC
//! composed) so that every spelling of a path hashes to the same backend key.
//! The root is the empty path.

use std::fmt;

use relative_path::{RelativePath, RelativePathBuf};
use unicode_normalization::UnicodeNormalization;

/// Normalized logical path.
///
/// # Examples
///
/// ```
/// use oxstash_core::path::StoragePath;
///
/// let path = StoragePath::new("/docs//report.txt/");
/// assert_eq!(path.as_str(), "docs/report.txt");
/// assert_eq!(path.file_name(), Some("report.txt"));
/// assert_eq!(path.parent().unwrap().as_str(), "docs");
/// assert!(StoragePath::new("/").is_root());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoragePath(RelativePathBuf);

impl StoragePath {
    #[inline]
    pub fn root() -> Self {
        StoragePath(RelativePathBuf::new())
    }

    pub fn new(path: impl AsRef<str>) -> Self {
        let normalized = path
            .as_ref()
            .split('/')
            .filter(|segment| !segment.is_empty() && *segment != ".")
            .map(|segment| segment.nfc().collect::<String>())
            .collect::<Vec<_>>()
            .join("/");
        StoragePath(RelativePathBuf::from(normalized))
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.as_str().is_empty()
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    #[inline]
    pub fn as_relative_path(&self) -> &RelativePath {
        &self.0
    }

    pub fn join(&self, component: impl AsRef<str>) -> Self {
        StoragePath::new(self.0.join(component.as_ref()).as_str())
    }

    /// Parent path; `None` for the root. The parent of a top-level entry is
    /// the root.
    pub fn parent(&self) -> Option<StoragePath> {
        if self.is_root() {
            return None;
        }
        Some(
            self.0
                .parent()
                .map_or_else(StoragePath::root, |p| StoragePath(p.to_relative_path_buf())),
        )
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.components().map(|c| c.as_str())
    }

    /// `true` if any segment is `..`.
    pub fn has_parent_refs(&self) -> bool {
        self.components().any(|c| c == "..")
    }

    /// Strict ancestors from the immediate parent up to and including the root.
    ///
    /// ```
    /// use oxstash_core::path::StoragePath;
    ///
    /// let ancestors: Vec<_> = StoragePath::new("x/y/z")
    ///     .ancestors()
    ///     .map(|p| p.as_str().to_string())
    ///     .collect();
    /// assert_eq!(ancestors, vec!["x/y", "x", ""]);
    /// ```
    pub fn ancestors(&self) -> impl Iterator<Item = StoragePath> {
        std::iter::successors(self.parent(), StoragePath::parent)
    }
}

impl AsRef<str> for StoragePath {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<&str> for StoragePath {
    fn from(path: &str) -> Self {
        StoragePath::new(path)
    }
}

impl From<String> for StoragePath {
    fn from(path: String) -> Self {
        StoragePath::new(path)
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

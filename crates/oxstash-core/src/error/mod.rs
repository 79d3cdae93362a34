//! Error types for the storage overlay
//!
//! Every fallible operation in the crate returns [`StorageError`]. Errors that
//! happen deep inside a multi-step operation carry an [`OpContext`] naming the
//! logical path, the backend key and the step that failed, so a message like
//! "Backend error for write 'docs/a.txt' at key 3f/9c/..., step 'meta sidecar'"
//! is enough to locate the problem without re-running with tracing enabled.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub use crate::crypto::CipherError;

/// Context attached to storage errors.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    /// Operation name ("list", "write", ...)
    pub operation: Option<&'static str>,
    /// Logical (cleartext) path
    pub path: Option<String>,
    /// Backend key the operation touched
    pub storage_key: Option<String>,
    /// Sub-step within a multi-artifact operation
    pub step: Option<&'static str>,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_operation(operation: &'static str) -> Self {
        Self {
            operation: Some(operation),
            ..Self::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = Some(key.into());
        self
    }

    pub fn with_step(mut self, step: &'static str) -> Self {
        self.step = Some(step);
        self
    }
}

impl fmt::Display for OpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        match (self.operation, &self.path) {
            (Some(op), Some(path)) => parts.push(format!("{op} '{}'", display_path(path))),
            (Some(op), None) => parts.push(op.to_string()),
            (None, Some(path)) => parts.push(format!("path '{}'", display_path(path))),
            (None, None) => {}
        }
        if let Some(ref key) = self.storage_key {
            // Keys are 64+ hex chars; the shard prefix and a few digits identify them
            let display_key = match key.char_indices().nth(24) {
                Some((idx, _)) => format!("{}...", &key[..idx]),
                None => key.clone(),
            };
            parts.push(format!("at key {display_key}"));
        }
        if let Some(step) = self.step {
            parts.push(format!("step '{step}'"));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() { "/" } else { path }
}

/// Errors produced by backends, the overlay and the rich client.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The path (or backend key) does not exist.
    #[error("Not found: '{path}'")]
    NotFound { path: String },

    /// Any other backend-level failure (I/O, permission, transport).
    #[error("Backend error for {context}: {reason}")]
    Backend {
        reason: String,
        context: OpContext,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Encryption or decryption failed; the whole operation is aborted.
    #[error("Cipher error for {context}: {source}")]
    Cipher {
        #[source]
        source: CipherError,
        context: OpContext,
    },

    /// Stored artifacts disagree with each other (e.g. ambiguous entries,
    /// byte counts that do not match after a copy).
    #[error("Inconsistent storage state for {context}: {reason}")]
    Consistency { reason: String, context: OpContext },

    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Client is read-only: {operation} not permitted")]
    ReadOnly { operation: &'static str },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// The metadata worker pool is gone (client destroyed or workers died).
    #[error("Metadata scheduler is shut down")]
    SchedulerClosed,
}

impl StorageError {
    pub fn not_found(path: impl Into<String>) -> Self {
        StorageError::NotFound { path: path.into() }
    }

    pub fn backend(reason: impl Into<String>, context: OpContext) -> Self {
        StorageError::Backend {
            reason: reason.into(),
            context,
            source: None,
        }
    }

    pub fn backend_with_source(
        reason: impl Into<String>,
        context: OpContext,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        StorageError::Backend {
            reason: reason.into(),
            context,
            source: Some(Box::new(source)),
        }
    }

    pub fn cipher(source: CipherError, context: OpContext) -> Self {
        StorageError::Cipher { source, context }
    }

    pub fn consistency(reason: impl Into<String>, context: OpContext) -> Self {
        StorageError::Consistency {
            reason: reason.into(),
            context,
        }
    }

    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        StorageError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        StorageError::Config {
            reason: reason.into(),
        }
    }

    /// `true` for the one error kind callers are expected to branch on.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    /// `true` if this is a `NotFound` for exactly `path`, not for something
    /// below it.
    pub fn is_not_found_at(&self, path: &str) -> bool {
        matches!(self, StorageError::NotFound { path: missing } if missing == path)
    }

    /// Attach context to errors that carry one, leaving the rest untouched.
    #[must_use]
    pub fn with_context(self, context: OpContext) -> Self {
        match self {
            StorageError::Backend {
                reason,
                context: existing,
                source,
            } if existing.path.is_none() => StorageError::Backend {
                reason,
                context: merge(existing, context),
                source,
            },
            StorageError::Cipher {
                source,
                context: existing,
            } if existing.path.is_none() => StorageError::Cipher {
                source,
                context: merge(existing, context),
            },
            other => other,
        }
    }
}

fn merge(existing: OpContext, outer: OpContext) -> OpContext {
    OpContext {
        operation: outer.operation.or(existing.operation),
        path: outer.path.or(existing.path),
        storage_key: existing.storage_key.or(outer.storage_key),
        step: existing.step.or(outer.step),
    }
}

impl From<CipherError> for StorageError {
    fn from(source: CipherError) -> Self {
        StorageError::Cipher {
            source,
            context: OpContext::new(),
        }
    }
}

/// Map an I/O error to a storage error, keeping "not found" distinguishable.
pub fn io_error(err: std::io::Error, path: &str, operation: &'static str) -> StorageError {
    match err.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory => {
            StorageError::not_found(path)
        }
        _ => StorageError::backend_with_source(
            err.to_string(),
            OpContext::for_operation(operation).with_path(path),
            err,
        ),
    }
}

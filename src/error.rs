//! Storage error types.

use std::path::Path;
use thiserror::Error;

/// Errors returned by every object store and archive codec.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("entry {name:?} is too large: {size} bytes exceeds {limit} byte limit")]
    TooLarge { name: String, size: u64, limit: u64 },

    #[error("read-only storage: {0} does not support mutation")]
    ReadOnly(&'static str),

    #[error("bad archive format in {path}: {reason}")]
    BadFormat { path: String, reason: String },

    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error for {url}: {message}")]
    Http { url: String, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("registry authentication failed: {0}")]
    AuthFailure(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse classification of a [`StoreError`], stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidKey,
    NotFound,
    Conflict,
    TooLarge,
    ReadOnly,
    BadFormat,
    Io,
    Cancelled,
    AuthFailure,
    Config,
}

impl StoreError {
    /// Wrap an I/O error with a short description of what was being done.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }

    /// I/O error annotated with the path it happened on.
    pub fn io_at(action: &str, path: &Path, source: std::io::Error) -> Self {
        StoreError::io(format!("{action} {}", path.display()), source)
    }

    pub fn bad_format(path: &Path, reason: impl std::fmt::Display) -> Self {
        StoreError::BadFormat {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn too_large(name: impl Into<String>, size: u64, limit: u64) -> Self {
        StoreError::TooLarge {
            name: name.into(),
            size,
            limit,
        }
    }

    /// Map this error onto the storage error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::InvalidKey(_) => ErrorKind::InvalidKey,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::AlreadyExists(_) => ErrorKind::Conflict,
            StoreError::TooLarge { .. } => ErrorKind::TooLarge,
            StoreError::ReadOnly(_) => ErrorKind::ReadOnly,
            StoreError::BadFormat { .. } => ErrorKind::BadFormat,
            StoreError::Io { .. } | StoreError::Http { .. } => ErrorKind::Io,
            StoreError::Cancelled => ErrorKind::Cancelled,
            StoreError::AuthFailure(_) => ErrorKind::AuthFailure,
            StoreError::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            StoreError::Cancelled
        } else {
            StoreError::io("blocking task failed", std::io::Error::other(err.to_string()))
        }
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

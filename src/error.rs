//! Error types for pkgcache
//!
//! All modules use `CacheResult<T>` as their return type.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pkgcache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// All errors that can occur while acquiring or maintaining cache entries
#[derive(Error, Debug)]
pub enum CacheError {
    // Acquisition errors
    #[error("Timed out after {waited:?} waiting for cache lock {lock_path}")]
    LockTimeout {
        lock_path: PathBuf,
        waited: Duration,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Cache path is not accessible: {path}")]
    CachePathInaccessible {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cache path is not configured")]
    CachePathNotConfigured,

    #[error("Content is not a valid package: {}", messages.join("; "))]
    InvalidPackage { messages: Vec<String> },

    #[error("Cannot write lock record {path}: {source}")]
    LockRecordWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Collaborator errors
    #[error("Resource source error: {0}")]
    Source(String),

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("{0}")]
    User(String),
}

impl CacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a resource source error
    pub fn source_error(message: impl Into<String>) -> Self {
        Self::Source(message.into())
    }

    /// Check if error is retryable
    ///
    /// Only a timed out acquisition is worth repeating; every other failure
    /// surfaces a condition that another attempt cannot change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::CachePathNotConfigured => {
                Some("Set cache.cache_path in the config file or pass --cache-path")
            }
            Self::CachePathInaccessible { .. } => {
                Some("The cache root must exist and be writable by this user")
            }
            Self::LockTimeout { .. } => {
                Some("Another process may be building this entry; try again later")
            }
            _ => None,
        }
    }
}

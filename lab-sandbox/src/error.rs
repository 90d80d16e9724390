//! Error types for scope construction and path checks.

use std::path::PathBuf;

use lab_primitives::ErrorKind;
use lab_registry::RegistryError;
use thiserror::Error;

/// Result alias for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors raised while building or reconstructing an execution scope.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// A dataset lookup or export failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A path resolved outside every allow-listed directory.
    #[error("access denied: `{path}` is outside the allowed paths")]
    PathDenied {
        /// Path as resolved by the guard.
        path: PathBuf,
    },

    /// A path could not be resolved safely (for example a dangling symlink).
    #[error("cannot resolve path `{path}`: {reason}")]
    UnresolvablePath {
        /// Path supplied by the caller.
        path: PathBuf,
        /// Human-readable reason.
        reason: String,
    },

    /// Filesystem failure on an allowed path.
    #[error("i/o error on `{path}`: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A worker request or response could not be encoded or decoded.
    #[error("worker protocol error: {0}")]
    Protocol(String),
}

impl SandboxError {
    /// Helper to construct I/O errors.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Maps the error onto the shared taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Registry(err) => err.kind(),
            Self::PathDenied { .. } | Self::UnresolvablePath { .. } => ErrorKind::AccessDenied,
            Self::Io { .. } => ErrorKind::StorageError,
            Self::Protocol(_) => ErrorKind::InternalError,
        }
    }
}

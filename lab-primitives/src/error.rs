//! Shared error definitions and the error-kind taxonomy.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Error as UuidError;

/// Result alias used by the primitive types.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification shared by every error surfaced to a caller.
///
/// Each crate keeps its own error enum; they all map onto one of these kinds
/// so the dispatcher can produce a uniform response shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Referenced dataset (or other named entity) does not exist.
    NotFound,
    /// Malformed request or a query rejected by policy.
    ValidationError,
    /// Path or capability violation.
    AccessDenied,
    /// Execution exceeded its deadline and was terminated.
    Timeout,
    /// Execution exceeded its memory ceiling or output budget.
    ResourceExceeded,
    /// Backend I/O or write failure.
    StorageError,
    /// User code raised an error inside the worker.
    ExecutionError,
    /// Unexpected failure inside the runtime itself.
    InternalError,
}

impl ErrorKind {
    /// Returns the stable wire label for the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::ValidationError => "validation_error",
            Self::AccessDenied => "access_denied",
            Self::Timeout => "timeout",
            Self::ResourceExceeded => "resource_exceeded",
            Self::StorageError => "storage_error",
            Self::ExecutionError => "execution_error",
            Self::InternalError => "internal_error",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while constructing primitive types.
#[derive(Debug, Error)]
pub enum Error {
    /// The provided execution identifier could not be parsed.
    #[error("invalid execution id: {source}")]
    InvalidExecutionId {
        /// Source parsing error from the UUID library.
        #[from]
        source: UuidError,
    },

    /// A dataset or capability name failed validation.
    #[error("invalid name `{name}`: {reason}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// A table was assembled from inconsistent parts.
    #[error("invalid table: {reason}")]
    InvalidTable {
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// A column referenced by an operation does not exist.
    #[error("unknown column `{column}`")]
    UnknownColumn {
        /// Column name that could not be resolved.
        column: String,
    },

    /// An operation was applied to values of an unsupported type.
    #[error("type mismatch: {reason}")]
    TypeMismatch {
        /// Human-readable explanation.
        reason: String,
    },

    /// An integer aggregate left the 64-bit range.
    #[error("integer overflow in `{column}`")]
    IntegerOverflow {
        /// Output column of the aggregate.
        column: String,
    },
}

impl Error {
    /// Maps the error onto the shared taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ValidationError
    }
}

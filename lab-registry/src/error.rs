//! Error types for the data registry.

use lab_primitives::{Error as PrimitiveError, ErrorKind};
use thiserror::Error;

use crate::dataset::Backend;

/// Errors emitted by registry components.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The requested dataset is not registered.
    #[error("dataset `{name}` not found")]
    NotFound {
        /// Name that failed to resolve.
        name: String,
    },
    /// The request was malformed or conflicts with existing state.
    #[error("invalid request: {reason}")]
    Validation {
        /// Human-readable reason for rejection.
        reason: String,
    },
    /// A backend failed to read or write a dataset.
    #[error("storage error for dataset `{dataset}` on {backend} backend: {reason}")]
    Storage {
        /// Dataset being read or written.
        dataset: String,
        /// Backend that was attempted.
        backend: Backend,
        /// Human-readable reason describing the failure.
        reason: String,
    },
    /// A primitive operation (filter, aggregate, schema) failed.
    #[error(transparent)]
    Table(#[from] PrimitiveError),
    /// Unexpected failure inside the registry itself.
    #[error("internal registry error: {0}")]
    Internal(String),
}

impl RegistryError {
    /// Helper to construct storage errors.
    #[must_use]
    pub fn storage(dataset: impl Into<String>, backend: Backend, reason: impl ToString) -> Self {
        Self::Storage {
            dataset: dataset.into(),
            backend,
            reason: reason.to_string(),
        }
    }

    /// Helper to construct validation errors.
    #[must_use]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Maps the error onto the shared taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation { .. } => ErrorKind::ValidationError,
            Self::Storage { .. } => ErrorKind::StorageError,
            Self::Table(err) => err.kind(),
            Self::Internal(_) => ErrorKind::InternalError,
        }
    }
}

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

//! Dataset metadata and backend tags.

use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use lab_primitives::{DatasetName, Schema};
use serde::{Deserialize, Serialize};

use crate::columnar::ColumnarTable;
use crate::error::{RegistryError, RegistryResult};
use crate::relational::SqliteTable;
use crate::source::DatasetHandle;

/// Storage tier holding a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Immutable shared table in process memory.
    Memory,
    /// Read-only memory-mapped columnar file.
    Columnar,
    /// Table inside the session's SQLite database.
    Relational,
}

impl Backend {
    /// Returns the stable label for the backend.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Columnar => "columnar",
            Self::Relational => "relational",
        }
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = RegistryError;

    fn from_str(s: &str) -> RegistryResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "in_memory" | "in-memory" => Ok(Self::Memory),
            "columnar" | "mmap" => Ok(Self::Columnar),
            "relational" | "sqlite" | "sql" => Ok(Self::Relational),
            other => Err(RegistryError::validation(format!("unknown backend `{other}`"))),
        }
    }
}

/// Metadata recorded for every registered dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dataset {
    /// Unique dataset name.
    pub name: DatasetName,
    /// Tier currently holding the data.
    pub backend: Backend,
    /// Column names and types.
    pub schema: Schema,
    /// Number of rows.
    pub row_count: u64,
    /// Size used for tier selection.
    pub byte_size: u64,
    /// File the data was loaded from, if any.
    pub source_path: Option<PathBuf>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

impl Dataset {
    /// One-line human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let columns = self
            .schema
            .fields()
            .iter()
            .map(|field| format!("{}:{}", field.name(), field.ty()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "dataset `{}` stored in {} backend: {} rows, {} bytes, columns [{}]",
            self.name, self.backend, self.row_count, self.byte_size, columns
        )
    }
}

/// Location of a dataset that another process can open on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum DatasetRef {
    /// Columnar file.
    Columnar {
        /// Path of the columnar file.
        path: PathBuf,
    },
    /// Table inside a SQLite database.
    Relational {
        /// Path of the database file.
        database: PathBuf,
        /// Table name.
        table: String,
    },
}

impl DatasetRef {
    /// Opens a read-only handle on the referenced data.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] if the file or table cannot be
    /// opened.
    pub fn open(&self, name: &str) -> RegistryResult<DatasetHandle> {
        match self {
            Self::Columnar { path } => Ok(std::sync::Arc::new(ColumnarTable::open(name, path)?)),
            Self::Relational { database, table } => {
                Ok(std::sync::Arc::new(SqliteTable::open(database, table)?))
            }
        }
    }
}

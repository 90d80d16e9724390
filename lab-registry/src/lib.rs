//! Tiered dataset registry.
//!
//! Datasets live in one of three tiers chosen by size: an immutable
//! in-memory table, a memory-mapped columnar file, or a table in the
//! session's SQLite database. Every tier is read through the same
//! [`TableSource`] handle.

#![warn(missing_docs, clippy::pedantic)]

mod columnar;
mod dataset;
mod error;
mod loader;
mod memory;
mod registry;
mod relational;
mod source;

pub use columnar::{ColumnarTable, ColumnarWriter};
pub use dataset::{Backend, Dataset, DatasetRef};
pub use error::{RegistryError, RegistryResult};
pub use loader::{DataFormat, FormatLoader, TableLoader};
pub use memory::MemoryTable;
pub use registry::{
    DEFAULT_COLUMNAR_LIMIT, DEFAULT_IN_MEMORY_LIMIT, DataRegistry, DataSource, RegistryConfig,
    StoreOptions,
};
pub use relational::{RelationalStore, SqliteTable, open_read_only, quote_ident, value_from_sql};
pub use source::{DatasetHandle, TableSource};

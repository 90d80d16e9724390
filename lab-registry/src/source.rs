//! Uniform read interface over every backend.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use lab_primitives::{Aggregate, Predicate, Schema, Table};

use crate::columnar::ColumnarWriter;
use crate::dataset::{Backend, DatasetRef};
use crate::error::RegistryResult;

/// Shared, backend-agnostic dataset handle.
pub type DatasetHandle = Arc<dyn TableSource>;

/// Read operations every backend supports.
///
/// Methods are synchronous; async callers run them on a blocking thread.
pub trait TableSource: Send + Sync + Debug {
    /// Dataset name the handle was opened for.
    fn name(&self) -> &str;

    /// Backend holding the data.
    fn backend(&self) -> Backend;

    /// Column names and types.
    fn schema(&self) -> &Schema;

    /// Number of rows.
    fn row_count(&self) -> u64;

    /// Reads rows, optionally projecting columns and capping the row count.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown columns or backend read failures.
    fn scan(&self, projection: Option<&[String]>, limit: Option<usize>) -> RegistryResult<Table>;

    /// Returns rows matching every predicate, evaluated by the backend.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown columns or backend read failures.
    fn filter(&self, predicates: &[Predicate], limit: Option<usize>) -> RegistryResult<Table>;

    /// Grouped aggregation evaluated by the backend.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown columns, inapplicable aggregates, or
    /// backend read failures.
    fn aggregate(&self, group_by: &[String], aggs: &[Aggregate]) -> RegistryResult<Table>;

    /// Materializes the full dataset.
    ///
    /// # Errors
    ///
    /// Returns an error on backend read failures.
    fn collect(&self) -> RegistryResult<Table> {
        self.scan(None, None)
    }

    /// Reference another process can open. Backends without an on-disk
    /// representation return `None`.
    fn reference(&self) -> Option<DatasetRef> {
        None
    }

    /// Marks the representation as released by the registry. Backing storage
    /// is reclaimed once the last handle drops.
    fn retire(&self) {}

    /// Returns a reference for another process, writing a columnar copy into
    /// `dir` when the backend has no on-disk representation.
    ///
    /// # Errors
    ///
    /// Returns an error if the spill file cannot be written.
    fn export(&self, dir: &Path) -> RegistryResult<DatasetRef> {
        if let Some(reference) = self.reference() {
            return Ok(reference);
        }
        let path = dir.join(format!("{}.dlcol", self.name()));
        ColumnarWriter::new(self.name()).write(&path, &self.collect()?)?;
        Ok(DatasetRef::Columnar { path })
    }
}

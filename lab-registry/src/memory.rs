//! In-memory tier: an immutable table shared by reference.

use std::sync::Arc;

use lab_primitives::{Aggregate, Predicate, Schema, Table};

use crate::dataset::Backend;
use crate::error::RegistryResult;
use crate::source::TableSource;

/// Dataset held entirely in process memory.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    name: String,
    table: Arc<Table>,
}

impl MemoryTable {
    /// Wraps a materialized table.
    #[must_use]
    pub fn new(name: impl Into<String>, table: Table) -> Self {
        Self {
            name: name.into(),
            table: Arc::new(table),
        }
    }
}

impl TableSource for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> Backend {
        Backend::Memory
    }

    fn schema(&self) -> &Schema {
        self.table.schema()
    }

    fn row_count(&self) -> u64 {
        self.table.row_count() as u64
    }

    fn scan(&self, projection: Option<&[String]>, limit: Option<usize>) -> RegistryResult<Table> {
        let limit = limit.unwrap_or(usize::MAX);
        let head = self.table.head(limit);
        match projection {
            Some(columns) => Ok(head.select(columns)?),
            None => Ok(head),
        }
    }

    fn filter(&self, predicates: &[Predicate], limit: Option<usize>) -> RegistryResult<Table> {
        let filtered = self.table.filter(predicates)?;
        Ok(match limit {
            Some(limit) => filtered.head(limit),
            None => filtered,
        })
    }

    fn aggregate(&self, group_by: &[String], aggs: &[Aggregate]) -> RegistryResult<Table> {
        Ok(self.table.aggregate(group_by, aggs)?)
    }

    fn collect(&self) -> RegistryResult<Table> {
        Ok(self.table.as_ref().clone())
    }
}

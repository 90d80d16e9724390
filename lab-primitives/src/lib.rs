//! Core shared types for datalab: validated names, execution identifiers,
//! the error-kind taxonomy, and the tabular value model.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod ids;
mod name;
mod ops;
mod table;

/// Error type, result alias, and the shared error-kind taxonomy.
pub use error::{Error, ErrorKind, Result};
/// Unique identifier for a single execution.
pub use ids::ExecutionId;
/// Validated dataset and capability names.
pub use name::{CapabilityName, DatasetName};
/// Row operations and streaming aggregation.
pub use ops::{AggFunc, Aggregate, CompareOp, GroupedAggregation, Predicate};
/// Tabular value model.
pub use table::{ColumnType, Field, Schema, Table, Value};

//! Runtime values.

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use lab_primitives::{Table, Value};
use lab_registry::DatasetHandle;
use serde_json::{Value as JsonValue, json};

use super::{ScriptError, ScriptResult};

/// Value produced while evaluating a script.
#[derive(Debug, Clone, Default)]
pub enum ScriptValue {
    /// Absence of a value.
    #[default]
    Null,
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// UTF-8 text.
    Text(String),
    /// Ordered list.
    List(Vec<ScriptValue>),
    /// Materialized table.
    Table(Arc<Table>),
    /// Handle on a dataset in the execution scope.
    Dataset(DatasetHandle),
}

impl ScriptValue {
    /// Short type label used in error messages.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Text(_) => "text",
            Self::List(_) => "list",
            Self::Table(_) => "table",
            Self::Dataset(_) => "dataset",
        }
    }

    /// Truthiness used by `if`, `while`, `and`, `or`, and `not`.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(v) => *v,
            Self::Int(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
            Self::Text(v) => !v.is_empty(),
            Self::List(v) => !v.is_empty(),
            Self::Table(table) => table.row_count() > 0,
            Self::Dataset(_) => true,
        }
    }

    /// Returns the value as a float when numeric.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Equality used by `==` and `!=`. Integers and floats compare
    /// numerically; tables and datasets compare by identity.
    #[must_use]
    pub fn loose_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Self::Table(a), Self::Table(b)) => Arc::ptr_eq(a, b),
            (Self::Dataset(a), Self::Dataset(b)) => Arc::ptr_eq(a, b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }

    /// Ordering used by `<`, `<=`, `>`, `>=`.
    ///
    /// # Errors
    ///
    /// Fails for values that have no natural order.
    pub fn compare(&self, other: &Self) -> ScriptResult<Ordering> {
        let ordering = match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        };
        ordering.ok_or_else(|| {
            ScriptError::execution(format!(
                "cannot compare {} with {}",
                self.type_name(),
                other.type_name()
            ))
        })
    }

    /// Converts a scalar into a table cell value.
    ///
    /// # Errors
    ///
    /// Fails for lists, tables, and datasets.
    pub fn to_cell(&self) -> ScriptResult<Value> {
        match self {
            Self::Null => Ok(Value::Null),
            Self::Int(v) => Ok(Value::Int(*v)),
            Self::Float(v) => Ok(Value::Float(*v)),
            Self::Bool(v) => Ok(Value::Bool(*v)),
            Self::Text(v) => Ok(Value::Text(v.clone())),
            other => Err(ScriptError::execution(format!(
                "expected a scalar, found {}",
                other.type_name()
            ))),
        }
    }

    /// JSON rendering of the value. Tables are capped at `row_limit` rows and
    /// datasets are described rather than read.
    #[must_use]
    pub fn to_json(&self, row_limit: usize) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Int(v) => json!(v),
            Self::Float(v) => serde_json::Number::from_f64(*v).map_or(JsonValue::Null, JsonValue::Number),
            Self::Bool(v) => json!(v),
            Self::Text(v) => json!(v),
            Self::List(items) => items.iter().map(|item| item.to_json(row_limit)).collect(),
            Self::Table(table) => table.to_json(row_limit),
            Self::Dataset(handle) => json!({
                "dataset": handle.name(),
                "backend": handle.backend(),
                "row_count": handle.row_count(),
                "columns": handle.schema(),
            }),
        }
    }
}

impl From<Value> for ScriptValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Int(v) => Self::Int(v),
            Value::Float(v) => Self::Float(v),
            Value::Bool(v) => Self::Bool(v),
            Value::Text(v) => Self::Text(v),
        }
    }
}

impl From<Table> for ScriptValue {
    fn from(table: Table) -> Self {
        Self::Table(Arc::new(table))
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl Display for ScriptValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
            Self::List(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    match item {
                        Self::Text(text) => write!(f, "{text:?}")?,
                        other => write!(f, "{other}")?,
                    }
                }
                f.write_str("]")
            }
            Self::Table(table) => f.write_str(table.render(20).trim_end()),
            Self::Dataset(handle) => write!(
                f,
                "<dataset {} ({}, {} rows)>",
                handle.name(),
                handle.backend(),
                handle.row_count()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_equality_crosses_types() {
        assert!(ScriptValue::Int(2).loose_eq(&ScriptValue::Float(2.0)));
        assert!(!ScriptValue::Int(2).loose_eq(&ScriptValue::from("2")));
        assert!(ScriptValue::Null.loose_eq(&ScriptValue::Null));
    }

    #[test]
    fn ordering_rejects_mixed_types() {
        assert_eq!(
            ScriptValue::Int(1).compare(&ScriptValue::Float(1.5)).unwrap(),
            Ordering::Less
        );
        assert!(ScriptValue::from("a").compare(&ScriptValue::Int(1)).is_err());
    }

    #[test]
    fn lists_render_with_quoted_text() {
        let list = ScriptValue::List(vec![ScriptValue::Int(1), ScriptValue::from("a")]);
        assert_eq!(list.to_string(), "[1, \"a\"]");
        assert_eq!(list.to_json(10), json!([1, "a"]));
    }
}

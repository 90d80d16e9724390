//! Tabular value model shared by every backend and by the worker runtime.

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{Error, Result};

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// 64-bit signed integer.
    Int,
    /// 64-bit float.
    Float,
    /// Boolean.
    Bool,
    /// UTF-8 text.
    Text,
}

impl ColumnType {
    /// Returns the lowercase label used in summaries.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Text => "text",
        }
    }

    /// SQL type affinity used when the column is materialized in a relational
    /// table.
    #[must_use]
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::Int => "INTEGER",
            Self::Float => "REAL",
            Self::Bool => "BOOLEAN",
            Self::Text => "TEXT",
        }
    }

    /// Converts a value into this column's representation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeMismatch`] if the value cannot be represented.
    pub fn coerce(self, value: Value) -> Result<Value> {
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (Self::Int, Value::Int(v)) => Ok(Value::Int(v)),
            (Self::Float, Value::Float(v)) => Ok(Value::Float(v)),
            #[allow(clippy::cast_precision_loss)]
            (Self::Float, Value::Int(v)) => Ok(Value::Float(v as f64)),
            (Self::Bool, Value::Bool(v)) => Ok(Value::Bool(v)),
            (Self::Bool, Value::Int(v)) if v == 0 || v == 1 => Ok(Value::Bool(v == 1)),
            (Self::Text, Value::Text(v)) => Ok(Value::Text(v)),
            (Self::Text, other) => Ok(Value::Text(other.to_string())),
            (ty, other) => Err(Error::TypeMismatch {
                reason: format!("cannot store {} value in {} column", other.type_label(), ty.as_str()),
            }),
        }
    }
}

impl Display for ColumnType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    /// Missing value.
    #[default]
    Null,
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Boolean value.
    Bool(bool),
    /// Text value.
    Text(String),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the value as a float when it is numeric.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns a short type label for error messages.
    #[must_use]
    pub const fn type_label(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Text(_) => "text",
        }
    }

    /// Compares two values. Integers and floats compare numerically; nulls
    /// and values of unrelated types are unordered.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    /// Approximate in-memory footprint used for tier selection.
    #[must_use]
    pub fn estimated_bytes(&self) -> usize {
        match self {
            Self::Null | Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 8,
            Self::Text(text) => text.len() + 8,
        }
    }

    /// Converts the value into JSON.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Int(v) => JsonValue::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v).map_or(JsonValue::Null, JsonValue::Number),
            Self::Bool(v) => JsonValue::Bool(*v),
            Self::Text(v) => JsonValue::String(v.clone()),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// Named, typed column descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    name: String,
    #[serde(rename = "type")]
    ty: ColumnType,
}

impl Field {
    /// Creates a field descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    /// Column name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Column type.
    #[must_use]
    pub const fn ty(&self) -> ColumnType {
        self.ty
    }
}

/// Ordered list of column descriptors.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// Creates a schema, rejecting duplicate or empty column names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTable`] on duplicate or empty names.
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        for (idx, field) in fields.iter().enumerate() {
            if field.name.trim().is_empty() {
                return Err(Error::InvalidTable {
                    reason: format!("column {idx} has an empty name"),
                });
            }
            if fields[..idx].iter().any(|other| other.name == field.name) {
                return Err(Error::InvalidTable {
                    reason: format!("duplicate column `{}`", field.name),
                });
            }
        }
        Ok(Self { fields })
    }

    /// Returns the column descriptors.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` when the schema has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolves a column name to its index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownColumn`] if the column does not exist.
    pub fn index_of(&self, column: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|field| field.name == column)
            .ok_or_else(|| Error::UnknownColumn {
                column: column.to_owned(),
            })
    }

    /// Column names in order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|field| field.name.clone()).collect()
    }
}

/// Row-major materialized table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    schema: Schema,
    rows: Vec<Vec<Value>>,
}

impl Table {
    /// Creates a table, coercing each cell into its column type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTable`] when a row has the wrong width and
    /// [`Error::TypeMismatch`] when a cell cannot be coerced.
    pub fn new(schema: Schema, rows: Vec<Vec<Value>>) -> Result<Self> {
        let width = schema.len();
        let mut coerced = Vec::with_capacity(rows.len());
        for (row_idx, row) in rows.into_iter().enumerate() {
            if row.len() != width {
                return Err(Error::InvalidTable {
                    reason: format!("row {row_idx} has {} cells, expected {width}", row.len()),
                });
            }
            let row = row
                .into_iter()
                .zip(schema.fields())
                .map(|(value, field)| field.ty().coerce(value))
                .collect::<Result<Vec<_>>>()?;
            coerced.push(row);
        }
        Ok(Self {
            schema,
            rows: coerced,
        })
    }

    /// Creates an empty table with the given schema.
    #[must_use]
    pub fn empty(schema: Schema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    /// Builds a table from untyped text cells, inferring column types.
    ///
    /// Empty cells become nulls. A column is `int` if every non-empty cell
    /// parses as an integer, `float` if every cell parses as a number, `bool`
    /// if every cell is `true`/`false`, and `text` otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTable`] on ragged rows or invalid headers.
    pub fn from_text_rows(headers: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self> {
        let width = headers.len();
        if let Some((idx, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != width) {
            return Err(Error::InvalidTable {
                reason: format!("row {idx} has {} cells, expected {width}", row.len()),
            });
        }

        let types: Vec<ColumnType> = (0..width)
            .map(|col| infer_text_column(rows.iter().map(|row| row[col].as_str())))
            .collect();

        let schema = Schema::new(
            headers
                .into_iter()
                .zip(&types)
                .map(|(name, ty)| Field::new(name.trim(), *ty))
                .collect(),
        )?;

        let rows = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(&types)
                    .map(|(cell, ty)| parse_text_cell(&cell, *ty))
                    .collect()
            })
            .collect();

        Ok(Self { schema, rows })
    }

    /// Builds a table from JSON objects. Column order follows first
    /// appearance; missing keys become nulls and nested values are stored as
    /// JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTable`] when the column set is invalid.
    pub fn from_json_records(records: &[Map<String, JsonValue>]) -> Result<Self> {
        let mut names: Vec<String> = Vec::new();
        for record in records {
            for key in record.keys() {
                if !names.contains(key) {
                    names.push(key.clone());
                }
            }
        }

        let types: Vec<ColumnType> = names
            .iter()
            .map(|name| infer_json_column(records.iter().filter_map(|record| record.get(name))))
            .collect();

        let schema = Schema::new(
            names
                .iter()
                .zip(&types)
                .map(|(name, ty)| Field::new(name.clone(), *ty))
                .collect(),
        )?;

        let rows = records
            .iter()
            .map(|record| {
                names
                    .iter()
                    .zip(&types)
                    .map(|(name, ty)| record.get(name).map_or(Value::Null, |v| json_cell(v, *ty)))
                    .collect()
            })
            .collect();

        Ok(Self { schema, rows })
    }

    /// Assembles a table from parts already known to agree with the schema.
    pub(crate) fn from_parts_unchecked(schema: Schema, rows: Vec<Vec<Value>>) -> Self {
        Self { schema, rows }
    }

    /// Returns the table schema.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Returns the rows.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.schema.len()
    }

    /// Approximate in-memory size used when no size hint is supplied.
    #[must_use]
    pub fn estimated_bytes(&self) -> u64 {
        let cells: usize = self
            .rows
            .iter()
            .map(|row| row.iter().map(Value::estimated_bytes).sum::<usize>())
            .sum();
        cells as u64
    }

    /// Returns the values of a single column.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownColumn`] if the column does not exist.
    pub fn column(&self, name: &str) -> Result<Vec<Value>> {
        let idx = self.schema.index_of(name)?;
        Ok(self.rows.iter().map(|row| row[idx].clone()).collect())
    }

    /// Splits the table into schema and rows.
    #[must_use]
    pub fn into_parts(self) -> (Schema, Vec<Vec<Value>>) {
        (self.schema, self.rows)
    }

    /// Renders the table as `{"columns": [...], "rows": [[...]]}`, keeping at
    /// most `limit` rows.
    #[must_use]
    pub fn to_json(&self, limit: usize) -> JsonValue {
        let rows: Vec<JsonValue> = self
            .rows
            .iter()
            .take(limit)
            .map(|row| JsonValue::Array(row.iter().map(Value::to_json).collect()))
            .collect();
        serde_json::json!({
            "columns": self.schema.names(),
            "rows": rows,
            "row_count": self.rows.len(),
        })
    }

    /// Renders a fixed-width text preview of the first `limit` rows.
    #[must_use]
    pub fn render(&self, limit: usize) -> String {
        let names = self.schema.names();
        let shown: Vec<Vec<String>> = self
            .rows
            .iter()
            .take(limit)
            .map(|row| row.iter().map(ToString::to_string).collect())
            .collect();

        let widths: Vec<usize> = names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                shown
                    .iter()
                    .map(|row| row[idx].chars().count())
                    .chain(std::iter::once(name.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let mut out = String::new();
        let line = |cells: &[String]| {
            cells
                .iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{cell:<width$}"))
                .collect::<Vec<_>>()
                .join("  ")
                .trim_end()
                .to_owned()
        };
        out.push_str(&line(&names));
        out.push('\n');
        for row in &shown {
            out.push_str(&line(row));
            out.push('\n');
        }
        if self.rows.len() > limit {
            out.push_str(&format!("... {} more rows\n", self.rows.len() - limit));
        }
        out
    }
}

fn infer_text_column<'a>(cells: impl Iterator<Item = &'a str> + Clone) -> ColumnType {
    let non_empty = || cells.clone().map(str::trim).filter(|cell| !cell.is_empty());
    if non_empty().next().is_none() {
        return ColumnType::Text;
    }
    if non_empty().all(|cell| cell.parse::<i64>().is_ok()) {
        ColumnType::Int
    } else if non_empty().all(|cell| cell.parse::<f64>().is_ok()) {
        ColumnType::Float
    } else if non_empty().all(|cell| parse_bool(cell).is_some()) {
        ColumnType::Bool
    } else {
        ColumnType::Text
    }
}

fn parse_bool(cell: &str) -> Option<bool> {
    if cell.eq_ignore_ascii_case("true") {
        Some(true)
    } else if cell.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

fn parse_text_cell(cell: &str, ty: ColumnType) -> Value {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    match ty {
        ColumnType::Int => trimmed.parse().map_or(Value::Null, Value::Int),
        ColumnType::Float => trimmed.parse().map_or(Value::Null, Value::Float),
        ColumnType::Bool => parse_bool(trimmed).map_or(Value::Null, Value::Bool),
        ColumnType::Text => Value::Text(cell.to_owned()),
    }
}

fn infer_json_column<'a>(values: impl Iterator<Item = &'a JsonValue> + Clone) -> ColumnType {
    let present = || values.clone().filter(|value| !value.is_null());
    if present().next().is_none() {
        ColumnType::Text
    } else if present().all(|value| value.as_i64().is_some()) {
        ColumnType::Int
    } else if present().all(JsonValue::is_number) {
        ColumnType::Float
    } else if present().all(JsonValue::is_boolean) {
        ColumnType::Bool
    } else {
        ColumnType::Text
    }
}

fn json_cell(value: &JsonValue, ty: ColumnType) -> Value {
    match (value, ty) {
        (JsonValue::Null, _) => Value::Null,
        (value, ColumnType::Int) => value.as_i64().map_or(Value::Null, Value::Int),
        (value, ColumnType::Float) => value.as_f64().map_or(Value::Null, Value::Float),
        (value, ColumnType::Bool) => value.as_bool().map_or(Value::Null, Value::Bool),
        (JsonValue::String(text), ColumnType::Text) => Value::Text(text.clone()),
        (other, ColumnType::Text) => Value::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|cell| (*cell).to_owned()).collect()
    }

    #[test]
    fn infers_column_types_from_text() {
        let table = Table::from_text_rows(
            strings(&["id", "amount", "active", "region"]),
            vec![
                strings(&["1", "10.5", "true", "north"]),
                strings(&["2", "3", "FALSE", "south"]),
                strings(&["", "", "", ""]),
            ],
        )
        .unwrap();

        let types: Vec<ColumnType> = table.schema().fields().iter().map(Field::ty).collect();
        assert_eq!(
            types,
            [ColumnType::Int, ColumnType::Float, ColumnType::Bool, ColumnType::Text]
        );
        assert_eq!(table.rows()[1][1], Value::Float(3.0));
        assert!(table.rows()[2].iter().all(Value::is_null));
    }

    #[test]
    fn rejects_ragged_rows() {
        let err = Table::from_text_rows(strings(&["a", "b"]), vec![strings(&["1"])])
            .expect_err("ragged");
        assert!(matches!(err, Error::InvalidTable { .. }));
    }

    #[test]
    fn json_records_fill_missing_keys_with_null() {
        let records: Vec<Map<String, JsonValue>> = serde_json::from_str(
            r#"[{"a": 1, "b": "x"}, {"a": 2.5}, {"b": "y", "c": {"nested": true}}]"#,
        )
        .unwrap();
        let table = Table::from_json_records(&records).unwrap();
        assert_eq!(table.schema().names(), ["a", "b", "c"]);
        assert_eq!(table.schema().fields()[0].ty(), ColumnType::Float);
        assert_eq!(table.rows()[1][1], Value::Null);
        assert_eq!(table.rows()[2][2], Value::Text("{\"nested\":true}".into()));
    }

    #[test]
    fn numeric_values_compare_across_types() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.5)), Some(Ordering::Less));
        assert_eq!(Value::Null.compare(&Value::Int(1)), None);
        assert_eq!(Value::Text("a".into()).compare(&Value::Int(1)), None);
    }

    #[test]
    fn new_coerces_ints_into_float_columns() {
        let schema = Schema::new(vec![Field::new("x", ColumnType::Float)]).unwrap();
        let table = Table::new(schema, vec![vec![Value::Int(3)]]).unwrap();
        assert_eq!(table.rows()[0][0], Value::Float(3.0));
    }

    #[test]
    fn render_truncates_long_tables() {
        let schema = Schema::new(vec![Field::new("n", ColumnType::Int)]).unwrap();
        let rows = (0..5).map(|n| vec![Value::Int(n)]).collect();
        let table = Table::new(schema, rows).unwrap();
        let text = table.render(2);
        assert!(text.starts_with("n\n0\n1\n"));
        assert!(text.contains("3 more rows"));
    }
}

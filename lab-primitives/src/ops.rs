//! Relational operations over [`Table`] values: filter, project, sort, and
//! grouped aggregation.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::table::{ColumnType, Field, Schema, Table, Value};

/// Comparison operator used by [`Predicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Substring match on text columns.
    Contains,
}

impl CompareOp {
    /// SQL rendering of the operator. `Contains` is rendered by the caller.
    #[must_use]
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Contains => "LIKE",
        }
    }
}

impl FromStr for CompareOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "==" | "=" | "eq" => Ok(Self::Eq),
            "!=" | "<>" | "ne" => Ok(Self::Ne),
            "<" | "lt" => Ok(Self::Lt),
            "<=" | "le" => Ok(Self::Le),
            ">" | "gt" => Ok(Self::Gt),
            ">=" | "ge" => Ok(Self::Ge),
            "contains" => Ok(Self::Contains),
            other => Err(Error::TypeMismatch {
                reason: format!("unknown comparison operator `{other}`"),
            }),
        }
    }
}

/// Row predicate of the form `column <op> value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// Column the predicate reads.
    pub column: String,
    /// Comparison operator.
    pub op: CompareOp,
    /// Literal the column is compared against.
    pub value: Value,
}

impl Predicate {
    /// Creates a predicate.
    #[must_use]
    pub fn new(column: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }

    /// Evaluates the predicate against a cell. Nulls never match.
    #[must_use]
    pub fn matches(&self, cell: &Value) -> bool {
        if cell.is_null() || self.value.is_null() {
            return false;
        }
        if self.op == CompareOp::Contains {
            return match (cell, &self.value) {
                (Value::Text(haystack), Value::Text(needle)) => haystack.contains(needle.as_str()),
                _ => false,
            };
        }
        let Some(ordering) = cell.compare(&self.value) else {
            return self.op == CompareOp::Ne;
        };
        match self.op {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
            CompareOp::Contains => false,
        }
    }
}

/// Aggregate function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    /// Row count, or non-null count when a column is given.
    Count,
    /// Sum of numeric values.
    Sum,
    /// Arithmetic mean of numeric values.
    Mean,
    /// Minimum value.
    Min,
    /// Maximum value.
    Max,
}

impl AggFunc {
    /// Lowercase function name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Min => "min",
            Self::Max => "max",
        }
    }

    /// SQL function name.
    #[must_use]
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Mean => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

impl Display for AggFunc {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggFunc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "count" => Ok(Self::Count),
            "sum" => Ok(Self::Sum),
            "mean" | "avg" => Ok(Self::Mean),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(Error::TypeMismatch {
                reason: format!("unknown aggregate `{other}`"),
            }),
        }
    }
}

/// One aggregate expression in a grouped aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Function to apply.
    pub func: AggFunc,
    /// Input column. `None` is only valid for [`AggFunc::Count`].
    pub column: Option<String>,
}

impl Aggregate {
    /// Creates an aggregate expression.
    #[must_use]
    pub fn new(func: AggFunc, column: Option<String>) -> Self {
        Self { func, column }
    }

    /// Output column name, e.g. `sum_amount` or `count`.
    #[must_use]
    pub fn output_name(&self) -> String {
        match &self.column {
            Some(column) => format!("{}_{column}", self.func),
            None => self.func.as_str().to_owned(),
        }
    }

    fn output_type(&self, input: Option<ColumnType>) -> Result<ColumnType> {
        match (self.func, input) {
            (AggFunc::Count, _) => Ok(ColumnType::Int),
            (_, None) => Err(Error::TypeMismatch {
                reason: format!("{} requires a column", self.func),
            }),
            (AggFunc::Sum, Some(ColumnType::Int)) => Ok(ColumnType::Int),
            (AggFunc::Sum | AggFunc::Mean, Some(ColumnType::Float | ColumnType::Int)) => {
                Ok(ColumnType::Float)
            }
            (AggFunc::Sum | AggFunc::Mean, Some(other)) => Err(Error::TypeMismatch {
                reason: format!("{} is not defined for {other} columns", self.func),
            }),
            (AggFunc::Min | AggFunc::Max, Some(ty)) => Ok(ty),
        }
    }
}

/// Streaming grouped aggregation.
///
/// Backends that scan column by column feed rows through [`Self::push`]
/// without materializing the input table.
#[derive(Debug)]
pub struct GroupedAggregation {
    schema: Schema,
    aggs: Vec<Aggregate>,
    groups: Vec<(Vec<Value>, Vec<Accumulator>)>,
    index: HashMap<String, usize>,
}

impl GroupedAggregation {
    /// Plans an aggregation against `input`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownColumn`] for unresolved columns and
    /// [`Error::TypeMismatch`] for aggregates that do not apply to the
    /// column type.
    pub fn plan(input: &Schema, group_by: &[String], aggs: &[Aggregate]) -> Result<Self> {
        if aggs.is_empty() && group_by.is_empty() {
            return Err(Error::TypeMismatch {
                reason: "aggregation needs at least one aggregate or group column".into(),
            });
        }
        let mut fields = Vec::with_capacity(group_by.len() + aggs.len());
        for column in group_by {
            let idx = input.index_of(column)?;
            fields.push(input.fields()[idx].clone());
        }
        for agg in aggs {
            let input_ty = match &agg.column {
                Some(column) => Some(input.fields()[input.index_of(column)?].ty()),
                None => None,
            };
            fields.push(Field::new(agg.output_name(), agg.output_type(input_ty)?));
        }
        Ok(Self {
            schema: Schema::new(fields)?,
            aggs: aggs.to_vec(),
            groups: Vec::new(),
            index: HashMap::new(),
        })
    }

    /// Output schema: group columns followed by one column per aggregate.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Feeds one row. `key` holds the group-by values and `inputs` one value
    /// per aggregate (use [`Value::Null`] for a bare `count`).
    pub fn push(&mut self, key: Vec<Value>, inputs: &[Value]) {
        let fingerprint = serde_json::to_string(&key).unwrap_or_default();
        let slot = if let Some(slot) = self.index.get(&fingerprint) {
            *slot
        } else {
            let accs = self.aggs.iter().map(Accumulator::new).collect();
            self.groups.push((key, accs));
            self.index.insert(fingerprint, self.groups.len() - 1);
            self.groups.len() - 1
        };
        for (acc, value) in self.groups[slot].1.iter_mut().zip(inputs) {
            acc.update(value);
        }
    }

    /// Produces the output table. An ungrouped aggregation over no rows still
    /// yields a single row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IntegerOverflow`] when an integer sum leaves the
    /// 64-bit range.
    pub fn finish(mut self) -> Result<Table> {
        let group_width = self.schema.len() - self.aggs.len();
        if self.groups.is_empty() && group_width == 0 {
            let accs = self.aggs.iter().map(Accumulator::new).collect();
            self.groups.push((Vec::new(), accs));
        }
        let mut rows = Vec::with_capacity(self.groups.len());
        for (mut key, accs) in self.groups {
            for (acc, agg) in accs.into_iter().zip(&self.aggs) {
                let value = acc.finish().ok_or_else(|| Error::IntegerOverflow {
                    column: agg.output_name(),
                })?;
                key.push(value);
            }
            rows.push(key);
        }
        Ok(Table::from_parts_unchecked(self.schema, rows))
    }
}

#[derive(Debug)]
struct Accumulator {
    func: AggFunc,
    counts_rows: bool,
    count: i64,
    int_sum: i128,
    float_sum: f64,
    saw_float: bool,
    best: Option<Value>,
}

impl Accumulator {
    fn new(agg: &Aggregate) -> Self {
        Self {
            func: agg.func,
            counts_rows: agg.column.is_none(),
            count: 0,
            int_sum: 0,
            float_sum: 0.0,
            saw_float: false,
            best: None,
        }
    }

    fn update(&mut self, value: &Value) {
        if self.counts_rows {
            self.count += 1;
            return;
        }
        if value.is_null() {
            return;
        }
        self.count += 1;
        match self.func {
            AggFunc::Count => {}
            AggFunc::Sum | AggFunc::Mean => match value {
                Value::Int(v) => self.int_sum += i128::from(*v),
                Value::Float(v) => {
                    self.saw_float = true;
                    self.float_sum += v;
                }
                _ => {}
            },
            AggFunc::Min | AggFunc::Max => {
                let replace = match &self.best {
                    None => true,
                    Some(best) => {
                        let ordering = value.compare(best);
                        if self.func == AggFunc::Min {
                            ordering == Some(Ordering::Less)
                        } else {
                            ordering == Some(Ordering::Greater)
                        }
                    }
                };
                if replace {
                    self.best = Some(value.clone());
                }
            }
        }
    }

    /// `None` when an integer sum does not fit in an `Int`.
    #[allow(clippy::cast_precision_loss)]
    fn finish(self) -> Option<Value> {
        Some(match self.func {
            AggFunc::Count => Value::Int(self.count),
            AggFunc::Sum if self.count == 0 => Value::Null,
            AggFunc::Sum if !self.saw_float => Value::Int(i64::try_from(self.int_sum).ok()?),
            AggFunc::Sum => Value::Float(self.int_sum as f64 + self.float_sum),
            AggFunc::Mean if self.count == 0 => Value::Null,
            AggFunc::Mean => {
                Value::Float((self.int_sum as f64 + self.float_sum) / self.count as f64)
            }
            AggFunc::Min | AggFunc::Max => self.best.unwrap_or(Value::Null),
        })
    }
}

impl Table {
    /// Keeps rows matching every predicate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownColumn`] if a predicate names a missing column.
    pub fn filter(&self, predicates: &[Predicate]) -> Result<Self> {
        let resolved = predicates
            .iter()
            .map(|pred| Ok((self.schema().index_of(&pred.column)?, pred)))
            .collect::<Result<Vec<_>>>()?;
        let rows = self
            .rows()
            .iter()
            .filter(|row| resolved.iter().all(|(idx, pred)| pred.matches(&row[*idx])))
            .cloned()
            .collect();
        Ok(Self::from_parts_unchecked(self.schema().clone(), rows))
    }

    /// Projects the named columns in the given order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownColumn`] if a column is missing.
    pub fn select(&self, columns: &[String]) -> Result<Self> {
        let indices = columns
            .iter()
            .map(|column| self.schema().index_of(column))
            .collect::<Result<Vec<_>>>()?;
        let schema = Schema::new(
            indices
                .iter()
                .map(|idx| self.schema().fields()[*idx].clone())
                .collect(),
        )?;
        let rows = self
            .rows()
            .iter()
            .map(|row| indices.iter().map(|idx| row[*idx].clone()).collect())
            .collect();
        Ok(Self::from_parts_unchecked(schema, rows))
    }

    /// Returns the first `n` rows.
    #[must_use]
    pub fn head(&self, n: usize) -> Self {
        Self::from_parts_unchecked(
            self.schema().clone(),
            self.rows().iter().take(n).cloned().collect(),
        )
    }

    /// Sorts rows by a column. Nulls sort last in either direction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownColumn`] if the column is missing.
    pub fn sort_by(&self, column: &str, descending: bool) -> Result<Self> {
        let idx = self.schema().index_of(column)?;
        let mut rows = self.rows().to_vec();
        rows.sort_by(|a, b| match (a[idx].is_null(), b[idx].is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ordering = a[idx].compare(&b[idx]).unwrap_or(Ordering::Equal);
                if descending { ordering.reverse() } else { ordering }
            }
        });
        Ok(Self::from_parts_unchecked(self.schema().clone(), rows))
    }

    /// Groups rows and evaluates aggregates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownColumn`] or [`Error::TypeMismatch`] when the
    /// aggregation cannot be planned.
    pub fn aggregate(&self, group_by: &[String], aggs: &[Aggregate]) -> Result<Self> {
        let mut plan = GroupedAggregation::plan(self.schema(), group_by, aggs)?;
        let key_idx = group_by
            .iter()
            .map(|column| self.schema().index_of(column))
            .collect::<Result<Vec<_>>>()?;
        let input_idx = aggs
            .iter()
            .map(|agg| {
                agg.column
                    .as_deref()
                    .map(|column| self.schema().index_of(column))
                    .transpose()
            })
            .collect::<Result<Vec<_>>>()?;
        for row in self.rows() {
            let key = key_idx.iter().map(|idx| row[*idx].clone()).collect();
            let inputs: Vec<Value> = input_idx
                .iter()
                .map(|idx| idx.map_or(Value::Null, |idx| row[idx].clone()))
                .collect();
            plan.push(key, &inputs);
        }
        plan.finish()
    }
}

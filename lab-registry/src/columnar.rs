//! Columnar tier: one immutable file per dataset, read through a memory map.
//!
//! File layout:
//!
//! ```text
//! magic "DLCOL1\0\0" | header_len: u64 LE | JSON header | column sections
//! ```
//!
//! Each column section holds one validity byte per row followed by the
//! values: little-endian `i64`/`f64`, one byte per `bool`, or for text
//! `row_count + 1` little-endian `u64` offsets followed by the UTF-8 bytes.
//! Spans in the header are relative to the first byte after the header.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use lab_primitives::{Aggregate, ColumnType, GroupedAggregation, Predicate, Schema, Table, Value};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dataset::{Backend, DatasetRef};
use crate::error::{RegistryError, RegistryResult};
use crate::source::TableSource;

const MAGIC: &[u8; 8] = b"DLCOL1\0\0";
const PREAMBLE_LEN: usize = MAGIC.len() + 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Span {
    offset: u64,
    len: u64,
}

impl Span {
    fn end(self) -> Option<u64> {
        self.offset.checked_add(self.len)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ColumnLayout {
    validity: Span,
    values: Span,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<Span>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    schema: Schema,
    row_count: u64,
    columns: Vec<ColumnLayout>,
}

/// Writes tables in the columnar file format.
#[derive(Debug, Clone)]
pub struct ColumnarWriter {
    dataset: String,
}

impl ColumnarWriter {
    /// Creates a writer; `dataset` is only used for error context.
    #[must_use]
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
        }
    }

    /// Writes `table` to `path`, returning the file size in bytes.
    ///
    /// The file is written under a temporary name and renamed into place, so
    /// a failed write never leaves a truncated file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] on I/O failures.
    pub fn write(&self, path: &Path, table: &Table) -> RegistryResult<u64> {
        let header = Self::layout(table);
        let header_bytes = serde_json::to_vec(&header).map_err(|err| self.error(err))?;
        let tmp = path.with_extension("dlcol.tmp");

        let result = self.write_file(&tmp, &header_bytes, table).and_then(|size| {
            fs::rename(&tmp, path).map_err(|err| self.error(err))?;
            Ok(size)
        });
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    fn write_file(&self, path: &Path, header: &[u8], table: &Table) -> RegistryResult<u64> {
        let file = File::create(path).map_err(|err| self.error(err))?;
        let mut out = BufWriter::new(file);
        let io = |res: std::io::Result<()>| res.map_err(|err| self.error(err));

        io(out.write_all(MAGIC))?;
        io(out.write_all(&(header.len() as u64).to_le_bytes()))?;
        io(out.write_all(header))?;

        for (col, field) in table.schema().fields().iter().enumerate() {
            let cells = || table.rows().iter().map(move |row| &row[col]);
            for cell in cells() {
                io(out.write_all(&[u8::from(!cell.is_null())]))?;
            }
            match field.ty() {
                ColumnType::Int => {
                    for cell in cells() {
                        let value = if let Value::Int(v) = cell { *v } else { 0 };
                        io(out.write_all(&value.to_le_bytes()))?;
                    }
                }
                ColumnType::Float => {
                    for cell in cells() {
                        let value = cell.as_f64().unwrap_or(0.0);
                        io(out.write_all(&value.to_le_bytes()))?;
                    }
                }
                ColumnType::Bool => {
                    for cell in cells() {
                        io(out.write_all(&[u8::from(matches!(cell, Value::Bool(true)))]))?;
                    }
                }
                ColumnType::Text => {
                    let mut offset = 0_u64;
                    io(out.write_all(&offset.to_le_bytes()))?;
                    for cell in cells() {
                        offset += text_len(cell);
                        io(out.write_all(&offset.to_le_bytes()))?;
                    }
                    for cell in cells() {
                        if let Value::Text(text) = cell {
                            io(out.write_all(text.as_bytes()))?;
                        }
                    }
                }
            }
        }

        io(out.flush())?;
        let file = out.into_inner().map_err(|err| self.error(err.into_error()))?;
        io(file.sync_all())?;
        let size = file.metadata().map_err(|err| self.error(err))?.len();
        Ok(size)
    }

    fn layout(table: &Table) -> Header {
        let rows = table.row_count() as u64;
        let mut cursor = 0_u64;
        let mut take = |len: u64| {
            let span = Span {
                offset: cursor,
                len,
            };
            cursor += len;
            span
        };

        let columns = table
            .schema()
            .fields()
            .iter()
            .enumerate()
            .map(|(col, field)| {
                let validity = take(rows);
                match field.ty() {
                    ColumnType::Int | ColumnType::Float => ColumnLayout {
                        validity,
                        values: take(rows * 8),
                        text: None,
                    },
                    ColumnType::Bool => ColumnLayout {
                        validity,
                        values: take(rows),
                        text: None,
                    },
                    ColumnType::Text => {
                        let values = take((rows + 1) * 8);
                        let bytes = table.rows().iter().map(|row| text_len(&row[col])).sum();
                        ColumnLayout {
                            validity,
                            values,
                            text: Some(take(bytes)),
                        }
                    }
                }
            })
            .collect();

        Header {
            schema: table.schema().clone(),
            row_count: rows,
            columns,
        }
    }

    fn error(&self, err: impl ToString) -> RegistryError {
        RegistryError::storage(&self.dataset, Backend::Columnar, err)
    }
}

fn text_len(cell: &Value) -> u64 {
    match cell {
        Value::Text(text) => text.len() as u64,
        _ => 0,
    }
}

/// Read-only handle on a columnar file.
#[derive(Debug)]
pub struct ColumnarTable {
    name: String,
    path: PathBuf,
    map: Mmap,
    body: usize,
    schema: Schema,
    rows: usize,
    columns: Vec<ColumnLayout>,
    retired: AtomicBool,
}

impl ColumnarTable {
    /// Maps `path` and validates its layout.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] if the file cannot be mapped or its
    /// layout is inconsistent.
    pub fn open(name: &str, path: &Path) -> RegistryResult<Self> {
        let fail = |reason: String| RegistryError::storage(name, Backend::Columnar, reason);

        let file = File::open(path).map_err(|err| fail(format!("{}: {err}", path.display())))?;
        // SAFETY: columnar files are written once under a temporary name and
        // renamed into place; nothing writes to them afterwards.
        let map = unsafe { Mmap::map(&file) }.map_err(|err| fail(err.to_string()))?;

        if map.len() < PREAMBLE_LEN || &map[..MAGIC.len()] != MAGIC {
            return Err(fail("not a columnar file".into()));
        }
        let mut len_bytes = [0_u8; 8];
        len_bytes.copy_from_slice(&map[MAGIC.len()..PREAMBLE_LEN]);
        let header_len = usize::try_from(u64::from_le_bytes(len_bytes))
            .map_err(|_| fail("header length overflows".into()))?;
        let body = PREAMBLE_LEN
            .checked_add(header_len)
            .filter(|end| *end <= map.len())
            .ok_or_else(|| fail("header extends past end of file".into()))?;
        let header: Header = serde_json::from_slice(&map[PREAMBLE_LEN..body])
            .map_err(|err| fail(format!("invalid header: {err}")))?;

        let table = Self {
            name: name.to_owned(),
            path: path.to_path_buf(),
            body,
            rows: usize::try_from(header.row_count)
                .map_err(|_| fail("row count overflows".into()))?,
            schema: header.schema,
            columns: header.columns,
            map,
            retired: AtomicBool::new(false),
        };
        table.check_layout().map_err(fail)?;
        debug!(dataset = name, path = %path.display(), rows = table.rows, "opened columnar dataset");
        Ok(table)
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_layout(&self) -> Result<(), String> {
        if self.columns.len() != self.schema.len() {
            return Err("column layout does not match schema".into());
        }
        let body_len = (self.map.len() - self.body) as u64;
        let rows = self.rows as u64;
        let within = |span: Span| span.end().is_some_and(|end| end <= body_len);

        for (field, layout) in self.schema.fields().iter().zip(&self.columns) {
            let expected_values = match field.ty() {
                ColumnType::Int | ColumnType::Float => rows.checked_mul(8),
                ColumnType::Bool => Some(rows),
                ColumnType::Text => rows.checked_add(1).and_then(|n| n.checked_mul(8)),
            };
            if layout.validity.len != rows || Some(layout.values.len) != expected_values {
                return Err(format!("column `{}` has inconsistent lengths", field.name()));
            }
            if !within(layout.validity) || !within(layout.values) {
                return Err(format!("column `{}` extends past end of file", field.name()));
            }
            if field.ty() == ColumnType::Text {
                let text = layout
                    .text
                    .filter(|span| within(*span))
                    .ok_or_else(|| format!("column `{}` has no valid text section", field.name()))?;
                let mut previous = 0_u64;
                for idx in 0..=self.rows {
                    let offset = read_u64(self.section(layout.values), idx);
                    if (idx == 0 && offset != 0) || offset < previous || offset > text.len {
                        return Err(format!("column `{}` has corrupt text offsets", field.name()));
                    }
                    previous = offset;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn section(&self, span: Span) -> &[u8] {
        let start = self.body + span.offset as usize;
        &self.map[start..start + span.len as usize]
    }

    #[allow(clippy::cast_possible_truncation)]
    fn cell(&self, col: usize, row: usize) -> RegistryResult<Value> {
        let layout = &self.columns[col];
        if self.section(layout.validity)[row] == 0 {
            return Ok(Value::Null);
        }
        let values = self.section(layout.values);
        Ok(match self.schema.fields()[col].ty() {
            ColumnType::Int => Value::Int(i64::from_le_bytes(read_u64(values, row).to_le_bytes())),
            ColumnType::Float => Value::Float(f64::from_bits(read_u64(values, row))),
            ColumnType::Bool => Value::Bool(values[row] != 0),
            ColumnType::Text => {
                let start = read_u64(values, row) as usize;
                let end = read_u64(values, row + 1) as usize;
                let bytes = layout.text.map(|span| self.section(span)).unwrap_or_default();
                let text = std::str::from_utf8(&bytes[start..end]).map_err(|err| {
                    RegistryError::storage(&self.name, Backend::Columnar, format!("invalid text: {err}"))
                })?;
                Value::Text(text.to_owned())
            }
        })
    }

    fn read_row(&self, columns: &[usize], row: usize) -> RegistryResult<Vec<Value>> {
        columns.iter().map(|col| self.cell(*col, row)).collect()
    }

    fn resolve(&self, columns: &[String]) -> RegistryResult<Vec<usize>> {
        Ok(columns
            .iter()
            .map(|column| self.schema.index_of(column))
            .collect::<Result<Vec<_>, _>>()?)
    }
}

fn read_u64(bytes: &[u8], idx: usize) -> u64 {
    let mut buf = [0_u8; 8];
    buf.copy_from_slice(&bytes[idx * 8..idx * 8 + 8]);
    u64::from_le_bytes(buf)
}

impl TableSource for ColumnarTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend(&self) -> Backend {
        Backend::Columnar
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn row_count(&self) -> u64 {
        self.rows as u64
    }

    fn scan(&self, projection: Option<&[String]>, limit: Option<usize>) -> RegistryResult<Table> {
        let (schema, columns) = match projection {
            Some(names) => {
                let columns = self.resolve(names)?;
                let fields = columns
                    .iter()
                    .map(|col| self.schema.fields()[*col].clone())
                    .collect();
                (Schema::new(fields)?, columns)
            }
            None => (self.schema.clone(), (0..self.schema.len()).collect()),
        };
        let take = limit.unwrap_or(self.rows).min(self.rows);
        let rows = (0..take)
            .map(|row| self.read_row(&columns, row))
            .collect::<RegistryResult<Vec<_>>>()?;
        Ok(Table::new(schema, rows)?)
    }

    fn filter(&self, predicates: &[Predicate], limit: Option<usize>) -> RegistryResult<Table> {
        let targets = predicates
            .iter()
            .map(|pred| Ok((self.schema.index_of(&pred.column)?, pred)))
            .collect::<RegistryResult<Vec<_>>>()?;
        let all: Vec<usize> = (0..self.schema.len()).collect();
        let limit = limit.unwrap_or(usize::MAX);

        let mut rows = Vec::new();
        for row in 0..self.rows {
            if rows.len() >= limit {
                break;
            }
            let mut keep = true;
            for (col, pred) in &targets {
                if !pred.matches(&self.cell(*col, row)?) {
                    keep = false;
                    break;
                }
            }
            if keep {
                rows.push(self.read_row(&all, row)?);
            }
        }
        Ok(Table::new(self.schema.clone(), rows)?)
    }

    fn aggregate(&self, group_by: &[String], aggs: &[Aggregate]) -> RegistryResult<Table> {
        let mut plan = GroupedAggregation::plan(&self.schema, group_by, aggs)?;
        let keys = self.resolve(group_by)?;
        let inputs = aggs
            .iter()
            .map(|agg| {
                agg.column
                    .as_deref()
                    .map(|column| self.schema.index_of(column))
                    .transpose()
            })
            .collect::<Result<Vec<_>, _>>()?;

        for row in 0..self.rows {
            let key = self.read_row(&keys, row)?;
            let values = inputs
                .iter()
                .map(|col| col.map_or(Ok(Value::Null), |col| self.cell(col, row)))
                .collect::<RegistryResult<Vec<_>>>()?;
            plan.push(key, &values);
        }
        Ok(plan.finish()?)
    }

    fn reference(&self) -> Option<DatasetRef> {
        Some(DatasetRef::Columnar {
            path: self.path.clone(),
        })
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

impl Drop for ColumnarTable {
    fn drop(&mut self) {
        if self.retired.load(Ordering::Acquire) {
            if let Err(err) = fs::remove_file(&self.path) {
                warn!(dataset = %self.name, path = %self.path.display(), %err, "failed to remove retired columnar file");
            } else {
                debug!(dataset = %self.name, path = %self.path.display(), "removed retired columnar file");
            }
        }
    }
}

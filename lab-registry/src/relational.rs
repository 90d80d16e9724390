//! Relational tier: one SQLite database per registry session.
//!
//! Schema changes go through a single writer connection guarded by a mutex.
//! Reads open their own read-only connections so they never contend with
//! the writer.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use lab_primitives::{
    Aggregate, ColumnType, CompareOp, Field, GroupedAggregation, Predicate, Schema, Table, Value,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params_from_iter};
use tracing::{debug, info};

use crate::dataset::{Backend, DatasetRef};
use crate::error::{RegistryError, RegistryResult};
use crate::source::TableSource;

/// Opens a read-only connection on `path`.
///
/// # Errors
///
/// Propagates SQLite open failures.
pub fn open_read_only(path: &Path) -> rusqlite::Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
}

/// Quotes an identifier for interpolation into SQL text.
#[must_use]
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Converts a SQLite cell into a table value.
#[must_use]
pub fn value_from_sql(cell: ValueRef<'_>) -> Value {
    match cell {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Float(v),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn value_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Int(v) => SqlValue::Integer(*v),
        Value::Float(v) => SqlValue::Real(*v),
        Value::Bool(v) => SqlValue::Integer(i64::from(*v)),
        Value::Text(v) => SqlValue::Text(v.clone()),
    }
}

fn column_type_from_decl(decl: &str) -> ColumnType {
    let decl = decl.to_ascii_uppercase();
    if decl.contains("BOOL") {
        ColumnType::Bool
    } else if decl.contains("INT") {
        ColumnType::Int
    } else if decl.contains("REAL") || decl.contains("FLOA") || decl.contains("DOUB") {
        ColumnType::Float
    } else {
        ColumnType::Text
    }
}

/// Writer side of the session database.
#[derive(Debug)]
pub struct RelationalStore {
    path: PathBuf,
    writer: Mutex<Connection>,
}

impl RelationalStore {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] if the database cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> RegistryResult<Self> {
        let path = path.into();
        let fail = |err: rusqlite::Error| RegistryError::storage("*", Backend::Relational, err);
        let conn = Connection::open(&path).map_err(fail)?;
        conn.execute_batch(
            r"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )
        .map_err(fail)?;
        info!(path = %path.display(), "opened relational store");
        Ok(Self {
            path,
            writer: Mutex::new(conn),
        })
    }

    /// Path of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns whether `table` exists in the database catalog.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] if the catalog cannot be read.
    pub fn table_exists(&self, table: &str) -> RegistryResult<bool> {
        let fail = |err: rusqlite::Error| RegistryError::storage(table, Backend::Relational, err);
        let conn = open_read_only(&self.path).map_err(fail)?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()
            .map_err(fail)?;
        Ok(found.is_some())
    }

    /// Creates `name` and copies every row of `data` into it inside one
    /// transaction. With `replace`, an existing table of the same name is
    /// dropped in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] on any SQLite failure; the
    /// transaction is rolled back.
    ///
    /// # Panics
    ///
    /// Panics if the writer mutex has been poisoned.
    pub fn create_table(&self, name: &str, data: &Table, replace: bool) -> RegistryResult<()> {
        let fail = |err: rusqlite::Error| RegistryError::storage(name, Backend::Relational, err);
        let quoted = quote_ident(name);
        let columns = data
            .schema()
            .fields()
            .iter()
            .map(|field| format!("{} {}", quote_ident(field.name()), field.ty().sql_type()))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; data.column_count()].join(", ");

        let mut conn = self.writer.lock().expect("relational writer poisoned");
        let tx = conn.transaction().map_err(fail)?;
        if replace {
            tx.execute(&format!("DROP TABLE IF EXISTS {quoted}"), [])
                .map_err(fail)?;
        }
        tx.execute(&format!("CREATE TABLE {quoted} ({columns})"), [])
            .map_err(fail)?;
        {
            let mut insert = tx
                .prepare(&format!("INSERT INTO {quoted} VALUES ({placeholders})"))
                .map_err(fail)?;
            for row in data.rows() {
                insert
                    .execute(params_from_iter(row.iter().map(value_to_sql)))
                    .map_err(fail)?;
            }
        }
        tx.commit().map_err(fail)?;

        debug!(table = name, rows = data.row_count(), "created relational table");
        Ok(())
    }

    /// Drops `name` if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] on SQLite failure.
    ///
    /// # Panics
    ///
    /// Panics if the writer mutex has been poisoned.
    pub fn drop_table(&self, name: &str) -> RegistryResult<()> {
        let conn = self.writer.lock().expect("relational writer poisoned");
        conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)), [])
            .map_err(|err| RegistryError::storage(name, Backend::Relational, err))?;
        debug!(table = name, "dropped relational table");
        Ok(())
    }

    /// Opens a read handle on `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] if the table cannot be read.
    pub fn open_table(&self, name: &str) -> RegistryResult<SqliteTable> {
        SqliteTable::open(&self.path, name)
    }
}

/// Read handle on one table of a SQLite database.
#[derive(Debug)]
pub struct SqliteTable {
    database: PathBuf,
    table: String,
    schema: Schema,
    rows: u64,
}

impl SqliteTable {
    /// Opens `table` inside `database`, reading its schema and row count.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Storage`] if the database or table cannot be
    /// read.
    pub fn open(database: &Path, table: &str) -> RegistryResult<Self> {
        let fail = |err: rusqlite::Error| RegistryError::storage(table, Backend::Relational, err);
        let conn = open_read_only(database).map_err(fail)?;

        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
            .map_err(fail)?;
        let fields = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let decl: String = row.get(2)?;
                Ok(Field::new(name, column_type_from_decl(&decl)))
            })
            .map_err(fail)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(fail)?;
        if fields.is_empty() {
            return Err(RegistryError::storage(
                table,
                Backend::Relational,
                "table does not exist",
            ));
        }

        let rows: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)), [], |row| {
                row.get(0)
            })
            .map_err(fail)?;

        Ok(Self {
            database: database.to_path_buf(),
            table: table.to_owned(),
            schema: Schema::new(fields)?,
            rows: u64::try_from(rows).unwrap_or_default(),
        })
    }

    fn fail(&self, err: impl ToString) -> RegistryError {
        RegistryError::storage(&self.table, Backend::Relational, err)
    }

    fn run(&self, sql: &str, params: Vec<SqlValue>, schema: Schema) -> RegistryResult<Table> {
        let conn = open_read_only(&self.database).map_err(|err| self.fail(err))?;
        let mut stmt = conn.prepare(sql).map_err(|err| self.fail(err))?;
        let width = schema.len();
        let rows = stmt
            .query_map(params_from_iter(params), |row| {
                (0..width)
                    .map(|idx| row.get_ref(idx).map(value_from_sql))
                    .collect::<Result<Vec<_>, _>>()
            })
            .map_err(|err| self.fail(err))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| self.fail(err))?;
        Ok(Table::new(schema, rows)?)
    }

    fn projection(&self, columns: &[String]) -> RegistryResult<(Schema, String)> {
        let fields = columns
            .iter()
            .map(|column| Ok(self.schema.fields()[self.schema.index_of(column)?].clone()))
            .collect::<RegistryResult<Vec<_>>>()?;
        let list = columns
            .iter()
            .map(|column| quote_ident(column))
            .collect::<Vec<_>>()
            .join(", ");
        Ok((Schema::new(fields)?, list))
    }
}

fn limit_clause(limit: Option<usize>) -> String {
    limit.map_or_else(String::new, |limit| format!(" LIMIT {limit}"))
}

impl TableSource for SqliteTable {
    fn name(&self) -> &str {
        &self.table
    }

    fn backend(&self) -> Backend {
        Backend::Relational
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn row_count(&self) -> u64 {
        self.rows
    }

    fn scan(&self, projection: Option<&[String]>, limit: Option<usize>) -> RegistryResult<Table> {
        let (schema, list) = match projection {
            Some(columns) => self.projection(columns)?,
            None => self.projection(&self.schema.names())?,
        };
        let sql = format!(
            "SELECT {list} FROM {}{}",
            quote_ident(&self.table),
            limit_clause(limit)
        );
        self.run(&sql, Vec::new(), schema)
    }

    fn filter(&self, predicates: &[Predicate], limit: Option<usize>) -> RegistryResult<Table> {
        let (schema, list) = self.projection(&self.schema.names())?;
        let mut clauses = Vec::with_capacity(predicates.len());
        let mut params = Vec::with_capacity(predicates.len());
        for pred in predicates {
            self.schema.index_of(&pred.column)?;
            let column = quote_ident(&pred.column);
            if pred.op == CompareOp::Contains {
                clauses.push(format!("instr({column}, ?) > 0"));
            } else {
                clauses.push(format!("{column} {} ?", pred.op.sql()));
            }
            params.push(value_to_sql(&pred.value));
        }
        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {list} FROM {}{filter}{}",
            quote_ident(&self.table),
            limit_clause(limit)
        );
        self.run(&sql, params, schema)
    }

    fn aggregate(&self, group_by: &[String], aggs: &[Aggregate]) -> RegistryResult<Table> {
        let plan = GroupedAggregation::plan(&self.schema, group_by, aggs)?;
        let groups: Vec<String> = group_by.iter().map(|column| quote_ident(column)).collect();
        let exprs = groups.iter().cloned().chain(aggs.iter().map(|agg| {
            let input = agg
                .column
                .as_deref()
                .map_or_else(|| "*".to_owned(), quote_ident);
            format!("{}({input})", agg.func.sql())
        }));
        let mut sql = format!(
            "SELECT {} FROM {}",
            exprs.collect::<Vec<_>>().join(", "),
            quote_ident(&self.table)
        );
        if !groups.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", groups.join(", ")));
        }
        self.run(&sql, Vec::new(), plan.schema().clone())
    }

    fn reference(&self) -> Option<DatasetRef> {
        Some(DatasetRef::Relational {
            database: self.database.clone(),
            table: self.table.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_primitives::AggFunc;

    fn events() -> Table {
        let schema = Schema::new(vec![
            Field::new("kind", ColumnType::Text),
            Field::new("ms", ColumnType::Int),
            Field::new("ok", ColumnType::Bool),
        ])
        .unwrap();
        Table::new(
            schema,
            vec![
                vec![Value::Text("click".into()), Value::Int(10), Value::Bool(true)],
                vec![Value::Text("view".into()), Value::Int(30), Value::Bool(false)],
                vec![Value::Text("click".into()), Value::Int(5), Value::Null],
            ],
        )
        .unwrap()
    }

    #[test]
    fn create_table_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = RelationalStore::open(dir.path().join("session.db")).unwrap();
        assert!(!store.table_exists("events").unwrap());

        store.create_table("events", &events(), false).unwrap();
        assert!(store.table_exists("events").unwrap());

        let table = store.open_table("events").unwrap();
        assert_eq!(table.row_count(), 3);
        assert_eq!(table.schema(), events().schema());
        assert_eq!(table.collect().unwrap(), events());
    }

    #[test]
    fn create_without_replace_fails_on_existing_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = RelationalStore::open(dir.path().join("session.db")).unwrap();
        store.create_table("events", &events(), false).unwrap();
        let err = store
            .create_table("events", &events(), false)
            .expect_err("duplicate table");
        assert!(matches!(err, RegistryError::Storage { backend: Backend::Relational, .. }));
        store.create_table("events", &events().head(1), true).unwrap();
        assert_eq!(store.open_table("events").unwrap().row_count(), 1);
    }

    #[test]
    fn filter_and_aggregate_push_down_to_sql() {
        let dir = tempfile::tempdir().unwrap();
        let store = RelationalStore::open(dir.path().join("session.db")).unwrap();
        store.create_table("events", &events(), false).unwrap();
        let table = store.open_table("events").unwrap();

        let clicks = table
            .filter(
                &[Predicate::new("kind", CompareOp::Contains, Value::Text("lic".into()))],
                None,
            )
            .unwrap();
        assert_eq!(clicks.row_count(), 2);

        let totals = table
            .aggregate(
                &["kind".into()],
                &[
                    Aggregate::new(AggFunc::Count, None),
                    Aggregate::new(AggFunc::Sum, Some("ms".into())),
                ],
            )
            .unwrap();
        assert_eq!(
            totals.rows()[0],
            vec![Value::Text("click".into()), Value::Int(2), Value::Int(15)]
        );
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}

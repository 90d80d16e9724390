//! Read-only query execution against the session database.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lab_policy::{PolicyError, QueryGuard, QueryValidator};
use lab_primitives::{ErrorKind, Value};
use lab_registry::{open_read_only, value_from_sql};
use rusqlite::InterruptHandle;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Default row cap for query results.
pub const DEFAULT_MAX_ROWS: usize = 10_000;

/// Virtual machine steps between deadline checks.
const PROGRESS_OPS: std::ffi::c_int = 1_000;

/// Bounds applied to every query.
#[derive(Debug, Clone, Copy)]
pub struct QueryConfig {
    /// Rows returned before the result is cut and flagged truncated.
    pub max_rows: usize,
    /// Wall-clock limit; the statement is interrupted when it elapses.
    pub timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            timeout: lab_policy::DEFAULT_TIMEOUT,
        }
    }
}

/// Rows produced by a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryOutput {
    /// Result column names.
    pub columns: Vec<String>,
    /// Result rows, at most `max_rows`.
    pub rows: Vec<Vec<Value>>,
    /// Number of rows returned.
    pub row_count: usize,
    /// Number of result columns.
    pub column_count: usize,
    /// Time spent running the statement.
    #[serde(skip)]
    pub elapsed: Duration,
    /// True when more rows existed than were returned.
    pub truncated: bool,
    /// Validator warnings, such as text the grammar pass could not parse.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Validates and runs queries on read-only connections.
pub struct QueryEngine {
    database: PathBuf,
    config: QueryConfig,
    guard: Arc<dyn QueryGuard>,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("database", &self.database)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueryEngine {
    /// Creates an engine over `database` guarded by the default validator.
    #[must_use]
    pub fn new(database: impl Into<PathBuf>, config: QueryConfig) -> Self {
        Self {
            database: database.into(),
            config,
            guard: Arc::new(QueryValidator::new()),
        }
    }

    /// Replaces the query guard.
    #[must_use]
    pub fn with_guard(mut self, guard: Arc<dyn QueryGuard>) -> Self {
        self.guard = guard;
        self
    }

    /// Database the engine reads.
    #[must_use]
    pub fn database(&self) -> &Path {
        &self.database
    }

    /// Validates `sql` without running it.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Rejected`] when the guard refuses the text.
    pub fn validate(&self, sql: &str) -> QueryResult<ValidatedQuery> {
        let decision = self.guard.validate(sql)?;
        for warning in decision.warnings() {
            warn!(warning = %warning, "query allowed with warning");
        }
        Ok(ValidatedQuery {
            sql: sql.to_owned(),
            warnings: decision.warnings().to_vec(),
        })
    }

    /// Validates and runs `sql`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Rejected`] before touching the database when the
    /// guard refuses the text; otherwise as [`QueryEngine::run_validated`].
    pub async fn run(&self, sql: &str) -> QueryResult<QueryOutput> {
        let query = self.validate(sql)?;
        self.run_validated(query).await
    }

    /// Runs a query that already passed [`QueryEngine::validate`].
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Timeout`] when the deadline elapses,
    /// [`QueryError::Sql`] when the engine rejects the statement, and
    /// [`QueryError::Storage`] when the database cannot be opened.
    pub async fn run_validated(&self, query: ValidatedQuery) -> QueryResult<QueryOutput> {
        let ValidatedQuery { sql, warnings } = query;
        let timeout = self.config.timeout;
        let (handle_tx, handle_rx) = oneshot::channel();
        let database = self.database.clone();
        let max_rows = self.config.max_rows;
        let mut task = tokio::task::spawn_blocking(move || {
            run_blocking(&database, &sql, max_rows, timeout, handle_tx)
        });

        let mut output = match tokio::time::timeout(timeout, &mut task).await {
            Ok(joined) => joined
                .map_err(|err| QueryError::Internal(format!("query task failed: {err}")))??,
            Err(_) => {
                if let Ok(handle) = handle_rx.await {
                    handle.interrupt();
                }
                debug!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "query interrupted"
                );
                return Err(QueryError::Timeout { timeout });
            }
        };
        output.warnings = warnings;
        debug!(
            rows = output.row_count,
            columns = output.column_count,
            truncated = output.truncated,
            elapsed_ms = u64::try_from(output.elapsed.as_millis()).unwrap_or(u64::MAX),
            "query finished"
        );
        Ok(output)
    }
}

/// Query text that passed the guard, with any warnings it produced.
#[derive(Debug, Clone)]
pub struct ValidatedQuery {
    sql: String,
    warnings: Vec<String>,
}

impl ValidatedQuery {
    /// Validated text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Warnings raised during validation.
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

fn run_blocking(
    database: &Path,
    sql: &str,
    max_rows: usize,
    timeout: Duration,
    handle_tx: oneshot::Sender<InterruptHandle>,
) -> QueryResult<QueryOutput> {
    let started = Instant::now();
    let deadline = started + timeout;
    let conn = open_read_only(database).map_err(|err| QueryError::Storage(err.to_string()))?;
    // An interrupt sent before the first step is lost, so the statement
    // also polls the deadline itself.
    conn.progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));
    let _ = handle_tx.send(conn.get_interrupt_handle());

    let fail = |err: rusqlite::Error| classify(err, timeout);
    let mut stmt = conn.prepare(sql).map_err(fail)?;
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_owned)
        .collect();
    let column_count = columns.len();

    let mut rows = Vec::new();
    let mut truncated = false;
    let mut cursor = stmt.query([]).map_err(fail)?;
    while let Some(row) = cursor.next().map_err(fail)? {
        if rows.len() == max_rows {
            truncated = true;
            break;
        }
        if Instant::now() >= deadline {
            return Err(QueryError::Timeout { timeout });
        }
        let mut values = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            values.push(value_from_sql(row.get_ref(idx).map_err(fail)?));
        }
        rows.push(values);
    }

    Ok(QueryOutput {
        row_count: rows.len(),
        columns,
        rows,
        column_count,
        elapsed: started.elapsed(),
        truncated,
        warnings: Vec::new(),
    })
}

fn classify(err: rusqlite::Error, timeout: Duration) -> QueryError {
    let interrupted = matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::OperationInterrupted)
    );
    if interrupted {
        return QueryError::Timeout { timeout };
    }
    QueryError::Sql(err.to_string())
}

/// Errors raised while running a query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Guard refused the query text.
    #[error(transparent)]
    Rejected(#[from] PolicyError),
    /// Deadline elapsed and the statement was interrupted.
    #[error("query exceeded timeout of {}s", timeout.as_secs_f64())]
    Timeout {
        /// Limit that applied.
        timeout: Duration,
    },
    /// Engine rejected the statement.
    #[error("query failed: {0}")]
    Sql(String),
    /// Database could not be opened.
    #[error("cannot open relational store: {0}")]
    Storage(String),
    /// Unexpected internal failure.
    #[error("internal query error: {0}")]
    Internal(String),
}

impl QueryError {
    /// Maps the error onto the shared taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected(err) => err.kind(),
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Sql(_) => ErrorKind::ValidationError,
            Self::Storage(_) => ErrorKind::StorageError,
            Self::Internal(_) => ErrorKind::InternalError,
        }
    }
}

/// Result alias for query operations.
pub type QueryResult<T> = Result<T, QueryError>;

//! Request dispatch: maps tool calls onto registry, sandbox, supervisor, and
//! query operations and folds every outcome into a uniform response.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lab_policy::SecurityPolicy;
use lab_primitives::{DatasetName, Error as PrimitiveError, ErrorKind};
use lab_registry::{Backend, DataFormat, DataRegistry, DataSource, RegistryError, StoreOptions};
use lab_sandbox::{PathGuard, SandboxBuilder, SandboxError, ScriptError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json, json};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::query::{QueryConfig, QueryEngine, QueryError};
use crate::supervisor::{CodeExecutor, ExecuteOptions, ExecutionResult, SupervisorError};

/// Longest request line [`Dispatcher::serve`] accepts by default.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// Inbound tool invocation, tagged by `tool`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    /// Register a file as a dataset.
    Load {
        /// Source file.
        path: PathBuf,
        /// Dataset name.
        name: String,
        /// Source format; inferred from the extension when absent.
        #[serde(default)]
        format: Option<DataFormat>,
        /// Forced tier.
        #[serde(default)]
        backend: Option<Backend>,
        /// Size used for tier selection instead of the file size.
        #[serde(default)]
        size_hint: Option<u64>,
        /// Replace an existing dataset of the same name.
        #[serde(default)]
        overwrite: bool,
    },
    /// Run analysis code in a worker.
    Execute {
        /// Script source.
        code: String,
        /// Datasets placed in the scope.
        #[serde(default)]
        datasets: Vec<String>,
        /// Deadline override in seconds.
        #[serde(default)]
        timeout_secs: Option<f64>,
        /// Capture artifacts.
        #[serde(default)]
        want_artifacts: bool,
    },
    /// Run a read-only query.
    Query {
        /// Query text.
        sql: String,
        /// Dataset promoted to the relational tier first.
        #[serde(default)]
        dataset: Option<String>,
    },
    /// List registered datasets.
    ListDatasets,
    /// Describe one dataset.
    DatasetInfo {
        /// Dataset name.
        name: String,
    },
    /// Move a dataset into the relational tier.
    Promote {
        /// Dataset name.
        name: String,
    },
    /// Drop a dataset.
    Remove {
        /// Dataset name.
        name: String,
    },
}

impl ToolCall {
    /// Wire name of the tool.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Load { .. } => "load",
            Self::Execute { .. } => "execute",
            Self::Query { .. } => "query",
            Self::ListDatasets => "list_datasets",
            Self::DatasetInfo { .. } => "dataset_info",
            Self::Promote { .. } => "promote",
            Self::Remove { .. } => "remove",
        }
    }
}

/// Structured error carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Extra fields, such as the dataset and backend of a storage error.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Json>,
}

impl ToolError {
    /// Error without context.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Map::new(),
        }
    }

    /// Adds a context field.
    #[must_use]
    pub fn with_context(mut self, key: &str, value: impl Into<Json>) -> Self {
        self.context.insert(key.to_owned(), value.into());
        self
    }
}

/// Uniform response returned for every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    /// True when the call succeeded.
    pub ok: bool,
    /// Tool that was invoked.
    pub tool: String,
    /// Result payload. Failed executions still carry their captured output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Json>,
    /// Error details when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResponse {
    /// Successful response.
    #[must_use]
    pub fn success(tool: &str, content: Json) -> Self {
        Self {
            ok: true,
            tool: tool.to_owned(),
            content: Some(content),
            error: None,
        }
    }

    /// Failed response without content.
    #[must_use]
    pub fn failure(tool: &str, error: ToolError) -> Self {
        Self {
            ok: false,
            tool: tool.to_owned(),
            content: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Error)]
enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Name(#[from] PrimitiveError),
    #[error("invalid code: {0}")]
    Syntax(ScriptError),
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl DispatchError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Registry(err) => err.kind(),
            Self::Sandbox(err) => err.kind(),
            Self::Supervisor(err) => err.kind(),
            Self::Query(err) => err.kind(),
            Self::Name(err) => err.kind(),
            Self::Syntax(err) => err.kind(),
            Self::Invalid(_) => ErrorKind::ValidationError,
        }
    }

    fn into_tool_error(self) -> ToolError {
        let base = ToolError::new(self.kind(), self.to_string());
        match self {
            Self::Registry(RegistryError::NotFound { name })
            | Self::Sandbox(SandboxError::Registry(RegistryError::NotFound { name })) => {
                base.with_context("dataset", name)
            }
            Self::Registry(RegistryError::Storage {
                dataset, backend, ..
            })
            | Self::Sandbox(SandboxError::Registry(RegistryError::Storage {
                dataset, backend, ..
            })) => base
                .with_context("dataset", dataset)
                .with_context("backend", backend.as_str()),
            Self::Sandbox(SandboxError::PathDenied { path }) => {
                base.with_context("path", path.display().to_string())
            }
            Self::Syntax(err) => match err.line() {
                Some(line) => base.with_context("line", line),
                None => base,
            },
            _ => base,
        }
    }
}

type DispatchResult<T> = Result<T, DispatchError>;

/// Routes tool calls to the components that serve them.
pub struct Dispatcher {
    registry: Arc<DataRegistry>,
    sandbox: SandboxBuilder,
    executor: Arc<dyn CodeExecutor>,
    queries: QueryEngine,
    policy: SecurityPolicy,
    load_guard: PathGuard,
    max_request_bytes: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("queries", &self.queries)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Wires a dispatcher over `registry`.
    ///
    /// Load paths are checked against the policy's path allow-list, with
    /// relative paths resolved against the process working directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the working directory cannot be read.
    pub fn new(
        registry: Arc<DataRegistry>,
        policy: SecurityPolicy,
        executor: Arc<dyn CodeExecutor>,
        query_config: QueryConfig,
    ) -> std::io::Result<Self> {
        let base = std::env::current_dir()?;
        Ok(Self {
            sandbox: SandboxBuilder::new(Arc::clone(&registry)),
            queries: QueryEngine::new(registry.relational_path(), query_config),
            load_guard: PathGuard::new(policy.allowed_paths(), base),
            registry,
            executor,
            policy,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        })
    }

    /// Sets the longest request line [`Dispatcher::serve`] reads.
    #[must_use]
    pub fn with_max_request_bytes(mut self, bytes: usize) -> Self {
        self.max_request_bytes = bytes.max(1);
        self
    }

    /// Registry the dispatcher serves.
    #[must_use]
    pub fn registry(&self) -> &Arc<DataRegistry> {
        &self.registry
    }

    /// Handles one call. Never panics on a failed call; every failure is
    /// reported in the response.
    pub async fn dispatch(&self, call: ToolCall) -> ToolResponse {
        let tool = call.name();
        let started = Instant::now();
        let response = match self.route(call).await {
            Ok(response) => response,
            Err(err) => {
                debug!(tool, error = %err, "tool call failed");
                ToolResponse::failure(tool, err.into_tool_error())
            }
        };
        info!(
            tool,
            ok = response.ok,
            elapsed_ms = millis(started.elapsed()),
            "tool call handled"
        );
        response
    }

    /// Decodes and handles one JSON request line.
    pub async fn dispatch_line(&self, line: &str) -> ToolResponse {
        match serde_json::from_str::<ToolCall>(line) {
            Ok(call) => self.dispatch(call).await,
            Err(err) => {
                let tool = serde_json::from_str::<Json>(line)
                    .ok()
                    .and_then(|value| value.get("tool").and_then(Json::as_str).map(str::to_owned))
                    .unwrap_or_else(|| "unknown".to_owned());
                warn!(%tool, %err, "malformed request");
                ToolResponse::failure(
                    &tool,
                    ToolError::new(ErrorKind::ValidationError, format!("malformed request: {err}")),
                )
            }
        }
    }

    /// Serves newline-delimited JSON requests from `reader` until end of
    /// input, writing one response line per request in arrival order.
    ///
    /// Lines that are not UTF-8 or exceed the request size limit are
    /// answered with a validation error and skipped.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from the reader or writer; failed calls are not
    /// errors.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let limit = u64::try_from(self.max_request_bytes).unwrap_or(u64::MAX);
        let mut line = Vec::new();
        let mut handled = 0_u64;
        loop {
            line.clear();
            let read = (&mut reader)
                .take(limit.saturating_add(1))
                .read_until(b'\n', &mut line)
                .await?;
            if read == 0 {
                break;
            }
            let response = if line.len() > self.max_request_bytes && line.last() != Some(&b'\n') {
                discard_line(&mut reader).await?;
                warn!(limit = self.max_request_bytes, "oversized request skipped");
                ToolResponse::failure(
                    "unknown",
                    ToolError::new(
                        ErrorKind::ValidationError,
                        format!("request exceeds {} bytes", self.max_request_bytes),
                    ),
                )
            } else {
                match std::str::from_utf8(trim_line_end(&line)) {
                    Ok(text) if text.trim().is_empty() => continue,
                    Ok(text) => self.dispatch_line(text).await,
                    Err(err) => {
                        warn!(%err, "request is not valid UTF-8");
                        ToolResponse::failure(
                            "unknown",
                            ToolError::new(
                                ErrorKind::ValidationError,
                                format!("request is not valid UTF-8: {err}"),
                            ),
                        )
                    }
                }
            };
            let mut encoded = serde_json::to_vec(&response).map_err(std::io::Error::from)?;
            encoded.push(b'\n');
            writer.write_all(&encoded).await?;
            writer.flush().await?;
            handled += 1;
        }
        info!(requests = handled, "input closed; dispatcher stopping");
        Ok(())
    }

    async fn route(&self, call: ToolCall) -> DispatchResult<ToolResponse> {
        match call {
            ToolCall::Load {
                path,
                name,
                format,
                backend,
                size_hint,
                overwrite,
            } => {
                let options = StoreOptions {
                    size_hint,
                    backend,
                    overwrite,
                    format,
                };
                self.load(path, &name, options).await
            }
            ToolCall::Execute {
                code,
                datasets,
                timeout_secs,
                want_artifacts,
            } => {
                self.execute(&code, &datasets, timeout_secs, want_artifacts)
                    .await
            }
            ToolCall::Query { sql, dataset } => self.query(&sql, dataset.as_deref()).await,
            ToolCall::ListDatasets => {
                let datasets = self.registry.list().await;
                Ok(ToolResponse::success(
                    "list_datasets",
                    json!({ "count": datasets.len(), "datasets": to_json(&datasets)? }),
                ))
            }
            ToolCall::DatasetInfo { name } => {
                let meta = self.registry.info(&name).await?;
                Ok(ToolResponse::success(
                    "dataset_info",
                    json!({ "summary": meta.summary(), "dataset": to_json(&meta)? }),
                ))
            }
            ToolCall::Promote { name } => {
                let created = self.registry.promote(&name).await?;
                Ok(ToolResponse::success(
                    "promote",
                    json!({
                        "name": name,
                        "backend": Backend::Relational.as_str(),
                        "created": created,
                    }),
                ))
            }
            ToolCall::Remove { name } => {
                let meta = self.registry.remove(&name).await?;
                Ok(ToolResponse::success(
                    "remove",
                    json!({ "removed": to_json(&meta)? }),
                ))
            }
        }
    }

    async fn load(
        &self,
        path: PathBuf,
        name: &str,
        options: StoreOptions,
    ) -> DispatchResult<ToolResponse> {
        let name = DatasetName::new(name)?;
        let resolved = self.load_guard.resolve(&path)?;
        let meta = self
            .registry
            .store(&name, DataSource::File(resolved), options)
            .await?;
        Ok(ToolResponse::success(
            "load",
            json!({ "summary": meta.summary(), "dataset": to_json(&meta)? }),
        ))
    }

    async fn execute(
        &self,
        code: &str,
        datasets: &[String],
        timeout_secs: Option<f64>,
        want_artifacts: bool,
    ) -> DispatchResult<ToolResponse> {
        let timeout = match timeout_secs {
            None => self.policy.timeout(),
            Some(secs) => {
                let ceiling = self.policy.timeout();
                let timeout = Duration::try_from_secs_f64(secs)
                    .ok()
                    .filter(|timeout| !timeout.is_zero())
                    .ok_or_else(|| {
                        DispatchError::Invalid(format!("timeout_secs must be positive, got {secs}"))
                    })?;
                if timeout > ceiling {
                    return Err(DispatchError::Invalid(format!(
                        "timeout_secs {secs} exceeds the policy limit of {}s",
                        ceiling.as_secs_f64()
                    )));
                }
                timeout
            }
        };
        lab_sandbox::script::parse(code).map_err(DispatchError::Syntax)?;

        let scope = self.sandbox.build(datasets, &self.policy).await?;
        let result = self
            .executor
            .execute(
                &scope,
                code,
                ExecuteOptions {
                    timeout: Some(timeout),
                    want_artifacts,
                },
            )
            .await?;
        Ok(execution_response(&result)?)
    }

    async fn query(&self, sql: &str, dataset: Option<&str>) -> DispatchResult<ToolResponse> {
        let query = self.queries.validate(sql)?;
        if let Some(name) = dataset {
            self.registry.promote(name).await?;
        }
        let output = self.queries.run_validated(query).await?;
        let elapsed_ms = millis(output.elapsed);
        let mut content = to_json(&output)?;
        if let Json::Object(fields) = &mut content {
            fields.insert("elapsed_ms".to_owned(), elapsed_ms.into());
        }
        Ok(ToolResponse::success("query", content))
    }
}

fn execution_response(result: &ExecutionResult) -> DispatchResult<ToolResponse> {
    let content = json!({
        "execution_id": result.execution_id.to_string(),
        "status": result.state.as_str(),
        "output": result.output,
        "result": result.value,
        "artifacts": to_json(&result.artifacts)?,
        "truncated": result.truncated,
        "elapsed_ms": millis(result.elapsed),
    });
    let mut response = ToolResponse::success("execute", content);
    if let Some(error) = &result.error {
        response.ok = false;
        response.error = Some(
            ToolError::new(error.kind, error.message.clone())
                .with_context("execution_id", result.execution_id.to_string())
                .with_context("status", result.state.as_str()),
        );
    }
    Ok(response)
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Consumes input up to and including the next newline without buffering it.
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        if let Some(pos) = available.iter().position(|byte| *byte == b'\n') {
            reader.consume(pos + 1);
            return Ok(());
        }
        let len = available.len();
        reader.consume(len);
    }
}

fn to_json<T: Serialize>(value: &T) -> DispatchResult<Json> {
    serde_json::to_value(value)
        .map_err(|err| DispatchError::Invalid(format!("cannot encode response: {err}")))
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use lab_primitives::ExecutionId;
    use lab_registry::RegistryConfig;
    use lab_sandbox::{ExecutionScope, WorkerError};

    use super::*;
    use crate::lifecycle::ExecutionState;
    use crate::supervisor::SupervisorResult;

    /// Records what it was asked to run and answers with a canned outcome.
    #[derive(Default)]
    struct FakeExecutor {
        seen: Mutex<Vec<(Vec<String>, String, Duration)>>,
        error: Option<WorkerError>,
    }

    #[async_trait]
    impl CodeExecutor for FakeExecutor {
        async fn execute(
            &self,
            scope: &ExecutionScope,
            code: &str,
            options: ExecuteOptions,
        ) -> SupervisorResult<ExecutionResult> {
            self.seen.lock().expect("fake executor poisoned").push((
                scope.datasets().keys().cloned().collect(),
                code.to_owned(),
                options.timeout.unwrap_or_default(),
            ));
            let state = match &self.error {
                Some(err) => ExecutionState::for_error(err.kind),
                None => ExecutionState::Completed,
            };
            Ok(ExecutionResult {
                execution_id: ExecutionId::random(),
                state,
                output: "ran\n".into(),
                value: Some(json!(1)),
                artifacts: Vec::new(),
                error: self.error.clone(),
                truncated: false,
                elapsed: Duration::from_millis(5),
                worker_pid: None,
            })
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        executor: Arc<FakeExecutor>,
        data: tempfile::TempDir,
        _state: tempfile::TempDir,
    }

    fn fixture_with(executor: FakeExecutor) -> Fixture {
        let data = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        std::fs::write(
            data.path().join("sales.csv"),
            "region,amount\neast,10\nwest,5\neast,7\n",
        )
        .unwrap();
        let registry = Arc::new(DataRegistry::open(RegistryConfig::new(state.path())).unwrap());
        let policy = SecurityPolicy::builder()
            .allow_capabilities(["print", "head"])
            .allow_path(data.path())
            .timeout(Duration::from_secs(9))
            .build()
            .unwrap();
        let executor = Arc::new(executor);
        let dispatcher = Dispatcher::new(
            registry,
            policy,
            Arc::clone(&executor) as Arc<dyn CodeExecutor>,
            QueryConfig::default(),
        )
        .unwrap();
        Fixture {
            dispatcher,
            executor,
            data,
            _state: state,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeExecutor::default())
    }

    async fn load_sales(fx: &Fixture) -> ToolResponse {
        fx.dispatcher
            .dispatch(ToolCall::Load {
                path: fx.data.path().join("sales.csv"),
                name: "sales".into(),
                format: None,
                backend: None,
                size_hint: None,
                overwrite: false,
            })
            .await
    }

    #[tokio::test]
    async fn load_then_list_and_info() {
        let fx = fixture();
        let response = load_sales(&fx).await;
        assert!(response.ok, "{response:?}");
        let content = response.content.unwrap();
        assert_eq!(content["dataset"]["backend"], "memory");
        assert_eq!(content["dataset"]["row_count"], 3);

        let listed = fx.dispatcher.dispatch(ToolCall::ListDatasets).await;
        assert_eq!(listed.content.unwrap()["count"], 1);

        let info = fx
            .dispatcher
            .dispatch_line(r#"{"tool":"dataset_info","name":"sales"}"#)
            .await;
        assert!(info.ok);
        assert_eq!(info.tool, "dataset_info");
    }

    #[tokio::test]
    async fn load_outside_allowed_paths_is_access_denied() {
        let fx = fixture();
        let outside = tempfile::tempdir().unwrap();
        let path = outside.path().join("x.csv");
        std::fs::write(&path, "a\n1\n").unwrap();
        let response = fx
            .dispatcher
            .dispatch(ToolCall::Load {
                path,
                name: "x".into(),
                format: None,
                backend: None,
                size_hint: None,
                overwrite: false,
            })
            .await;
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().kind, ErrorKind::AccessDenied);
        assert!(fx.dispatcher.registry().list().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_load_requires_overwrite() {
        let fx = fixture();
        assert!(load_sales(&fx).await.ok);
        let again = load_sales(&fx).await;
        assert_eq!(again.error.unwrap().kind, ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn execute_checks_syntax_and_datasets_before_running() {
        let fx = fixture();
        assert!(load_sales(&fx).await.ok);

        let bad = fx
            .dispatcher
            .dispatch_line(r#"{"tool":"execute","code":"let = 3","datasets":["sales"]}"#)
            .await;
        let error = bad.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ValidationError);
        assert_eq!(error.context["line"], 1);

        let missing = fx
            .dispatcher
            .dispatch_line(r#"{"tool":"execute","code":"1","datasets":["ghost"]}"#)
            .await;
        let error = missing.error.unwrap();
        assert_eq!(error.kind, ErrorKind::NotFound);
        assert_eq!(error.context["dataset"], "ghost");

        assert!(fx.executor.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn execute_forwards_scope_and_timeout() {
        let fx = fixture();
        assert!(load_sales(&fx).await.ok);
        let response = fx
            .dispatcher
            .dispatch_line(r#"{"tool":"execute","code":"head(sales, 1)","datasets":["sales"]}"#)
            .await;
        assert!(response.ok, "{response:?}");
        let content = response.content.unwrap();
        assert_eq!(content["status"], "completed");
        assert_eq!(content["output"], "ran\n");

        let seen = fx.executor.seen.lock().unwrap();
        assert_eq!(seen[0].0, ["sales"]);
        assert_eq!(seen[0].2, Duration::from_secs(9));
    }

    #[tokio::test]
    async fn failed_execution_keeps_output_and_reports_error() {
        let fx = fixture_with(FakeExecutor {
            error: Some(WorkerError {
                kind: ErrorKind::Timeout,
                message: "execution exceeded timeout of 1s".into(),
            }),
            ..FakeExecutor::default()
        });
        let response = fx
            .dispatcher
            .dispatch_line(r#"{"tool":"execute","code":"1","timeout_secs":1}"#)
            .await;
        assert!(!response.ok);
        assert_eq!(response.content.unwrap()["status"], "timed_out");
        assert_eq!(response.error.unwrap().kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn non_positive_timeout_is_rejected() {
        let fx = fixture();
        let response = fx
            .dispatcher
            .dispatch_line(r#"{"tool":"execute","code":"1","timeout_secs":0}"#)
            .await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn timeout_override_cannot_exceed_policy() {
        let fx = fixture();
        let response = fx
            .dispatcher
            .dispatch_line(r#"{"tool":"execute","code":"1","timeout_secs":60}"#)
            .await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::ValidationError);
        let response = fx
            .dispatcher
            .dispatch_line(r#"{"tool":"execute","code":"1","timeout_secs":1e9}"#)
            .await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::ValidationError);
        assert!(fx.executor.seen.lock().unwrap().is_empty());

        let response = fx
            .dispatcher
            .dispatch_line(r#"{"tool":"execute","code":"1","timeout_secs":9}"#)
            .await;
        assert!(response.ok, "{response:?}");
        assert_eq!(
            fx.executor.seen.lock().unwrap()[0].2,
            Duration::from_secs(9)
        );
    }

    #[tokio::test]
    async fn deeply_nested_code_is_rejected_before_running() {
        let fx = fixture();
        let code = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        let response = fx
            .dispatcher
            .dispatch(ToolCall::Execute {
                code,
                datasets: Vec::new(),
                timeout_secs: None,
                want_artifacts: false,
            })
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ValidationError);
        assert_eq!(error.context["line"], 1);
        assert!(fx.executor.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreadable_load_reports_dataset_and_backend() {
        let fx = fixture();
        let response = fx
            .dispatcher
            .dispatch(ToolCall::Load {
                path: fx.data.path().join("vanished.csv"),
                name: "vanished".into(),
                format: None,
                backend: None,
                size_hint: Some(500 * 1024 * 1024),
                overwrite: false,
            })
            .await;
        assert!(!response.ok);
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::StorageError);
        assert_eq!(error.context["dataset"], "vanished");
        assert_eq!(error.context["backend"], "columnar");
        assert!(fx.dispatcher.registry().list().await.is_empty());
    }

    #[tokio::test]
    async fn query_promotes_named_dataset() {
        let fx = fixture();
        assert!(load_sales(&fx).await.ok);
        let response = fx
            .dispatcher
            .dispatch(ToolCall::Query {
                sql: "SELECT region, SUM(amount) AS total FROM sales GROUP BY region ORDER BY region"
                    .into(),
                dataset: Some("sales".into()),
            })
            .await;
        assert!(response.ok, "{response:?}");
        let content = response.content.unwrap();
        assert_eq!(content["row_count"], 2);
        assert_eq!(content["column_count"], 2);
        assert_eq!(content["rows"][0], json!(["east", 17]));

        let info = fx.dispatcher.registry().info("sales").await.unwrap();
        assert_eq!(info.backend, Backend::Relational);
    }

    #[tokio::test]
    async fn rejected_query_does_not_promote() {
        let fx = fixture();
        assert!(load_sales(&fx).await.ok);
        let response = fx
            .dispatcher
            .dispatch(ToolCall::Query {
                sql: "DROP TABLE sales".into(),
                dataset: Some("sales".into()),
            })
            .await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::ValidationError);
        let info = fx.dispatcher.registry().info("sales").await.unwrap();
        assert_eq!(info.backend, Backend::Memory);
    }

    #[tokio::test]
    async fn malformed_lines_get_structured_errors() {
        let fx = fixture();
        let response = fx.dispatcher.dispatch_line("{not json").await;
        assert_eq!(response.tool, "unknown");
        assert_eq!(response.error.unwrap().kind, ErrorKind::ValidationError);

        let response = fx
            .dispatcher
            .dispatch_line(r#"{"tool":"promote"}"#)
            .await;
        assert_eq!(response.tool, "promote");
        assert!(!response.ok);
    }

    #[tokio::test]
    async fn serve_answers_each_line_in_order() {
        let fx = fixture();
        let input = format!(
            "{}\n\n{}\n{}\n",
            json!({"tool": "load", "path": fx.data.path().join("sales.csv"), "name": "sales"}),
            r#"{"tool":"remove","name":"ghost"}"#,
            r#"{"tool":"list_datasets"}"#,
        );
        let mut output = Vec::new();
        fx.dispatcher
            .serve(tokio::io::BufReader::new(input.as_bytes()), &mut output)
            .await
            .unwrap();

        let responses: Vec<ToolResponse> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        let tools: Vec<&str> = responses.iter().map(|r| r.tool.as_str()).collect();
        assert_eq!(tools, ["load", "remove", "list_datasets"]);
        assert!(responses[0].ok);
        assert_eq!(
            responses[1].error.as_ref().unwrap().kind,
            ErrorKind::NotFound
        );
        assert_eq!(responses[2].content.as_ref().unwrap()["count"], 1);
    }

    #[tokio::test]
    async fn serve_survives_invalid_utf8_and_oversized_lines() {
        let fx = fixture();
        let dispatcher = fx.dispatcher.with_max_request_bytes(64);
        let mut input = b"{\"tool\":\"list_datasets\",\"x\":\"\xff\"}\n".to_vec();
        input.extend_from_slice(b"{\"tool\":\"list_datasets\"}\n");
        input.extend(std::iter::repeat_n(b'x', 200));
        input.push(b'\n');
        input.extend_from_slice(b"{\"tool\":\"list_datasets\"}\n");

        let mut output = Vec::new();
        dispatcher
            .serve(tokio::io::BufReader::new(input.as_slice()), &mut output)
            .await
            .unwrap();

        let responses: Vec<ToolResponse> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        let tools: Vec<&str> = responses.iter().map(|r| r.tool.as_str()).collect();
        assert_eq!(tools, ["unknown", "list_datasets", "unknown", "list_datasets"]);
        for rejected in [&responses[0], &responses[2]] {
            assert_eq!(
                rejected.error.as_ref().unwrap().kind,
                ErrorKind::ValidationError
            );
        }
        assert!(responses[1].ok);
        assert!(responses[3].ok);
    }
}

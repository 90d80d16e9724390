//! Worker-process supervisor.
//!
//! Every execution runs in a fresh worker process with its own process
//! group, a cleared environment, and a private temporary working directory.
//! The supervisor bounds how many workers run at once, enforces the
//! deadline by killing the whole group, and reaps every child it starts.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lab_primitives::{ErrorKind, ExecutionId};
use lab_sandbox::{
    Artifact, DEFAULT_OUTPUT_LIMIT, ExecutionScope, SandboxError, WorkerError, WorkerRequest,
    WorkerResponse,
};
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::lifecycle::{ExecutionEvent, ExecutionState, Lifecycle, LifecycleError};
use crate::observer::{ExecutionObserver, TracingObserver};

/// Default cap on the raw response a worker may write.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

const STDERR_LIMIT: usize = 64 * 1024;

/// Settings for spawning and bounding workers.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    worker_program: PathBuf,
    worker_args: Vec<String>,
    max_concurrency: NonZeroUsize,
    default_timeout: Duration,
    memory_limit: Option<u64>,
    max_output_bytes: usize,
    max_response_bytes: usize,
    workspace_root: Option<PathBuf>,
}

impl SupervisorConfig {
    /// Configuration that starts `worker_program` with no arguments.
    #[must_use]
    pub fn new(worker_program: impl Into<PathBuf>) -> Self {
        Self {
            worker_program: worker_program.into(),
            worker_args: Vec::new(),
            max_concurrency: NonZeroUsize::new(4).unwrap_or(NonZeroUsize::MIN),
            default_timeout: lab_policy::DEFAULT_TIMEOUT,
            memory_limit: None,
            max_output_bytes: DEFAULT_OUTPUT_LIMIT,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            workspace_root: None,
        }
    }

    /// Arguments passed to the worker program.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Maximum number of workers alive at once.
    #[must_use]
    pub const fn with_max_concurrency(mut self, max: NonZeroUsize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Deadline used when an execution does not name one.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Address-space ceiling applied to each worker; `None` disables it.
    #[must_use]
    pub const fn with_memory_limit(mut self, bytes: Option<u64>) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Cap on printed output a worker captures.
    #[must_use]
    pub const fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Cap on the raw response read from a worker.
    #[must_use]
    pub const fn with_max_response_bytes(mut self, bytes: usize) -> Self {
        self.max_response_bytes = bytes;
        self
    }

    /// Directory under which execution workspaces are created. Defaults to
    /// the system temporary directory.
    #[must_use]
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    /// Returns the worker program.
    #[must_use]
    pub fn worker_program(&self) -> &Path {
        &self.worker_program
    }

    /// Returns the concurrency limit.
    #[must_use]
    pub const fn max_concurrency(&self) -> NonZeroUsize {
        self.max_concurrency
    }

    /// Returns the default deadline.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Returns the memory ceiling.
    #[must_use]
    pub const fn memory_limit(&self) -> Option<u64> {
        self.memory_limit
    }
}

/// Per-call options for [`CodeExecutor::execute`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Deadline; the supervisor default applies when absent.
    pub timeout: Option<Duration>,
    /// Whether artifacts should be captured.
    pub want_artifacts: bool,
}

/// Terminal outcome of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Execution identifier.
    pub execution_id: ExecutionId,
    /// Terminal state.
    pub state: ExecutionState,
    /// Printed output captured before the execution ended.
    pub output: String,
    /// JSON form of the final expression, if representable.
    pub value: Option<serde_json::Value>,
    /// Artifacts emitted by the script.
    pub artifacts: Vec<Artifact>,
    /// Error raised by the script or imposed by the supervisor.
    pub error: Option<WorkerError>,
    /// True when printed output was cut at the cap.
    pub truncated: bool,
    /// Wall time from spawn to reap.
    pub elapsed: Duration,
    /// Process id of the worker.
    pub worker_pid: Option<u32>,
}

impl ExecutionResult {
    /// True when the execution completed without an error.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.state == ExecutionState::Completed
    }
}

/// Seam between request handling and whatever runs code.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    /// Runs `code` against `scope` and returns its terminal outcome. Script
    /// failures, timeouts, and resource exhaustion are reported in the
    /// result, not as errors.
    async fn execute(
        &self,
        scope: &ExecutionScope,
        code: &str,
        options: ExecuteOptions,
    ) -> SupervisorResult<ExecutionResult>;
}

/// Spawns and supervises worker processes.
pub struct Supervisor {
    semaphore: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
    config: SupervisorConfig,
    observer: Arc<dyn ExecutionObserver>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Creates a supervisor reporting to a [`TracingObserver`].
    #[must_use]
    pub fn new(config: SupervisorConfig) -> Self {
        let permits = config.max_concurrency.get();
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            closed: Arc::new(AtomicBool::new(false)),
            config,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Replaces the execution observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Returns `true` once [`Supervisor::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Rejects new executions. Running workers are left to finish.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.semaphore.close();
    }

    fn workspace(&self, execution_id: ExecutionId) -> SupervisorResult<TempDir> {
        let prefix = format!("exec-{}-", execution_id.short());
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        match &self.config.workspace_root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(SupervisorError::Workspace)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(SupervisorError::Workspace)
    }

    fn command(&self, workspace: &Path) -> Command {
        let mut command = Command::new(&self.config.worker_program);
        command
            .args(&self.config.worker_args)
            .current_dir(workspace)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        {
            command.process_group(0);
            apply_limits(&mut command, self.config.memory_limit);
        }
        command
    }

    async fn run(
        &self,
        scope: &ExecutionScope,
        code: &str,
        options: ExecuteOptions,
    ) -> SupervisorResult<ExecutionResult> {
        if self.is_closed() {
            return Err(SupervisorError::Closed);
        }
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| SupervisorError::Closed)?;

        let execution_id = ExecutionId::random();
        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let workspace = self.workspace(execution_id)?;

        let manifest = {
            let scope = scope.clone();
            let dir = workspace.path().to_path_buf();
            tokio::task::spawn_blocking(move || scope.manifest(&dir))
                .await
                .map_err(|err| SupervisorError::Internal(format!("manifest task failed: {err}")))??
        };
        let request = WorkerRequest {
            execution_id,
            code: code.to_owned(),
            scope: manifest,
            want_artifacts: options.want_artifacts,
            max_output_bytes: self.config.max_output_bytes,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|err| SupervisorError::Internal(format!("cannot encode request: {err}")))?;

        let started = Instant::now();
        let mut child = self
            .command(workspace.path())
            .spawn()
            .map_err(SupervisorError::Spawn)?;
        let worker_pid = child.id();
        let mut group = GroupGuard::new(worker_pid);
        let mut lifecycle = Lifecycle::new(execution_id);
        debug!(
            %execution_id,
            pid = worker_pid,
            workspace = %workspace.path().display(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "worker spawned"
        );
        lifecycle.transition(ExecutionEvent::Start)?;

        let exchanged =
            tokio::time::timeout(timeout, self.exchange(&mut child, &payload)).await;

        let (event, response) = match exchanged {
            Err(_) => {
                group.kill();
                if let Err(err) = child.start_kill() {
                    debug!(%execution_id, %err, "worker already gone at kill");
                }
                if let Err(err) = child.wait().await {
                    warn!(%execution_id, %err, "failed to reap timed-out worker");
                }
                let message = format!("execution exceeded timeout of {}s", timeout.as_secs_f64());
                (
                    ExecutionEvent::Timeout,
                    WorkerResponse::failure(ErrorKind::Timeout, message),
                )
            }
            Ok(Err(err)) => {
                group.kill();
                if child.start_kill().is_ok() {
                    let _ = child.wait().await;
                }
                (
                    ExecutionEvent::Fail,
                    WorkerResponse::failure(
                        ErrorKind::InternalError,
                        format!("worker I/O failed: {err}"),
                    ),
                )
            }
            Ok(Ok(exchange)) => {
                group.disarm();
                self.interpret(execution_id, exchange)
            }
        };
        let state = lifecycle.transition(event)?;

        let result = ExecutionResult {
            execution_id,
            state,
            output: response.output,
            value: response.value,
            artifacts: response.artifacts,
            error: response.error,
            truncated: response.truncated,
            elapsed: started.elapsed(),
            worker_pid,
        };
        drop(workspace);
        self.observer.on_finished(&result);
        Ok(result)
    }

    async fn exchange(&self, child: &mut Child, payload: &[u8]) -> std::io::Result<Exchange> {
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let write = async move {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(payload).await {
                    Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                        debug!("worker closed stdin early");
                    }
                    other => other?,
                }
            }
            Ok::<_, std::io::Error>(())
        };
        let (_, (stdout, overflow), (stderr, _), status) = tokio::try_join!(
            write,
            read_capped(stdout, self.config.max_response_bytes),
            read_capped(stderr, STDERR_LIMIT),
            child.wait(),
        )?;
        Ok(Exchange {
            stdout,
            overflow,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            status,
        })
    }

    fn interpret(
        &self,
        execution_id: ExecutionId,
        exchange: Exchange,
    ) -> (ExecutionEvent, WorkerResponse) {
        if !exchange.stderr.is_empty() {
            debug!(%execution_id, stderr = %exchange.stderr.trim_end(), "worker stderr");
        }
        if exchange.overflow {
            let message = format!(
                "worker response exceeded {} bytes",
                self.config.max_response_bytes
            );
            return (
                ExecutionEvent::Exceed,
                WorkerResponse::failure(ErrorKind::ResourceExceeded, message),
            );
        }

        match serde_json::from_slice::<WorkerResponse>(&exchange.stdout) {
            Ok(mut response) => {
                let event = match response.error.as_ref().map(|err| err.kind) {
                    None if exchange.status.success() => ExecutionEvent::Complete,
                    None => {
                        response.error = Some(WorkerError {
                            kind: ErrorKind::InternalError,
                            message: format!("worker exited with {}", exchange.status),
                        });
                        ExecutionEvent::Fail
                    }
                    Some(ErrorKind::ResourceExceeded) => ExecutionEvent::Exceed,
                    Some(_) => ExecutionEvent::Fail,
                };
                (event, response)
            }
            Err(_) if self.died_of_memory(&exchange) => {
                let limit = self.config.memory_limit.unwrap_or_default();
                (
                    ExecutionEvent::Exceed,
                    WorkerResponse::failure(
                        ErrorKind::ResourceExceeded,
                        format!("worker exceeded memory limit of {limit} bytes"),
                    ),
                )
            }
            Err(err) => {
                let tail = tail(&exchange.stderr, 512);
                (
                    ExecutionEvent::Fail,
                    WorkerResponse::failure(
                        ErrorKind::InternalError,
                        format!(
                            "worker exited with {} without a valid response ({err}): {tail}",
                            exchange.status
                        ),
                    ),
                )
            }
        }
    }

    fn died_of_memory(&self, exchange: &Exchange) -> bool {
        if exchange.stderr.contains("memory allocation") {
            return true;
        }
        self.config.memory_limit.is_some() && killed_by_signal(exchange.status)
    }
}

#[async_trait]
impl CodeExecutor for Supervisor {
    async fn execute(
        &self,
        scope: &ExecutionScope,
        code: &str,
        options: ExecuteOptions,
    ) -> SupervisorResult<ExecutionResult> {
        let result = self.run(scope, code, options).await;
        if let Ok(result) = &result {
            info!(
                execution_id = %result.execution_id,
                state = result.state.as_str(),
                "execution finished"
            );
        }
        result
    }
}

struct Exchange {
    stdout: Vec<u8>,
    overflow: bool,
    stderr: String,
    status: ExitStatus,
}

/// Reads up to `cap` bytes and drains the rest so the writer never blocks.
async fn read_capped<R>(reader: Option<R>, cap: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok((Vec::new(), false));
    };
    let mut buf = Vec::new();
    let limit = u64::try_from(cap).unwrap_or(u64::MAX).saturating_add(1);
    (&mut reader).take(limit).read_to_end(&mut buf).await?;
    if buf.len() <= cap {
        return Ok((buf, false));
    }
    buf.truncate(cap);
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok((buf, true))
}

fn tail(text: &str, max: usize) -> &str {
    let text = text.trim_end();
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(unix)]
fn killed_by_signal(status: ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn killed_by_signal(_status: ExitStatus) -> bool {
    false
}

#[cfg(unix)]
fn apply_limits(command: &mut Command, memory_limit: Option<u64>) {
    use nix::sys::resource::{Resource, setrlimit};

    // SAFETY: the closure runs between fork and exec and only calls
    // setrlimit, which is async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            if let Some(bytes) = memory_limit {
                setrlimit(Resource::RLIMIT_AS, bytes, bytes).map_err(std::io::Error::from)?;
            }
            setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

/// Kills the worker's process group on drop unless disarmed.
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pgid, %err, "process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Errors produced by the supervisor itself. Failures of user code are
/// reported inside [`ExecutionResult`].
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Supervisor is closed and will not start new workers.
    #[error("supervisor closed")]
    Closed,
    /// Worker process could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
    /// Execution workspace could not be created.
    #[error("failed to create execution workspace: {0}")]
    Workspace(#[source] std::io::Error),
    /// Scope could not be reduced to a manifest.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    /// Lifecycle rejected a transition.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// Unexpected internal failure.
    #[error("internal supervisor error: {0}")]
    Internal(String),
}

impl SupervisorError {
    /// Maps the error onto the shared taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Workspace(_) => ErrorKind::StorageError,
            Self::Sandbox(err) => err.kind(),
            Self::Closed | Self::Spawn(_) | Self::Lifecycle(_) | Self::Internal(_) => {
                ErrorKind::InternalError
            }
        }
    }
}

/// Result alias for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::observer::CollectingObserver;
    use lab_policy::SecurityPolicy;
    use lab_registry::{DataRegistry, RegistryConfig};
    use lab_sandbox::SandboxBuilder;

    async fn empty_scope(dir: &Path) -> ExecutionScope {
        let registry = Arc::new(DataRegistry::open(RegistryConfig::new(dir)).unwrap());
        SandboxBuilder::new(registry)
            .build(&[], &SecurityPolicy::builder().build().unwrap())
            .await
            .unwrap()
    }

    fn shell(script: &str) -> SupervisorConfig {
        SupervisorConfig::new("/bin/sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn parses_worker_response() {
        let dir = tempfile::tempdir().unwrap();
        let scope = empty_scope(dir.path()).await;
        let observer = CollectingObserver::new();
        let supervisor = Supervisor::new(shell(
            r#"cat >/dev/null; printf '%s' '{"output":"hi\n","value":3}'"#,
        ))
        .with_observer(observer.clone());

        let result = supervisor
            .execute(&scope, "print(\"hi\")\n3", ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.state, ExecutionState::Completed);
        assert_eq!(result.output, "hi\n");
        assert_eq!(result.value, Some(serde_json::json!(3)));
        assert_eq!(observer.drain().len(), 1);
    }

    #[tokio::test]
    async fn script_error_is_failed_state() {
        let dir = tempfile::tempdir().unwrap();
        let scope = empty_scope(dir.path()).await;
        let supervisor = Supervisor::new(shell(
            r#"cat >/dev/null; printf '%s' '{"output":"","error":{"kind":"execution_error","message":"line 1: boom"}}'"#,
        ));
        let result = supervisor
            .execute(&scope, "fail(\"boom\")", ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.state, ExecutionState::Failed);
        assert_eq!(result.error.unwrap().kind, ErrorKind::ExecutionError);
    }

    #[tokio::test]
    async fn timeout_kills_and_reaps_worker() {
        let dir = tempfile::tempdir().unwrap();
        let scope = empty_scope(dir.path()).await;
        let supervisor = Supervisor::new(shell("sleep 30"));
        let started = Instant::now();
        let result = supervisor
            .execute(
                &scope,
                "while true { }",
                ExecuteOptions {
                    timeout: Some(Duration::from_millis(200)),
                    want_artifacts: false,
                },
            )
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.state, ExecutionState::TimedOut);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Timeout);

        let pid = i32::try_from(result.worker_pid.unwrap()).unwrap();
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None);
        assert!(alive.is_err(), "worker {pid} still exists");
    }

    #[tokio::test]
    async fn signal_death_under_memory_limit_is_resource_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let scope = empty_scope(dir.path()).await;
        let script = "cat >/dev/null; kill -9 $$";

        let limited = Supervisor::new(shell(script).with_memory_limit(Some(1 << 30)));
        let result = limited
            .execute(&scope, "1", ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.state, ExecutionState::ResourceExceeded);

        let unlimited = Supervisor::new(shell(script));
        let result = unlimited
            .execute(&scope, "1", ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.state, ExecutionState::Failed);
        assert_eq!(result.error.unwrap().kind, ErrorKind::InternalError);
    }

    #[tokio::test]
    async fn oversized_response_is_resource_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let scope = empty_scope(dir.path()).await;
        let supervisor = Supervisor::new(
            shell("cat >/dev/null; head -c 5000 /dev/zero").with_max_response_bytes(1024),
        );
        let result = supervisor
            .execute(&scope, "1", ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.state, ExecutionState::ResourceExceeded);
    }

    #[tokio::test]
    async fn respects_max_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let scope = empty_scope(dir.path()).await;
        let supervisor = Supervisor::new(
            shell("cat >/dev/null; sleep 0.3; printf '{}'")
                .with_max_concurrency(NonZeroUsize::new(1).unwrap()),
        );
        let started = Instant::now();
        let (a, b) = tokio::join!(
            supervisor.execute(&scope, "1", ExecuteOptions::default()),
            supervisor.execute(&scope, "2", ExecuteOptions::default()),
        );
        assert!(a.unwrap().is_success());
        assert!(b.unwrap().is_success());
        assert!(started.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn close_rejects_new_executions() {
        let dir = tempfile::tempdir().unwrap();
        let scope = empty_scope(dir.path()).await;
        let supervisor = Supervisor::new(shell("true"));
        supervisor.close();
        let err = supervisor
            .execute(&scope, "1", ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Closed));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("héllo\n", 4), "llo");
        assert_eq!(tail("abc", 10), "abc");
    }
}

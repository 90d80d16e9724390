//! Worker-process entry point.
//!
//! The supervisor starts the binary with the `worker` subcommand inside a
//! private working directory, writes one [`WorkerRequest`] to stdin, and
//! reads one [`WorkerResponse`] from stdout. Script failures are reported in
//! the response; the exit code is non-zero only when the request itself is
//! unusable.

use std::io::{Read, Write};
use std::path::Path;

use lab_primitives::ErrorKind;
use tracing::debug;

use crate::capability::CapabilityTable;
use crate::protocol::{WorkerError, WorkerRequest, WorkerResponse};
use crate::scope::ExecutionScope;
use crate::script::Interpreter;

/// Rows included when a table is the final expression.
pub const RESULT_ROW_LIMIT: usize = 1_000;

/// Exit code for a request that could not be decoded or answered.
pub const EXIT_PROTOCOL_ERROR: i32 = 2;

/// Runs one request against a scope rebuilt in `base_dir`.
#[must_use]
pub fn run_request(request: &WorkerRequest, base_dir: &Path) -> WorkerResponse {
    let scope = match ExecutionScope::from_manifest(
        &request.scope,
        CapabilityTable::standard(),
        base_dir,
    ) {
        Ok(scope) => scope,
        Err(err) => return WorkerResponse::failure(err.kind(), err.to_string()),
    };

    debug!(
        execution_id = %request.execution_id,
        datasets = scope.datasets().len(),
        "worker scope rebuilt"
    );

    let outcome = Interpreter::new(&scope)
        .with_output_limit(request.max_output_bytes)
        .with_artifacts(request.want_artifacts)
        .run_source(&request.code);

    WorkerResponse {
        output: outcome.output,
        value: outcome.value.map(|value| value.to_json(RESULT_ROW_LIMIT)),
        artifacts: outcome.artifacts,
        error: outcome.error.as_ref().map(WorkerError::from),
        truncated: outcome.truncated,
    }
}

/// Reads a request from stdin, runs it in the current directory, and writes
/// the response to stdout. Returns the process exit code.
#[must_use]
pub fn run_stdio() -> i32 {
    let mut raw = String::new();
    let (response, code) = match std::io::stdin().read_to_string(&mut raw) {
        Err(err) => (
            WorkerResponse::failure(ErrorKind::InternalError, format!("cannot read request: {err}")),
            EXIT_PROTOCOL_ERROR,
        ),
        Ok(_) => match serde_json::from_str::<WorkerRequest>(&raw) {
            Err(err) => (
                WorkerResponse::failure(ErrorKind::InternalError, format!("malformed request: {err}")),
                EXIT_PROTOCOL_ERROR,
            ),
            Ok(request) => {
                let base = std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."));
                (run_request(&request, &base), 0)
            }
        },
    };

    let mut stdout = std::io::stdout().lock();
    let written = serde_json::to_writer(&mut stdout, &response)
        .map_err(std::io::Error::from)
        .and_then(|()| stdout.flush());
    if written.is_err() {
        return EXIT_PROTOCOL_ERROR;
    }
    code
}

#[cfg(test)]
mod tests {
    use lab_primitives::{ExecutionId, Table};
    use lab_registry::{ColumnarWriter, DatasetRef};

    use super::*;
    use crate::protocol::ScopeManifest;

    fn request(code: &str, manifest: ScopeManifest) -> WorkerRequest {
        WorkerRequest {
            execution_id: ExecutionId::random(),
            code: code.into(),
            scope: manifest,
            want_artifacts: false,
            max_output_bytes: 1024,
        }
    }

    #[test]
    fn response_carries_output_value_and_error() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::from_text_rows(
            vec!["n".into()],
            vec![vec!["1".into()], vec!["2".into()]],
        )
        .unwrap();
        let path = dir.path().join("nums.dlcol");
        ColumnarWriter::new("nums").write(&path, &table).unwrap();
        let manifest = ScopeManifest {
            datasets: [("nums".to_owned(), DatasetRef::Columnar { path })].into(),
            capabilities: ["print".to_owned(), "collect".to_owned()].into(),
            ..ScopeManifest::default()
        };

        let response = run_request(&request("print(\"hi\")\ncollect(nums)", manifest.clone()), dir.path());
        assert_eq!(response.output, "hi\n");
        assert!(response.error.is_none());
        let value = response.value.unwrap();
        assert_eq!(value["row_count"], 2);

        let response = run_request(&request("print(1)\nfail(\"nope\")", manifest), dir.path());
        assert_eq!(response.output, "1\n");
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ExecutionError);
        assert_eq!(error.message, "line 2: nope");
    }

    #[test]
    fn unopenable_dataset_is_reported_not_panicked() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = ScopeManifest {
            datasets: [(
                "gone".to_owned(),
                DatasetRef::Columnar {
                    path: dir.path().join("missing.dlcol"),
                },
            )]
            .into(),
            ..ScopeManifest::default()
        };
        let response = run_request(&request("1", manifest), dir.path());
        assert_eq!(response.error.unwrap().kind, ErrorKind::StorageError);
    }
}

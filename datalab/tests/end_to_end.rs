//! End-to-end tests driving the dispatcher against real worker processes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use datalab::config::LabConfig;
use datalab::kernel::{
    CodeExecutor, Dispatcher, ExecuteOptions, ExecutionState, Supervisor, ToolCall, ToolResponse,
};
use datalab::primitives::ErrorKind;
use datalab::registry::DataRegistry;
use datalab::sandbox::SandboxBuilder;
use serde_json::{Value, json};

const WORKER: &str = env!("CARGO_BIN_EXE_datalab");

struct Lab {
    _root: tempfile::TempDir,
    inputs: PathBuf,
    config: LabConfig,
}

impl Lab {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let inputs = root.path().join("inputs");
        std::fs::create_dir_all(&inputs).unwrap();
        let mut config = LabConfig::default();
        config.data_dir = root.path().join("data");
        config.policy.allowed_paths = vec![inputs.clone()];
        config.policy.capabilities.push("write_text".to_owned());
        config.worker.program = Some(PathBuf::from(WORKER));
        Self {
            _root: root,
            inputs,
            config,
        }
    }

    fn write_input(&self, file: &str, content: &str) -> PathBuf {
        let path = self.inputs.join(file);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn start(&self) -> (Dispatcher, Arc<Supervisor>) {
        let registry = Arc::new(DataRegistry::open(self.config.registry_config()).unwrap());
        let policy = self.config.security_policy().unwrap();
        let supervisor = Arc::new(Supervisor::new(
            self.config.supervisor_config(Path::new(WORKER)).unwrap(),
        ));
        let dispatcher = Dispatcher::new(
            registry,
            policy,
            Arc::clone(&supervisor) as Arc<dyn CodeExecutor>,
            self.config.query_config(),
        )
        .unwrap();
        (dispatcher, supervisor)
    }
}

fn load(path: &Path, name: &str, size_hint: u64) -> ToolCall {
    serde_json::from_value(json!({
        "tool": "load",
        "path": path,
        "name": name,
        "size_hint": size_hint,
    }))
    .unwrap()
}

fn execute(code: &str, datasets: &[&str], timeout_secs: Option<f64>) -> ToolCall {
    ToolCall::Execute {
        code: code.to_owned(),
        datasets: datasets.iter().map(|name| (*name).to_owned()).collect(),
        timeout_secs,
        want_artifacts: false,
    }
}

fn content(response: &ToolResponse) -> &Value {
    response.content.as_ref().unwrap()
}

fn error_kind(response: &ToolResponse) -> ErrorKind {
    response.error.as_ref().unwrap().kind
}

#[tokio::test]
async fn tiers_compose_across_execute_and_query() {
    let lab = Lab::new();
    let sales = lab.write_input("sales.csv", "region,amount\neast,10\nwest,7\neast,3\n");
    let events = lab.write_input("events.csv", "kind,ms\nclick,12\nview,40\n");
    let logs = lab.write_input(
        "logs.csv",
        "level,msg\ninfo,start\nwarn,slow\ninfo,stop\nerror,boom\n",
    );
    let (dispatcher, _supervisor) = lab.start();

    for (path, name, hint, backend) in [
        (&sales, "sales", 50_000_000, "memory"),
        (&events, "events", 500_000_000, "columnar"),
        (&logs, "logs", 2_000_000_000, "relational"),
    ] {
        let response = dispatcher.dispatch(load(path, name, hint)).await;
        assert!(response.ok, "{response:?}");
        assert_eq!(content(&response)["dataset"]["backend"], backend);
    }

    let response = dispatcher
        .dispatch(execute(
            "print(sum(sales, \"amount\"))\ncount(sales) + count(events)",
            &["sales", "events"],
            None,
        ))
        .await;
    assert!(response.ok, "{response:?}");
    assert_eq!(content(&response)["status"], "completed");
    assert_eq!(content(&response)["output"], "20\n");
    assert_eq!(content(&response)["result"], 5);

    let response = dispatcher
        .dispatch(ToolCall::Query {
            sql: "SELECT COUNT(*) AS n FROM logs".to_owned(),
            dataset: None,
        })
        .await;
    assert!(response.ok, "{response:?}");
    assert_eq!(content(&response)["rows"][0][0], 4);

    let listed = dispatcher.dispatch(ToolCall::ListDatasets).await;
    assert_eq!(content(&listed)["count"], 3);
}

#[tokio::test]
async fn runaway_code_times_out_and_worker_is_reaped() {
    let lab = Lab::new();
    let (dispatcher, supervisor) = lab.start();

    let response = dispatcher
        .dispatch(execute(
            "let i = 0\nwhile true {\n  i = i + 1\n}",
            &[],
            Some(1.0),
        ))
        .await;
    assert!(!response.ok);
    assert_eq!(error_kind(&response), ErrorKind::Timeout);
    assert_eq!(content(&response)["status"], "timed_out");

    let policy = lab.config.security_policy().unwrap();
    let scope = SandboxBuilder::new(Arc::clone(dispatcher.registry()))
        .build(&[], &policy)
        .await
        .unwrap();
    let result = supervisor
        .execute(
            &scope,
            "while true {\n  sleep(0.01)\n}",
            ExecuteOptions {
                timeout: Some(Duration::from_millis(500)),
                want_artifacts: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(result.state, ExecutionState::TimedOut);
    let pid = result.worker_pid.unwrap();
    if cfg!(target_os = "linux") {
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
    }
}

#[tokio::test]
async fn writes_outside_allowed_paths_are_denied() {
    let lab = Lab::new();
    let (dispatcher, _supervisor) = lab.start();
    let outside = tempfile::tempdir().unwrap();
    let target = outside.path().join("leak.txt");

    let response = dispatcher
        .dispatch(execute(
            &format!("write_text({:?}, \"secret\")", target.display().to_string()),
            &[],
            None,
        ))
        .await;
    assert!(!response.ok);
    assert_eq!(error_kind(&response), ErrorKind::AccessDenied);
    assert!(!target.exists());

    let inside = lab.inputs.join("notes.txt");
    let response = dispatcher
        .dispatch(execute(
            &format!("write_text({:?}, \"kept\")", inside.display().to_string()),
            &[],
            None,
        ))
        .await;
    assert!(response.ok, "{response:?}");
    assert_eq!(std::fs::read_to_string(inside).unwrap(), "kept");
}

#[tokio::test]
async fn concurrent_executions_finish_independently() {
    let mut lab = Lab::new();
    lab.config.limits.max_concurrency = 2;
    let sales = lab.write_input("sales.csv", "region,amount\neast,10\nwest,7\n");
    let events = lab.write_input("events.csv", "kind,ms\nclick,12\nview,40\nview,8\n");
    let (dispatcher, _supervisor) = lab.start();
    assert!(dispatcher.dispatch(load(&sales, "sales", 10)).await.ok);
    assert!(dispatcher.dispatch(load(&events, "events", 10)).await.ok);

    let (first, second, third) = tokio::join!(
        dispatcher.dispatch(execute(
            "print(\"sales\")\nsleep(0.2)\nprint(\"sales done\")\nsum(sales, \"amount\")",
            &["sales"],
            None,
        )),
        dispatcher.dispatch(execute("fail(\"broken\")", &[], None)),
        dispatcher.dispatch(execute(
            "print(\"events\")\nsleep(0.2)\nprint(\"events done\")\ncount(events)",
            &["events"],
            None,
        )),
    );
    assert_eq!(content(&first)["output"], "sales\nsales done\n");
    assert_eq!(content(&first)["result"], 17);
    assert_eq!(error_kind(&second), ErrorKind::ExecutionError);
    assert_eq!(content(&third)["output"], "events\nevents done\n");
    assert_eq!(content(&third)["result"], 3);
    assert_ne!(
        content(&first)["execution_id"],
        content(&third)["execution_id"]
    );

    let info = dispatcher
        .dispatch(ToolCall::DatasetInfo {
            name: "sales".to_owned(),
        })
        .await;
    assert_eq!(content(&info)["dataset"]["row_count"], 2);
}

#[tokio::test]
async fn mutating_query_is_rejected() {
    let lab = Lab::new();
    let logs = lab.write_input("logs.csv", "level\ninfo\n");
    let (dispatcher, _supervisor) = lab.start();
    assert!(dispatcher.dispatch(load(&logs, "logs", 10)).await.ok);

    let response = dispatcher
        .dispatch(ToolCall::Query {
            sql: "DROP TABLE logs".to_owned(),
            dataset: Some("logs".to_owned()),
        })
        .await;
    assert!(!response.ok);
    assert_eq!(error_kind(&response), ErrorKind::ValidationError);

    let info = dispatcher
        .dispatch(ToolCall::DatasetInfo {
            name: "logs".to_owned(),
        })
        .await;
    assert_eq!(content(&info)["dataset"]["backend"], "memory");
}

#[cfg(unix)]
#[tokio::test]
async fn allocation_beyond_the_ceiling_is_resource_exceeded() {
    let mut lab = Lab::new();
    lab.config.limits.memory_limit_bytes = 128 * 1024 * 1024;
    let (dispatcher, _supervisor) = lab.start();

    let response = dispatcher
        .dispatch(execute("len(repeat(\"x\", 536870912))", &[], None))
        .await;
    assert!(!response.ok);
    assert_eq!(error_kind(&response), ErrorKind::ResourceExceeded);
    assert_eq!(content(&response)["status"], "resource_exceeded");

    let response = dispatcher.dispatch(execute("1 + 1", &[], None)).await;
    assert_eq!(content(&response)["result"], 2);
}

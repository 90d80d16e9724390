//! Strongly typed configuration schema. Every field has a default so an
//! empty file is a valid configuration.

use std::path::PathBuf;

use lab_kernel::{DEFAULT_MAX_ROWS, DEFAULT_MAX_RESPONSE_BYTES};
use lab_registry::{DEFAULT_COLUMNAR_LIMIT, DEFAULT_IN_MEMORY_LIMIT};
use lab_telemetry::LogFormat;
use serde::{Deserialize, Serialize};

/// Capabilities granted when the configuration names none. File
/// capabilities are opt-in.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "print", "dataset", "scan", "collect", "filter", "select", "head", "sort", "aggregate",
    "count", "columns", "describe", "sum", "mean", "min", "max", "len", "str", "repeat",
    "sleep", "artifact", "fail",
];

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LabConfig {
    /// Directory holding per-process session directories.
    pub data_dir: PathBuf,
    /// Tier selection thresholds.
    pub storage: StorageSection,
    /// Execution and query bounds.
    pub limits: LimitsSection,
    /// Capability and path policy.
    pub policy: PolicySection,
    /// Log output.
    pub logging: LoggingSection,
    /// Worker process command.
    pub worker: WorkerSection,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("datalab-data"),
            storage: StorageSection::default(),
            limits: LimitsSection::default(),
            policy: PolicySection::default(),
            logging: LoggingSection::default(),
            worker: WorkerSection::default(),
        }
    }
}

/// Size thresholds, in bytes, separating the tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    /// Datasets smaller than this stay in memory.
    pub in_memory_limit_bytes: u64,
    /// Datasets smaller than this, and not in memory, go to columnar files.
    pub columnar_limit_bytes: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            in_memory_limit_bytes: DEFAULT_IN_MEMORY_LIMIT,
            columnar_limit_bytes: DEFAULT_COLUMNAR_LIMIT,
        }
    }
}

/// Resource bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsSection {
    /// Default execution timeout.
    pub timeout_secs: u64,
    /// Worker address-space ceiling; `0` disables it.
    pub memory_limit_bytes: u64,
    /// Workers alive at once.
    pub max_concurrency: usize,
    /// Printed output captured per execution.
    pub max_output_bytes: usize,
    /// Raw response read from a worker.
    pub max_response_bytes: usize,
    /// Rows returned by a query.
    pub max_rows: usize,
    /// Query timeout.
    pub query_timeout_secs: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            timeout_secs: lab_policy::DEFAULT_TIMEOUT.as_secs(),
            memory_limit_bytes: lab_policy::DEFAULT_MEMORY_LIMIT,
            max_concurrency: 4,
            max_output_bytes: 1024 * 1024,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            max_rows: DEFAULT_MAX_ROWS,
            query_timeout_secs: lab_policy::DEFAULT_TIMEOUT.as_secs(),
        }
    }
}

/// Capability allow-list, identifier deny-list, and path allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySection {
    /// Capabilities granted to scripts.
    pub capabilities: Vec<String>,
    /// Identifiers denied in addition to the built-in deny-list.
    pub denied_identifiers: Vec<String>,
    /// Directories loads and file capabilities may touch. Relative entries
    /// are resolved against the working directory.
    pub allowed_paths: Vec<PathBuf>,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            capabilities: DEFAULT_CAPABILITIES.iter().map(|name| (*name).to_owned()).collect(),
            denied_identifiers: Vec::new(),
            allowed_paths: vec![PathBuf::from(".")],
        }
    }
}

/// Log level and layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    /// Base level; `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Line layout.
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Compact,
        }
    }
}

/// Command used to start workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSection {
    /// Worker executable; the running binary when unset.
    pub program: Option<PathBuf>,
    /// Arguments passed to the worker.
    pub args: Vec<String>,
    /// Directory for execution workspaces; the system temp dir when unset.
    pub workspace_root: Option<PathBuf>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            program: None,
            args: vec!["worker".to_owned()],
            workspace_root: None,
        }
    }
}

//! Messages exchanged between the supervisor and a worker process.
//!
//! A worker reads exactly one [`WorkerRequest`] as JSON from stdin and writes
//! exactly one [`WorkerResponse`] as JSON to stdout.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use lab_primitives::{ErrorKind, ExecutionId};
use lab_registry::DatasetRef;
use serde::{Deserialize, Serialize};

use crate::context::DEFAULT_OUTPUT_LIMIT;
use crate::script::ScriptError;

/// Serializable reduction of an execution scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeManifest {
    /// Dataset name → openable reference.
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetRef>,
    /// Granted capability names.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Deny-listed identifiers.
    #[serde(default)]
    pub denied: BTreeSet<String>,
    /// Path allow-list.
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,
}

/// Work handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Execution the request belongs to.
    pub execution_id: ExecutionId,
    /// Script source.
    pub code: String,
    /// Scope to rebuild.
    pub scope: ScopeManifest,
    /// Whether artifacts should be captured.
    #[serde(default)]
    pub want_artifacts: bool,
    /// Cap on captured printed output.
    #[serde(default = "default_output_limit")]
    pub max_output_bytes: usize,
}

fn default_output_limit() -> usize {
    DEFAULT_OUTPUT_LIMIT
}

/// Binary output produced by a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// MIME type of the payload.
    pub media_type: String,
    /// Raw bytes, base64 on the wire.
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// Error raised by the script, carried as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl From<&ScriptError> for WorkerError {
    fn from(err: &ScriptError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Everything a worker reports back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    /// Printed output.
    #[serde(default)]
    pub output: String,
    /// JSON form of the final expression, when it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Captured artifacts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    /// Error raised by the script, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerError>,
    /// True when printed output hit the cap.
    #[serde(default)]
    pub truncated: bool,
}

impl WorkerResponse {
    /// Response carrying only an error.
    #[must_use]
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: Some(WorkerError {
                kind,
                message: message.into(),
            }),
            ..Self::default()
        }
    }
}

mod b64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifacts_are_base64_on_the_wire() {
        let artifact = Artifact {
            media_type: "image/png".into(),
            data: vec![0x89, b'P', b'N', b'G'],
        };
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["data"], "iVBORw==");
        let back: Artifact = serde_json::from_value(json).unwrap();
        assert_eq!(back, artifact);
    }

    #[test]
    fn request_defaults_apply() {
        let request: WorkerRequest = serde_json::from_value(serde_json::json!({
            "execution_id": ExecutionId::random(),
            "code": "1 + 1",
            "scope": {},
        }))
        .unwrap();
        assert!(!request.want_artifacts);
        assert_eq!(request.max_output_bytes, DEFAULT_OUTPUT_LIMIT);
        assert!(request.scope.datasets.is_empty());
    }
}

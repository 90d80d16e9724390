//! Capability sandbox for datalab executions.
//!
//! [`SandboxBuilder`] turns a list of dataset names and a
//! [`SecurityPolicy`](lab_policy::SecurityPolicy) into an [`ExecutionScope`]:
//! the dataset handles, the granted capabilities from the static
//! [`CapabilityTable`], failing stubs for deny-listed identifiers, and a
//! [`PathGuard`] for file access. The same crate hosts the worker side: the
//! request protocol, scope reconstruction, and the script interpreter.

#![warn(missing_docs, clippy::pedantic)]

mod builtins;
mod capability;
mod context;
mod error;
mod path_guard;
mod protocol;
mod scope;
pub mod script;
pub mod worker;

pub use capability::{CapabilityFn, CapabilitySpec, CapabilityTable};
pub use context::{CallContext, DEFAULT_OUTPUT_LIMIT, OutputBuffer};
pub use error::{SandboxError, SandboxResult};
pub use path_guard::PathGuard;
pub use protocol::{Artifact, ScopeManifest, WorkerError, WorkerRequest, WorkerResponse};
pub use scope::{Binding, ExecutionScope, SandboxBuilder};
pub use script::{ScriptError, ScriptResult, ScriptValue};

//! Execution kernel for datalab.
//!
//! The kernel runs analysis code in supervised worker processes, executes
//! read-only queries against the session database, and dispatches tool calls
//! to the registry, sandbox, supervisor, and query engine.

#![warn(missing_docs, clippy::pedantic)]

mod dispatcher;
mod lifecycle;
mod observer;
mod query;
mod supervisor;

pub use dispatcher::{Dispatcher, ToolCall, ToolError, ToolResponse};
pub use lifecycle::{ExecutionEvent, ExecutionState, Lifecycle, LifecycleError, LifecycleResult};
pub use observer::{CollectingObserver, ExecutionObserver, TracingObserver};
pub use query::{
    DEFAULT_MAX_ROWS, QueryConfig, QueryEngine, QueryError, QueryOutput, QueryResult,
    ValidatedQuery,
};
pub use supervisor::{
    CodeExecutor, DEFAULT_MAX_RESPONSE_BYTES, ExecuteOptions, ExecutionResult, Supervisor,
    SupervisorConfig, SupervisorError, SupervisorResult,
};

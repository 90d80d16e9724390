//! Sinks for finished executions.

use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::lifecycle::ExecutionState;
use crate::supervisor::ExecutionResult;

/// Observer invoked once for every execution that reaches a terminal state.
pub trait ExecutionObserver: Send + Sync {
    /// Records a finished execution.
    fn on_finished(&self, result: &ExecutionResult);
}

/// Observer that logs outcomes through tracing.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ExecutionObserver for TracingObserver {
    fn on_finished(&self, result: &ExecutionResult) {
        let elapsed_ms = u64::try_from(result.elapsed.as_millis()).unwrap_or(u64::MAX);
        match result.state {
            ExecutionState::Completed => info!(
                execution_id = %result.execution_id,
                elapsed_ms,
                output_bytes = result.output.len(),
                truncated = result.truncated,
                "execution completed"
            ),
            state => warn!(
                execution_id = %result.execution_id,
                state = state.as_str(),
                elapsed_ms,
                error = result.error.as_ref().map_or("", |err| err.message.as_str()),
                "execution did not complete"
            ),
        }
    }
}

/// Observer used in tests to capture results.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    results: Mutex<Vec<ExecutionResult>>,
}

impl CollectingObserver {
    /// Creates a new collecting observer.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the collected results.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex has been poisoned by a previous panic.
    #[must_use]
    pub fn drain(&self) -> Vec<ExecutionResult> {
        let mut lock = self.results.lock().expect("collecting observer poisoned");
        lock.drain(..).collect()
    }
}

impl ExecutionObserver for CollectingObserver {
    fn on_finished(&self, result: &ExecutionResult) {
        self.results
            .lock()
            .expect("collecting observer poisoned")
            .push(result.clone());
    }
}

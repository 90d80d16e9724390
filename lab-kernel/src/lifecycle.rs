//! Lifecycle state machine for a single execution.

use lab_primitives::{ErrorKind, ExecutionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// States an execution moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Worker process started; input not yet handed over.
    Spawned,
    /// Worker is running user code.
    Running,
    /// Code finished without raising an error.
    Completed,
    /// Code raised an error or the worker failed.
    Failed,
    /// Deadline elapsed; the worker was killed and reaped.
    TimedOut,
    /// Worker exceeded its memory ceiling or output budget.
    ResourceExceeded,
}

impl ExecutionState {
    /// Returns `true` once no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::ResourceExceeded
        )
    }

    /// Stable wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spawned => "spawned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::ResourceExceeded => "resource_exceeded",
        }
    }

    /// Terminal state matching an error kind reported for the execution.
    #[must_use]
    pub const fn for_error(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Timeout => Self::TimedOut,
            ErrorKind::ResourceExceeded => Self::ResourceExceeded,
            _ => Self::Failed,
        }
    }
}

/// Events that trigger transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionEvent {
    /// Input delivered; the worker is running.
    Start,
    /// Worker returned without a script error.
    Complete,
    /// Worker reported an error or died.
    Fail,
    /// Deadline elapsed.
    Timeout,
    /// Memory or output ceiling hit.
    Exceed,
}

/// Per-execution state holder. Terminal states are final.
#[derive(Debug, Clone, Copy)]
pub struct Lifecycle {
    execution_id: ExecutionId,
    state: ExecutionState,
}

impl Lifecycle {
    /// Starts a lifecycle in [`ExecutionState::Spawned`].
    #[must_use]
    pub const fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            state: ExecutionState::Spawned,
        }
    }

    /// Execution the lifecycle belongs to.
    #[must_use]
    pub const fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ExecutionState {
        self.state
    }

    /// Applies an event, returning the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when the event is not
    /// allowed from the current state, including any event after a terminal
    /// state.
    pub fn transition(&mut self, event: ExecutionEvent) -> LifecycleResult<ExecutionState> {
        let next = match (self.state, event) {
            (ExecutionState::Spawned, ExecutionEvent::Start) => Some(ExecutionState::Running),
            (ExecutionState::Running, ExecutionEvent::Complete) => Some(ExecutionState::Completed),
            (ExecutionState::Spawned | ExecutionState::Running, ExecutionEvent::Fail) => {
                Some(ExecutionState::Failed)
            }
            (ExecutionState::Spawned | ExecutionState::Running, ExecutionEvent::Timeout) => {
                Some(ExecutionState::TimedOut)
            }
            (ExecutionState::Running, ExecutionEvent::Exceed) => {
                Some(ExecutionState::ResourceExceeded)
            }
            _ => None,
        };

        let Some(next_state) = next else {
            return Err(LifecycleError::InvalidTransition {
                execution_id: self.execution_id,
                from: self.state,
                event,
            });
        };

        debug!(
            execution_id = %self.execution_id,
            from = self.state.as_str(),
            to = next_state.as_str(),
            ?event,
            "execution transition"
        );
        self.state = next_state;
        Ok(next_state)
    }
}

/// Errors emitted by the lifecycle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    /// Transition was not permitted from the current state.
    #[error("invalid transition from {from:?} via {event:?} for execution {execution_id}")]
    InvalidTransition {
        /// Execution whose transition failed.
        execution_id: ExecutionId,
        /// State prior to the attempted transition.
        from: ExecutionState,
        /// Event that was rejected.
        event: ExecutionEvent,
    },
}

/// Result alias used for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_to_completed() {
        let mut lifecycle = Lifecycle::new(ExecutionId::random());
        assert_eq!(lifecycle.state(), ExecutionState::Spawned);
        lifecycle.transition(ExecutionEvent::Start).unwrap();
        assert_eq!(
            lifecycle.transition(ExecutionEvent::Complete).unwrap(),
            ExecutionState::Completed
        );
        assert!(lifecycle.state().is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        for event in [
            ExecutionEvent::Complete,
            ExecutionEvent::Fail,
            ExecutionEvent::Timeout,
            ExecutionEvent::Exceed,
        ] {
            let mut lifecycle = Lifecycle::new(ExecutionId::random());
            lifecycle.transition(ExecutionEvent::Start).unwrap();
            lifecycle.transition(event).unwrap();
            let before = lifecycle.state();
            assert!(lifecycle.transition(ExecutionEvent::Fail).is_err());
            assert!(lifecycle.transition(ExecutionEvent::Start).is_err());
            assert_eq!(lifecycle.state(), before);
        }
    }

    #[test]
    fn complete_requires_running() {
        let mut lifecycle = Lifecycle::new(ExecutionId::random());
        let err = lifecycle.transition(ExecutionEvent::Complete).unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidTransition {
                from: ExecutionState::Spawned,
                ..
            }
        ));
    }

    #[test]
    fn error_kinds_map_to_terminal_states() {
        assert_eq!(ExecutionState::for_error(ErrorKind::Timeout), ExecutionState::TimedOut);
        assert_eq!(
            ExecutionState::for_error(ErrorKind::AccessDenied),
            ExecutionState::Failed
        );
    }
}

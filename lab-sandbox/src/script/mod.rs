//! The analysis script language evaluated inside worker processes.
//!
//! Scripts are line oriented: `let` bindings, assignments, `if`/`else`,
//! `while` with `break`/`continue`, and bare expressions. Every call goes
//! through the [`ExecutionScope`](crate::ExecutionScope), so a script can
//! only reach the host through capabilities the scope grants.

mod eval;
mod lexer;
mod parser;
mod value;

use std::fmt::{self, Display, Formatter};

use lab_primitives::{Error as PrimitiveError, ErrorKind};
use lab_registry::RegistryError;

use crate::error::SandboxError;

pub use eval::{Interpreter, Outcome};
pub use parser::{BinaryOp, Expr, MAX_EXPR_DEPTH, MAX_NESTING, Program, Stmt, StmtKind, UnaryOp};
pub use value::ScriptValue;

/// Result alias for script evaluation.
pub type ScriptResult<T> = Result<T, ScriptError>;

/// Error raised while parsing or evaluating a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    kind: ErrorKind,
    message: String,
    line: Option<usize>,
}

impl Display for ScriptError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {line}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ScriptError {}

impl ScriptError {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
        }
    }

    /// Error raised by user code.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionError, message)
    }

    /// Malformed script text.
    #[must_use]
    pub fn syntax(line: usize, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message).at_line(line)
    }

    /// Use of a denied or disabled capability.
    #[must_use]
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccessDenied, message)
    }

    /// Allocation or output budget exhausted.
    #[must_use]
    pub fn resource_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExceeded, message)
    }

    /// Attaches a source line unless one is already recorded.
    #[must_use]
    pub fn at_line(mut self, line: usize) -> Self {
        self.line.get_or_insert(line);
        self
    }

    /// Error classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Message without the line prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Source line the error was raised on, if known.
    #[must_use]
    pub fn line(&self) -> Option<usize> {
        self.line
    }
}

impl From<RegistryError> for ScriptError {
    fn from(err: RegistryError) -> Self {
        let kind = match &err {
            RegistryError::Table(_) => ErrorKind::ExecutionError,
            other => other.kind(),
        };
        Self::new(kind, err.to_string())
    }
}

impl From<PrimitiveError> for ScriptError {
    fn from(err: PrimitiveError) -> Self {
        Self::execution(err.to_string())
    }
}

impl From<SandboxError> for ScriptError {
    fn from(err: SandboxError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

/// Parses script text into a program.
///
/// # Errors
///
/// Returns a [`ScriptError`] of kind [`ErrorKind::ValidationError`] pointing
/// at the offending line.
pub fn parse(source: &str) -> ScriptResult<Program> {
    let tokens = lexer::tokenize(source)?;
    parser::Parser::new(tokens).parse_program()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_line() {
        let err = ScriptError::execution("boom").at_line(3).at_line(7);
        assert_eq!(err.to_string(), "line 3: boom");
        assert_eq!(err.message(), "boom");
        assert_eq!(ScriptError::execution("boom").to_string(), "boom");
    }

    #[test]
    fn table_errors_are_execution_errors() {
        let err: ScriptError = RegistryError::Table(PrimitiveError::UnknownColumn {
            column: "x".into(),
        })
        .into();
        assert_eq!(err.kind(), ErrorKind::ExecutionError);

        let err: ScriptError = RegistryError::NotFound { name: "d".into() }.into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}

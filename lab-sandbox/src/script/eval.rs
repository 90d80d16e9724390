//! Tree-walking interpreter.

use std::collections::HashMap;
use std::sync::Arc;

use super::parser::{BinaryOp, Expr, Program, Stmt, StmtKind, UnaryOp};
use super::{ScriptError, ScriptResult, ScriptValue};
use crate::capability::CapabilityTable;
use crate::context::{CallContext, DEFAULT_OUTPUT_LIMIT, OutputBuffer};
use crate::protocol::Artifact;
use crate::scope::{Binding, ExecutionScope};

enum Flow {
    Normal,
    Break,
    Continue,
}

/// Everything a script run produced. Output captured before an error is
/// kept.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Printed output.
    pub output: String,
    /// True when printed output hit the cap.
    pub truncated: bool,
    /// Value of the final bare expression, when it was not null.
    pub value: Option<ScriptValue>,
    /// Artifacts emitted by the script.
    pub artifacts: Vec<Artifact>,
    /// Error that stopped the script.
    pub error: Option<ScriptError>,
}

/// Evaluates programs against one execution scope.
#[derive(Debug)]
pub struct Interpreter<'s> {
    scope: &'s ExecutionScope,
    vars: HashMap<String, ScriptValue>,
    output: OutputBuffer,
    artifacts: Vec<Artifact>,
    want_artifacts: bool,
}

impl<'s> Interpreter<'s> {
    /// Creates an interpreter over `scope` with default limits.
    #[must_use]
    pub fn new(scope: &'s ExecutionScope) -> Self {
        Self {
            scope,
            vars: HashMap::new(),
            output: OutputBuffer::new(DEFAULT_OUTPUT_LIMIT),
            artifacts: Vec::new(),
            want_artifacts: false,
        }
    }

    /// Caps captured output at `bytes`.
    #[must_use]
    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output = OutputBuffer::new(bytes);
        self
    }

    /// Enables artifact capture.
    #[must_use]
    pub fn with_artifacts(mut self, enabled: bool) -> Self {
        self.want_artifacts = enabled;
        self
    }

    /// Parses and runs `source`.
    #[must_use]
    pub fn run_source(self, source: &str) -> Outcome {
        match super::parse(source) {
            Ok(program) => self.run(&program),
            Err(err) => Outcome {
                error: Some(err),
                ..Outcome::default()
            },
        }
    }

    /// Runs a parsed program to completion or to its first error.
    #[must_use]
    pub fn run(mut self, program: &Program) -> Outcome {
        let mut value = None;
        let mut error = None;
        let last = program.statements.len().checked_sub(1);

        for (idx, stmt) in program.statements.iter().enumerate() {
            let result = match &stmt.kind {
                StmtKind::Expr(expr) if Some(idx) == last => self.eval(expr).map(|result| {
                    if !matches!(result, ScriptValue::Null) {
                        value = Some(result);
                    }
                }),
                _ => self.exec(stmt).map(|_| ()),
            };
            if let Err(err) = result {
                error = Some(err.at_line(stmt.line));
                break;
            }
        }

        let (output, truncated) = self.output.into_parts();
        Outcome {
            output,
            truncated,
            value,
            artifacts: self.artifacts,
            error,
        }
    }

    fn exec_block(&mut self, statements: &[Stmt]) -> ScriptResult<Flow> {
        for stmt in statements {
            match self.exec(stmt).map_err(|err| err.at_line(stmt.line))? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> ScriptResult<Flow> {
        match &stmt.kind {
            StmtKind::Let(name, expr) => {
                if self.scope.is_denied(name) {
                    return Err(ScriptError::access_denied(format!(
                        "`{name}` is denied by policy and cannot be rebound"
                    )));
                }
                let value = self.eval(expr)?;
                self.vars.insert(name.clone(), value);
            }
            StmtKind::Assign(name, expr) => {
                if !self.vars.contains_key(name) {
                    return Err(ScriptError::execution(format!(
                        "assignment to undeclared variable `{name}`; use `let`"
                    )));
                }
                let value = self.eval(expr)?;
                self.vars.insert(name.clone(), value);
            }
            StmtKind::If {
                cond,
                then,
                otherwise,
            } => {
                let branch = if self.eval(cond)?.is_truthy() {
                    then
                } else {
                    otherwise
                };
                return self.exec_block(branch);
            }
            StmtKind::While { cond, body } => {
                while self.eval(cond)?.is_truthy() {
                    if let Flow::Break = self.exec_block(body)? {
                        break;
                    }
                }
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
        }
        Ok(Flow::Normal)
    }

    fn eval(&mut self, expr: &Expr) -> ScriptResult<ScriptValue> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => self.lookup(name),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<ScriptResult<Vec<_>>>()
                .map(ScriptValue::List),
            Expr::Call { name, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<ScriptResult<Vec<_>>>()?;
                self.call(name, args)
            }
            Expr::Unary(op, inner) => {
                let value = self.eval(inner)?;
                unary(*op, &value)
            }
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                if !self.eval(lhs)?.is_truthy() {
                    return Ok(ScriptValue::Bool(false));
                }
                Ok(ScriptValue::Bool(self.eval(rhs)?.is_truthy()))
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                if self.eval(lhs)?.is_truthy() {
                    return Ok(ScriptValue::Bool(true));
                }
                Ok(ScriptValue::Bool(self.eval(rhs)?.is_truthy()))
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(*op, lhs, rhs)
            }
        }
    }

    fn lookup(&self, name: &str) -> ScriptResult<ScriptValue> {
        if let Some(value) = self.vars.get(name) {
            return Ok(value.clone());
        }
        match self.scope.binding(name) {
            Some(Binding::Denied) => Err(denied(name)),
            Some(Binding::Dataset(handle)) => Ok(ScriptValue::Dataset(Arc::clone(handle))),
            Some(Binding::Capability(_)) => Err(ScriptError::execution(format!(
                "`{name}` is a capability; call it as `{name}(...)`"
            ))),
            None => Err(ScriptError::execution(format!("undefined name `{name}`"))),
        }
    }

    fn call(&mut self, name: &str, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
        let scope = self.scope;
        match scope.binding(name) {
            Some(Binding::Denied) => Err(denied(name)),
            Some(Binding::Capability(spec)) => {
                let mut ctx = CallContext::new(
                    scope,
                    &mut self.output,
                    &mut self.artifacts,
                    self.want_artifacts,
                );
                spec.invoke(&mut ctx, args)
            }
            Some(Binding::Dataset(_)) => Err(ScriptError::execution(format!(
                "dataset `{name}` is not callable"
            ))),
            None if CapabilityTable::standard().contains(name) => Err(ScriptError::access_denied(
                format!("capability `{name}` is not enabled for this execution"),
            )),
            None => Err(ScriptError::execution(format!("unknown function `{name}`"))),
        }
    }
}

fn denied(name: &str) -> ScriptError {
    ScriptError::access_denied(format!("`{name}` is denied by policy"))
}

fn unary(op: UnaryOp, value: &ScriptValue) -> ScriptResult<ScriptValue> {
    match (op, value) {
        (UnaryOp::Not, value) => Ok(ScriptValue::Bool(!value.is_truthy())),
        (UnaryOp::Neg, ScriptValue::Int(v)) => v
            .checked_neg()
            .map(ScriptValue::Int)
            .ok_or_else(overflow),
        (UnaryOp::Neg, ScriptValue::Float(v)) => Ok(ScriptValue::Float(-v)),
        (UnaryOp::Neg, other) => Err(ScriptError::execution(format!(
            "cannot negate {}",
            other.type_name()
        ))),
    }
}

fn overflow() -> ScriptError {
    ScriptError::execution("integer overflow")
}

fn binary(op: BinaryOp, lhs: ScriptValue, rhs: ScriptValue) -> ScriptResult<ScriptValue> {
    use ScriptValue::{Float, Int, List, Text};

    let mismatch = |lhs: &ScriptValue, rhs: &ScriptValue| {
        ScriptError::execution(format!(
            "unsupported operand types for {op:?}: {} and {}",
            lhs.type_name(),
            rhs.type_name()
        ))
    };

    match op {
        BinaryOp::Eq => return Ok(ScriptValue::Bool(lhs.loose_eq(&rhs))),
        BinaryOp::Ne => return Ok(ScriptValue::Bool(!lhs.loose_eq(&rhs))),
        BinaryOp::Lt => return Ok(ScriptValue::Bool(lhs.compare(&rhs)?.is_lt())),
        BinaryOp::Le => return Ok(ScriptValue::Bool(lhs.compare(&rhs)?.is_le())),
        BinaryOp::Gt => return Ok(ScriptValue::Bool(lhs.compare(&rhs)?.is_gt())),
        BinaryOp::Ge => return Ok(ScriptValue::Bool(lhs.compare(&rhs)?.is_ge())),
        _ => {}
    }

    match (op, lhs, rhs) {
        (BinaryOp::Add, Text(mut a), Text(b)) => {
            a.push_str(&b);
            Ok(Text(a))
        }
        (BinaryOp::Add, List(mut a), List(b)) => {
            a.extend(b);
            Ok(List(a))
        }
        (BinaryOp::Add, Int(a), Int(b)) => a.checked_add(b).map(Int).ok_or_else(overflow),
        (BinaryOp::Sub, Int(a), Int(b)) => a.checked_sub(b).map(Int).ok_or_else(overflow),
        (BinaryOp::Mul, Int(a), Int(b)) => a.checked_mul(b).map(Int).ok_or_else(overflow),
        (BinaryOp::Rem, Int(_), Int(0)) | (BinaryOp::Div, _, Int(0)) => {
            Err(ScriptError::execution("division by zero"))
        }
        (BinaryOp::Rem, Int(a), Int(b)) => a.checked_rem(b).map(Int).ok_or_else(overflow),
        (op, lhs, rhs) => {
            let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
                return Err(mismatch(&lhs, &rhs));
            };
            match op {
                BinaryOp::Add => Ok(Float(a + b)),
                BinaryOp::Sub => Ok(Float(a - b)),
                BinaryOp::Mul => Ok(Float(a * b)),
                BinaryOp::Div | BinaryOp::Rem if b == 0.0 => {
                    Err(ScriptError::execution("division by zero"))
                }
                BinaryOp::Div => Ok(Float(a / b)),
                BinaryOp::Rem => Ok(Float(a % b)),
                _ => Err(mismatch(&lhs, &rhs)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use lab_primitives::{ErrorKind, Table};
    use lab_registry::{ColumnarWriter, DatasetRef};

    use super::*;
    use crate::protocol::ScopeManifest;

    fn scope_with(capabilities: &[&str], dir: &std::path::Path) -> ExecutionScope {
        let table = Table::from_text_rows(
            vec!["region".into(), "amount".into()],
            vec![
                vec!["east".into(), "10".into()],
                vec!["west".into(), "5".into()],
                vec!["east".into(), "7".into()],
            ],
        )
        .unwrap();
        let path = dir.join("sales.dlcol");
        ColumnarWriter::new("sales").write(&path, &table).unwrap();

        let manifest = ScopeManifest {
            datasets: BTreeMap::from([("sales".to_owned(), DatasetRef::Columnar { path })]),
            capabilities: capabilities.iter().map(|c| (*c).to_owned()).collect(),
            denied: BTreeSet::from(["exec".to_owned(), "open".to_owned()]),
            allowed_paths: vec![dir.join("out")],
        };
        ExecutionScope::from_manifest(&manifest, CapabilityTable::standard(), dir).unwrap()
    }

    fn all_capabilities() -> Vec<&'static str> {
        CapabilityTable::standard().names().collect()
    }

    fn run(scope: &ExecutionScope, source: &str) -> Outcome {
        Interpreter::new(scope).with_artifacts(true).run_source(source)
    }

    #[test]
    fn arithmetic_and_control_flow() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope_with(&all_capabilities(), dir.path());
        let outcome = run(
            &scope,
            "let total = 0\nlet i = 0\nwhile true {\n  i = i + 1\n  if i % 2 == 0 { continue }\n  if i > 7 { break }\n  total = total + i\n}\ntotal",
        );
        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert!(matches!(outcome.value, Some(ScriptValue::Int(16))));

        let outcome = run(&scope, "7 / 2");
        assert!(matches!(outcome.value, Some(ScriptValue::Float(v)) if (v - 3.5).abs() < 1e-9));
        let outcome = run(&scope, "\"a\" + \"b\"");
        assert!(matches!(outcome.value, Some(ScriptValue::Text(ref s)) if s == "ab"));
    }

    #[test]
    fn analysis_over_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope_with(&all_capabilities(), dir.path());
        let outcome = run(
            &scope,
            "let east = filter(sales, \"region\", \"==\", \"east\")\nprint(\"east rows:\", count(east))\nlet by = aggregate(sales, [\"region\"], [\"sum:amount\", \"count\"])\nprint(sum(sales, \"amount\"))\nsort(by, \"sum_amount\", true)",
        );
        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert_eq!(outcome.output, "east rows: 2\n22\n");
        let Some(ScriptValue::Table(table)) = outcome.value else {
            panic!("expected a table result");
        };
        assert_eq!(table.schema().names(), ["region", "sum_amount", "count"]);
        assert_eq!(table.rows()[0][0], lab_primitives::Value::Text("east".into()));
    }

    #[test]
    fn denied_names_fail_with_access_denied() {
        let dir = tempfile::tempdir().unwrap();
        let mut caps = all_capabilities();
        caps.push("exec");
        let scope = scope_with(&caps, dir.path());

        let outcome = run(&scope, "print(\"before\")\nexec(\"rm -rf /\")\nprint(\"after\")");
        let err = outcome.error.unwrap();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
        assert_eq!(err.line(), Some(2));
        assert_eq!(outcome.output, "before\n");

        let outcome = run(&scope, "let open = 1");
        assert_eq!(outcome.error.unwrap().kind(), ErrorKind::AccessDenied);
    }

    #[test]
    fn disabled_capability_is_access_denied_and_unknown_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope_with(&["print"], dir.path());
        let outcome = run(&scope, "read_text(\"/etc/passwd\")");
        assert_eq!(outcome.error.unwrap().kind(), ErrorKind::AccessDenied);
        let outcome = run(&scope, "frobnicate(1)");
        assert_eq!(outcome.error.unwrap().kind(), ErrorKind::ExecutionError);
    }

    #[test]
    fn file_capabilities_go_through_the_guard() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        let scope = scope_with(&all_capabilities(), dir.path());

        let outcome = run(&scope, "write_text(\"out/report.txt\", \"ok\")\nread_text(\"out/report.txt\")");
        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert!(matches!(outcome.value, Some(ScriptValue::Text(ref s)) if s == "ok"));

        let outcome = run(&scope, "write_text(\"out/../escape.txt\", \"x\")");
        assert_eq!(outcome.error.unwrap().kind(), ErrorKind::AccessDenied);
        assert!(!dir.path().join("escape.txt").exists());

        let outcome = run(&scope, "write_csv(\"out/sales.csv\", sales)\nlist_dir(\"out\")");
        let Some(ScriptValue::List(names)) = outcome.value else {
            panic!("expected a listing");
        };
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn runtime_errors_keep_prior_output() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope_with(&all_capabilities(), dir.path());
        let outcome = run(&scope, "print(1)\nlet x = 1 / 0");
        assert_eq!(outcome.output, "1\n");
        let err = outcome.error.unwrap();
        assert_eq!(err.kind(), ErrorKind::ExecutionError);
        assert_eq!(err.to_string(), "line 2: division by zero");

        let outcome = run(&scope, "fail(\"bad input\")");
        assert_eq!(outcome.error.unwrap().message(), "bad input");
        let outcome = run(&scope, "9223372036854775807 + 1");
        assert_eq!(outcome.error.unwrap().message(), "integer overflow");
    }

    #[test]
    fn output_cap_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope_with(&all_capabilities(), dir.path());
        let outcome = Interpreter::new(&scope)
            .with_output_limit(8)
            .run_source("let i = 0\nwhile i < 10 { print(\"line\")\n i = i + 1 }");
        assert!(outcome.truncated);
        assert_eq!(outcome.output.len(), 8);

        let outcome = run(&scope, "artifact(head(sales, 1))\nartifact(\"<svg/>\", \"image/svg+xml\")");
        assert_eq!(outcome.artifacts.len(), 2);
        assert_eq!(outcome.artifacts[0].media_type, "text/csv");
        assert_eq!(outcome.artifacts[0].data, b"region,amount\neast,10\n");

        let outcome = Interpreter::new(&scope).run_source("artifact(\"x\")");
        assert!(outcome.artifacts.is_empty());
    }

    #[test]
    fn oversized_allocation_is_resource_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope_with(&all_capabilities(), dir.path());
        let outcome = run(&scope, "repeat(\"abcdefgh\", 9223372036854775807)");
        assert_eq!(outcome.error.unwrap().kind(), ErrorKind::ResourceExceeded);
    }
}

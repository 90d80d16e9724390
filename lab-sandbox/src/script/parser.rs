//! Recursive-descent parser producing the statement tree.

use super::lexer::{Token, TokenKind};
use super::{ScriptError, ScriptResult, ScriptValue};

/// Deepest nesting of blocks, brackets, and prefix operators the parser
/// descends into.
pub const MAX_NESTING: usize = 64;

/// Deepest expression tree accepted, counting operator chains.
pub const MAX_EXPR_DEPTH: usize = 256;

/// Parsed script.
#[derive(Debug, Clone, Default)]
pub struct Program {
    /// Top-level statements in source order.
    pub statements: Vec<Stmt>,
}

/// Statement with its source line.
#[derive(Debug, Clone)]
pub struct Stmt {
    /// Statement body.
    pub kind: StmtKind,
    /// 1-based source line.
    pub line: usize,
}

/// Statement forms.
#[derive(Debug, Clone)]
pub enum StmtKind {
    /// `let name = expr`
    Let(String, Expr),
    /// `name = expr`
    Assign(String, Expr),
    /// `if cond { .. } else { .. }`
    If {
        /// Condition.
        cond: Expr,
        /// Taken when the condition is truthy.
        then: Vec<Stmt>,
        /// Taken otherwise; empty when there is no `else`.
        otherwise: Vec<Stmt>,
    },
    /// `while cond { .. }`
    While {
        /// Loop condition.
        cond: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// `break`
    Break,
    /// `continue`
    Continue,
    /// Bare expression.
    Expr(Expr),
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `not x`
    Not,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Expression tree.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Literal scalar.
    Literal(ScriptValue),
    /// Variable or scope binding.
    Ident(String),
    /// `[a, b, ..]`
    List(Vec<Expr>),
    /// `name(args..)`
    Call {
        /// Capability name.
        name: String,
        /// Arguments in order.
        args: Vec<Expr>,
    },
    /// Unary operation.
    Unary(UnaryOp, Box<Expr>),
    /// Binary operation.
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    loop_depth: usize,
    nesting: usize,
}

impl Parser {
    pub(crate) fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            loop_depth: 0,
            nesting: 0,
        }
    }

    pub(crate) fn parse_program(mut self) -> ScriptResult<Program> {
        let statements = self.parse_block_body(false)?;
        Ok(Program { statements })
    }

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn line(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].line
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> ScriptResult<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn unexpected(&self, what: &str) -> ScriptError {
        let found = match self.peek() {
            TokenKind::Eof => "end of input".to_owned(),
            TokenKind::Newline => "end of line".to_owned(),
            other => format!("{other:?}"),
        };
        ScriptError::syntax(self.line(), format!("expected {what}, found {found}"))
    }

    /// Runs `parse` one nesting level deeper, failing past [`MAX_NESTING`].
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> ScriptResult<T>) -> ScriptResult<T> {
        if self.nesting == MAX_NESTING {
            return Err(ScriptError::syntax(
                self.line(),
                format!("nesting deeper than {MAX_NESTING} levels"),
            ));
        }
        self.nesting += 1;
        let result = parse(self);
        self.nesting -= 1;
        result
    }

    /// Depth of a node whose deepest child has depth `child`.
    fn deeper(&self, child: usize) -> ScriptResult<usize> {
        let depth = child + 1;
        if depth > MAX_EXPR_DEPTH {
            return Err(ScriptError::syntax(
                self.line(),
                format!("expression deeper than {MAX_EXPR_DEPTH} levels"),
            ));
        }
        Ok(depth)
    }

    fn skip_newlines(&mut self) {
        while self.eat(&TokenKind::Newline) {}
    }

    /// Parses statements until `}` (when `braced`) or end of input.
    fn parse_block_body(&mut self, braced: bool) -> ScriptResult<Vec<Stmt>> {
        let mut statements = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                TokenKind::Eof if braced => return Err(self.unexpected("`}`")),
                TokenKind::Eof => return Ok(statements),
                TokenKind::RBrace if braced => {
                    self.advance();
                    return Ok(statements);
                }
                _ => {}
            }
            statements.push(self.parse_statement()?);
            match self.peek() {
                TokenKind::Newline | TokenKind::Eof => {}
                TokenKind::RBrace if braced => {}
                _ => return Err(self.unexpected("end of statement")),
            }
        }
    }

    fn parse_block(&mut self) -> ScriptResult<Vec<Stmt>> {
        self.nested(|parser| {
            parser.expect(&TokenKind::LBrace, "`{`")?;
            parser.parse_block_body(true)
        })
    }

    fn parse_statement(&mut self) -> ScriptResult<Stmt> {
        let line = self.line();
        let kind = match self.peek().clone() {
            TokenKind::Let => {
                self.advance();
                let TokenKind::Ident(name) = self.advance() else {
                    return Err(ScriptError::syntax(line, "expected a name after `let`"));
                };
                self.expect(&TokenKind::Assign, "`=`")?;
                StmtKind::Let(name, self.parse_expr()?)
            }
            TokenKind::Ident(name)
                if self.tokens.get(self.pos + 1).map(|t| &t.kind) == Some(&TokenKind::Assign) =>
            {
                self.pos += 2;
                StmtKind::Assign(name, self.parse_expr()?)
            }
            TokenKind::If => self.parse_if()?,
            TokenKind::While => {
                self.advance();
                let cond = self.parse_expr()?;
                self.loop_depth += 1;
                let body = self.parse_block();
                self.loop_depth -= 1;
                StmtKind::While { cond, body: body? }
            }
            TokenKind::Break | TokenKind::Continue => {
                let kind = self.advance();
                if self.loop_depth == 0 {
                    return Err(ScriptError::syntax(line, "`break`/`continue` outside a loop"));
                }
                if kind == TokenKind::Break {
                    StmtKind::Break
                } else {
                    StmtKind::Continue
                }
            }
            _ => StmtKind::Expr(self.parse_expr()?),
        };
        Ok(Stmt { kind, line })
    }

    fn parse_if(&mut self) -> ScriptResult<StmtKind> {
        self.expect(&TokenKind::If, "`if`")?;
        let cond = self.parse_expr()?;
        let then = self.parse_block()?;

        // `else` may sit on the line after the closing brace.
        let save = self.pos;
        self.skip_newlines();
        let otherwise = if self.eat(&TokenKind::Else) {
            if *self.peek() == TokenKind::If {
                let line = self.line();
                vec![Stmt {
                    kind: self.nested(Self::parse_if)?,
                    line,
                }]
            } else {
                self.parse_block()?
            }
        } else {
            self.pos = save;
            Vec::new()
        };
        Ok(StmtKind::If {
            cond,
            then,
            otherwise,
        })
    }

    fn parse_expr(&mut self) -> ScriptResult<Expr> {
        self.parse_nested_expr().map(|(expr, _)| expr)
    }

    // Expression parsers return the node together with its tree depth.

    fn parse_nested_expr(&mut self) -> ScriptResult<(Expr, usize)> {
        self.nested(Self::parse_or)
    }

    fn parse_or(&mut self) -> ScriptResult<(Expr, usize)> {
        let (mut lhs, mut depth) = self.parse_and()?;
        while self.eat(&TokenKind::Or) {
            let (rhs, rhs_depth) = self.parse_and()?;
            depth = self.deeper(depth.max(rhs_depth))?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok((lhs, depth))
    }

    fn parse_and(&mut self) -> ScriptResult<(Expr, usize)> {
        let (mut lhs, mut depth) = self.parse_not()?;
        while self.eat(&TokenKind::And) {
            let (rhs, rhs_depth) = self.parse_not()?;
            depth = self.deeper(depth.max(rhs_depth))?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok((lhs, depth))
    }

    fn parse_not(&mut self) -> ScriptResult<(Expr, usize)> {
        if self.eat(&TokenKind::Not) {
            let (inner, depth) = self.nested(Self::parse_not)?;
            return Ok((Expr::Unary(UnaryOp::Not, Box::new(inner)), self.deeper(depth)?));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ScriptResult<(Expr, usize)> {
        let (lhs, lhs_depth) = self.parse_additive()?;
        let op = match self.peek() {
            TokenKind::Eq => BinaryOp::Eq,
            TokenKind::Ne => BinaryOp::Ne,
            TokenKind::Lt => BinaryOp::Lt,
            TokenKind::Le => BinaryOp::Le,
            TokenKind::Gt => BinaryOp::Gt,
            TokenKind::Ge => BinaryOp::Ge,
            _ => return Ok((lhs, lhs_depth)),
        };
        self.advance();
        let (rhs, rhs_depth) = self.parse_additive()?;
        let depth = self.deeper(lhs_depth.max(rhs_depth))?;
        Ok((Expr::Binary(op, Box::new(lhs), Box::new(rhs)), depth))
    }

    fn parse_additive(&mut self) -> ScriptResult<(Expr, usize)> {
        let (mut lhs, mut depth) = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok((lhs, depth)),
            };
            self.advance();
            let (rhs, rhs_depth) = self.parse_multiplicative()?;
            depth = self.deeper(depth.max(rhs_depth))?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_multiplicative(&mut self) -> ScriptResult<(Expr, usize)> {
        let (mut lhs, mut depth) = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Rem,
                _ => return Ok((lhs, depth)),
            };
            self.advance();
            let (rhs, rhs_depth) = self.parse_unary()?;
            depth = self.deeper(depth.max(rhs_depth))?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> ScriptResult<(Expr, usize)> {
        if self.eat(&TokenKind::Minus) {
            let (inner, depth) = self.nested(Self::parse_unary)?;
            return Ok((Expr::Unary(UnaryOp::Neg, Box::new(inner)), self.deeper(depth)?));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> ScriptResult<(Expr, usize)> {
        fn literal(value: ScriptValue) -> ScriptResult<(Expr, usize)> {
            Ok((Expr::Literal(value), 1))
        }

        let start = self.pos;
        match self.advance() {
            TokenKind::Int(v) => literal(ScriptValue::Int(v)),
            TokenKind::Float(v) => literal(ScriptValue::Float(v)),
            TokenKind::Text(v) => literal(ScriptValue::Text(v)),
            TokenKind::True => literal(ScriptValue::Bool(true)),
            TokenKind::False => literal(ScriptValue::Bool(false)),
            TokenKind::Null => literal(ScriptValue::Null),
            TokenKind::LParen => {
                let inner = self.parse_nested_expr()?;
                self.expect(&TokenKind::RParen, "`)`")?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                let (items, depth) = self.parse_list(&TokenKind::RBracket, "`]`")?;
                Ok((Expr::List(items), self.deeper(depth)?))
            }
            TokenKind::Ident(name) => {
                if self.eat(&TokenKind::LParen) {
                    let (args, depth) = self.parse_list(&TokenKind::RParen, "`)`")?;
                    Ok((Expr::Call { name, args }, self.deeper(depth)?))
                } else {
                    Ok((Expr::Ident(name), 1))
                }
            }
            _ => {
                self.pos = start;
                Err(self.unexpected("an expression"))
            }
        }
    }

    /// Parses comma-separated expressions up to `close`, allowing a trailing
    /// comma. Returns the items and the depth of the deepest one.
    fn parse_list(&mut self, close: &TokenKind, what: &str) -> ScriptResult<(Vec<Expr>, usize)> {
        let mut items = Vec::new();
        let mut depth = 0;
        if self.eat(close) {
            return Ok((items, depth));
        }
        loop {
            let (item, item_depth) = self.parse_nested_expr()?;
            items.push(item);
            depth = depth.max(item_depth);
            if self.eat(&TokenKind::Comma) {
                if self.eat(close) {
                    return Ok((items, depth));
                }
                continue;
            }
            self.expect(close, what)?;
            return Ok((items, depth));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::parse;
    use super::*;

    #[test]
    fn parses_control_flow() {
        let program = parse(
            "let total = 0\nlet i = 0\nwhile i < 3 {\n  if i == 1 { continue } else if i > 5 { break }\n  total = total + i\n  i = i + 1\n}\ntotal",
        )
        .unwrap();
        assert_eq!(program.statements.len(), 4);
        assert!(matches!(program.statements[2].kind, StmtKind::While { .. }));
        assert_eq!(program.statements[3].line, 8);
    }

    #[test]
    fn respects_precedence() {
        let program = parse("1 + 2 * 3 == 7 and not false").unwrap();
        let StmtKind::Expr(Expr::Binary(BinaryOp::And, lhs, _)) = &program.statements[0].kind
        else {
            panic!("expected `and` at the root");
        };
        assert!(matches!(**lhs, Expr::Binary(BinaryOp::Eq, _, _)));
    }

    #[test]
    fn calls_span_lines() {
        let program = parse("aggregate(\n  sales,\n  [\"region\"],\n  [\"sum:amount\"],\n)").unwrap();
        let StmtKind::Expr(Expr::Call { name, args }) = &program.statements[0].kind else {
            panic!("expected a call");
        };
        assert_eq!(name, "aggregate");
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn else_may_follow_on_next_line() {
        let program = parse("if true {\n 1\n}\nelse {\n 2\n}").unwrap();
        let StmtKind::If { otherwise, .. } = &program.statements[0].kind else {
            panic!("expected if");
        };
        assert_eq!(otherwise.len(), 1);
    }

    #[test]
    fn bounds_nesting_instead_of_overflowing() {
        let deep = 200_000;
        let parens = format!("{}1{}", "(".repeat(deep), ")".repeat(deep));
        let err = parse(&parens).unwrap_err();
        assert_eq!(err.kind(), lab_primitives::ErrorKind::ValidationError);
        assert_eq!(err.line(), Some(1));

        let ifs = format!("{}1\n{}", "if true {\n".repeat(10_000), "}\n".repeat(10_000));
        assert!(parse(&ifs).unwrap_err().to_string().contains("nesting"));
        let loops = format!("{}break\n{}", "while true {\n".repeat(10_000), "}\n".repeat(10_000));
        assert!(parse(&loops).unwrap_err().to_string().contains("nesting"));
        let else_ifs = format!("if false {{ 1 }}{}", " else if false { 1 }".repeat(10_000));
        assert!(parse(&else_ifs).is_err());
        assert!(parse(&format!("{}1", "-".repeat(100_000))).is_err());
        assert!(parse(&format!("{}[1]{}", "[".repeat(5_000), "]".repeat(5_000))).is_err());

        let chain = format!("1{}", " + 1".repeat(100_000));
        assert!(parse(&chain).unwrap_err().to_string().contains("expression deeper"));
    }

    #[test]
    fn moderate_nesting_still_parses() {
        let parens = format!("{}1{}", "(".repeat(40), ")".repeat(40));
        assert!(parse(&parens).is_ok());
        let blocks = format!("{}1\n{}", "if true {\n".repeat(20), "}\n".repeat(20));
        assert!(parse(&blocks).is_ok());
        assert!(parse(&format!("1{}", " + 1".repeat(200))).is_ok());
    }

    #[test]
    fn rejects_malformed_scripts() {
        assert!(parse("let = 3").is_err());
        assert!(parse("break").is_err());
        assert!(parse("if x { 1").is_err());
        assert!(parse("1 2").is_err());
        let err = parse("x = 1\ny = (2 +").unwrap_err();
        assert_eq!(err.line(), Some(2));
        assert_eq!(err.kind(), lab_primitives::ErrorKind::ValidationError);
    }
}

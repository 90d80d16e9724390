//! Tokenizer.

use super::{ScriptError, ScriptResult};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Int(i64),
    Float(f64),
    Text(String),
    Ident(String),
    Let,
    If,
    Else,
    While,
    Break,
    Continue,
    True,
    False,
    Null,
    And,
    Or,
    Not,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Newline,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub(crate) kind: TokenKind,
    pub(crate) line: usize,
}

fn keyword(word: &str) -> Option<TokenKind> {
    Some(match word {
        "let" => TokenKind::Let,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "while" => TokenKind::While,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "null" => TokenKind::Null,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        _ => return None,
    })
}

/// Splits source text into tokens. Newlines inside `()` and `[]` are
/// dropped so calls and lists may span lines; `;` acts as a newline.
pub(crate) fn tokenize(source: &str) -> ScriptResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1;
    let mut depth = 0usize;

    while let Some(&ch) = chars.peek() {
        let kind = match ch {
            '\n' | ';' => {
                chars.next();
                let at = line;
                if ch == '\n' {
                    line += 1;
                }
                if depth == 0 {
                    tokens.push(Token {
                        kind: TokenKind::Newline,
                        line: at,
                    });
                }
                continue;
            }
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '#' => {
                while chars.peek().is_some_and(|c| *c != '\n') {
                    chars.next();
                }
                continue;
            }
            '"' | '\'' => {
                chars.next();
                lex_string(&mut chars, ch, &mut line)?
            }
            c if c.is_ascii_digit() => lex_number(&mut chars, line)?,
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                keyword(&word).unwrap_or(TokenKind::Ident(word))
            }
            _ => {
                chars.next();
                let next_is_eq = chars.peek() == Some(&'=');
                let kind = match ch {
                    '(' => TokenKind::LParen,
                    ')' => TokenKind::RParen,
                    '[' => TokenKind::LBracket,
                    ']' => TokenKind::RBracket,
                    '{' => TokenKind::LBrace,
                    '}' => TokenKind::RBrace,
                    ',' => TokenKind::Comma,
                    '+' => TokenKind::Plus,
                    '-' => TokenKind::Minus,
                    '*' => TokenKind::Star,
                    '/' => TokenKind::Slash,
                    '%' => TokenKind::Percent,
                    '=' if next_is_eq => TokenKind::Eq,
                    '=' => TokenKind::Assign,
                    '!' if next_is_eq => TokenKind::Ne,
                    '<' if next_is_eq => TokenKind::Le,
                    '<' => TokenKind::Lt,
                    '>' if next_is_eq => TokenKind::Ge,
                    '>' => TokenKind::Gt,
                    other => {
                        return Err(ScriptError::syntax(
                            line,
                            format!("unexpected character `{other}`"),
                        ));
                    }
                };
                if matches!(
                    kind,
                    TokenKind::Eq | TokenKind::Ne | TokenKind::Le | TokenKind::Ge
                ) {
                    chars.next();
                }
                match kind {
                    TokenKind::LParen | TokenKind::LBracket => depth += 1,
                    TokenKind::RParen | TokenKind::RBracket => depth = depth.saturating_sub(1),
                    _ => {}
                }
                kind
            }
        };
        tokens.push(Token { kind, line });
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        line,
    });
    Ok(tokens)
}

fn lex_string(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    quote: char,
    line: &mut usize,
) -> ScriptResult<TokenKind> {
    let start = *line;
    let mut text = String::new();
    loop {
        match chars.next() {
            None => return Err(ScriptError::syntax(start, "unterminated string literal")),
            Some(c) if c == quote => return Ok(TokenKind::Text(text)),
            Some('\\') => match chars.next() {
                Some('n') => text.push('\n'),
                Some('t') => text.push('\t'),
                Some('r') => text.push('\r'),
                Some('0') => text.push('\0'),
                Some(c @ ('\\' | '"' | '\'')) => text.push(c),
                Some(other) => {
                    return Err(ScriptError::syntax(
                        *line,
                        format!("unknown escape `\\{other}`"),
                    ));
                }
                None => return Err(ScriptError::syntax(start, "unterminated string literal")),
            },
            Some(c) => {
                if c == '\n' {
                    *line += 1;
                }
                text.push(c);
            }
        }
    }
}

fn lex_number(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    line: usize,
) -> ScriptResult<TokenKind> {
    let mut digits = String::new();
    let mut is_float = false;
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() || c == '_' {
            if c != '_' {
                digits.push(c);
            }
        } else if c == '.' && !is_float {
            is_float = true;
            digits.push(c);
        } else if (c == 'e' || c == 'E') && !digits.contains(['e', 'E']) {
            is_float = true;
            digits.push(c);
            chars.next();
            if let Some(&sign @ ('+' | '-')) = chars.peek() {
                digits.push(sign);
                chars.next();
            }
            continue;
        } else {
            break;
        }
        chars.next();
    }

    if is_float {
        digits
            .parse::<f64>()
            .map(TokenKind::Float)
            .map_err(|_| ScriptError::syntax(line, format!("invalid number `{digits}`")))
    } else {
        digits
            .parse::<i64>()
            .map(TokenKind::Int)
            .map_err(|_| ScriptError::syntax(line, format!("integer `{digits}` out of range")))
    }
}

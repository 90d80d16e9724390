//! Query safety validation.
//!
//! Two passes run over every query. The first is a lexical scan of unquoted
//! words against keyword rules; it skips string literals, quoted identifiers,
//! and comments. The second parses the text with a SQLite grammar and
//! requires exactly one query statement. The lexical scan is a heuristic, not
//! an authorizer: the engine connection is read-only regardless.

use std::fmt::{self, Display, Formatter};

use lab_primitives::ErrorKind;
use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use thiserror::Error;
use tracing::{debug, warn};

use crate::decision::PolicyDecision;

/// Errors surfaced by policy checks.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Policy configuration was rejected.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
    /// Query text was empty.
    #[error("query is empty")]
    EmptyQuery,
    /// Query matched a forbidden statement class.
    #[error("query rejected: {class} keyword `{keyword}` is not allowed")]
    Rejected {
        /// Statement class that matched.
        class: StatementClass,
        /// Keyword sequence that matched.
        keyword: String,
    },
    /// Parsed statement is not a read query.
    #[error("query rejected: only SELECT queries are allowed, found {statement}")]
    NotAQuery {
        /// Leading words of the offending statement.
        statement: String,
    },
    /// More than one statement was supplied.
    #[error("query rejected: expected a single statement, found {count}")]
    MultipleStatements {
        /// Number of statements parsed.
        count: usize,
    },
}

impl PolicyError {
    /// Maps the error onto the shared taxonomy.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ValidationError
    }
}

/// Result alias for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Class of statement a query rule guards against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementClass {
    /// `DROP`, `ALTER`, `CREATE`, `TRUNCATE`, `RENAME`.
    SchemaMutation,
    /// `INSERT`, `UPDATE`, `DELETE`, `REPLACE`, `MERGE`, `UPSERT`.
    DataMutation,
    /// `GRANT`, `REVOKE`.
    PrivilegeManagement,
    /// `CREATE USER`, `DROP ROLE`, and friends.
    UserManagement,
    /// `ATTACH`, `DETACH`, `PRAGMA`, `VACUUM`, `REINDEX`.
    EngineControl,
}

impl StatementClass {
    /// Stable label used in rule names and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SchemaMutation => "schema_mutation",
            Self::DataMutation => "data_mutation",
            Self::PrivilegeManagement => "privilege_management",
            Self::UserManagement => "user_management",
            Self::EngineControl => "engine_control",
        }
    }
}

impl Display for StatementClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keyword sequence mapped to a statement class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRule {
    class: StatementClass,
    keywords: Vec<String>,
    allows_call: bool,
}

impl QueryRule {
    /// Creates a rule matching `keywords` as consecutive words.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidPolicy`] if no keyword is supplied.
    pub fn new<I, S>(class: StatementClass, keywords: I) -> PolicyResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords: Vec<String> = keywords
            .into_iter()
            .map(|word| word.as_ref().trim().to_ascii_uppercase())
            .filter(|word| !word.is_empty())
            .collect();
        if keywords.is_empty() {
            return Err(PolicyError::InvalidPolicy(
                "query rule needs at least one keyword".into(),
            ));
        }
        Ok(Self {
            class,
            keywords,
            allows_call: false,
        })
    }

    /// Lets the last keyword through when it is used as a function name,
    /// as in `SELECT replace(name, 'a', 'b')`.
    #[must_use]
    pub fn allowing_calls(mut self) -> Self {
        self.allows_call = true;
        self
    }

    /// Statement class of the rule.
    #[must_use]
    pub fn class(&self) -> StatementClass {
        self.class
    }

    /// Keyword sequence, space separated.
    #[must_use]
    pub fn pattern(&self) -> String {
        self.keywords.join(" ")
    }

    fn matches_at(&self, words: &[Lexeme], start: usize) -> bool {
        let Some(window) = words.get(start..start + self.keywords.len()) else {
            return false;
        };
        let call_position = window.len() - 1;
        window
            .iter()
            .zip(&self.keywords)
            .enumerate()
            .all(|(idx, (word, keyword))| {
                word.text == *keyword
                    && !(self.allows_call && idx == call_position && word.is_call)
            })
    }
}

/// Checks query text before it reaches the relational engine.
pub trait QueryGuard: Send + Sync {
    /// Evaluates `sql`, producing an allow or deny decision.
    fn evaluate(&self, sql: &str) -> PolicyDecision;

    /// Evaluates `sql` and converts a deny decision into an error.
    ///
    /// # Errors
    ///
    /// Returns the [`PolicyError`] describing why the query was rejected.
    fn validate(&self, sql: &str) -> PolicyResult<PolicyDecision>;
}

#[derive(Debug, Clone)]
struct Lexeme {
    text: String,
    is_call: bool,
}

/// Default [`QueryGuard`] implementation.
#[derive(Debug, Clone)]
pub struct QueryValidator {
    rules: Vec<QueryRule>,
    require_parse: bool,
}

impl Default for QueryValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryValidator {
    /// Creates a validator with the standard rule set.
    #[must_use]
    pub fn new() -> Self {
        let mut rules = Vec::new();
        let mut add = |class, words: &[&str]| {
            rules.push(QueryRule {
                class,
                keywords: words.iter().map(|word| (*word).to_owned()).collect(),
                // REPLACE doubles as a scalar function.
                allows_call: words == ["REPLACE"],
            });
        };

        for verb in ["CREATE", "ALTER", "DROP"] {
            for object in ["USER", "ROLE"] {
                add(StatementClass::UserManagement, &[verb, object]);
            }
        }
        for word in ["DROP", "ALTER", "CREATE", "TRUNCATE", "RENAME"] {
            add(StatementClass::SchemaMutation, &[word]);
        }
        for word in ["INSERT", "UPDATE", "DELETE", "REPLACE", "MERGE", "UPSERT"] {
            add(StatementClass::DataMutation, &[word]);
        }
        for word in ["GRANT", "REVOKE"] {
            add(StatementClass::PrivilegeManagement, &[word]);
        }
        for word in ["ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX"] {
            add(StatementClass::EngineControl, &[word]);
        }

        Self {
            rules,
            require_parse: false,
        }
    }

    /// Appends a rule. Rules are checked in insertion order, after the
    /// standard set.
    #[must_use]
    pub fn with_rule(mut self, rule: QueryRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// When set, text the grammar cannot parse is rejected instead of being
    /// allowed with a warning.
    #[must_use]
    pub fn require_parse(mut self, require: bool) -> Self {
        self.require_parse = require;
        self
    }

    /// Returns the configured rules.
    #[must_use]
    pub fn rules(&self) -> &[QueryRule] {
        &self.rules
    }

    fn lexemes(sql: &str) -> Vec<Lexeme> {
        let dialect = SQLiteDialect {};
        match Tokenizer::new(&dialect, sql).tokenize() {
            Ok(tokens) => {
                let significant: Vec<&Token> = tokens
                    .iter()
                    .filter(|token| !matches!(token, Token::Whitespace(_)))
                    .collect();
                significant
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, token)| match token {
                        Token::Word(word) if word.quote_style.is_none() => Some(Lexeme {
                            text: word.value.to_ascii_uppercase(),
                            is_call: matches!(significant.get(idx + 1), Some(Token::LParen)),
                        }),
                        _ => None,
                    })
                    .collect()
            }
            Err(err) => {
                debug!(%err, "tokenizer failed; falling back to raw word split");
                sql.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .filter(|word| !word.is_empty())
                    .map(|word| Lexeme {
                        text: word.to_ascii_uppercase(),
                        is_call: false,
                    })
                    .collect()
            }
        }
    }

    fn scan(&self, sql: &str) -> Option<(StatementClass, String)> {
        let words = Self::lexemes(sql);
        for start in 0..words.len() {
            if let Some(rule) = self.rules.iter().find(|rule| rule.matches_at(&words, start)) {
                return Some((rule.class, rule.pattern()));
            }
        }
        None
    }

    fn check_grammar(&self, sql: &str) -> PolicyResult<Option<String>> {
        let dialect = SQLiteDialect {};
        let statements = match Parser::parse_sql(&dialect, sql) {
            Ok(statements) => statements,
            Err(err) if !self.require_parse => {
                warn!(%err, "query did not parse; allowing after lexical check");
                return Ok(Some(format!("query was not parsed: {err}")));
            }
            Err(err) => {
                return Err(PolicyError::NotAQuery {
                    statement: format!("unparseable text ({err})"),
                });
            }
        };

        match statements.as_slice() {
            [] => Err(PolicyError::EmptyQuery),
            [statement] if is_read_query(statement) => Ok(None),
            [statement] => Err(PolicyError::NotAQuery {
                statement: leading_words(statement),
            }),
            many => Err(PolicyError::MultipleStatements { count: many.len() }),
        }
    }

    fn check(&self, sql: &str) -> PolicyResult<PolicyDecision> {
        if sql.trim().is_empty() {
            return Err(PolicyError::EmptyQuery);
        }
        if let Some((class, keyword)) = self.scan(sql) {
            return Err(PolicyError::Rejected { class, keyword });
        }
        let decision = match self.check_grammar(sql)? {
            Some(warning) => PolicyDecision::allow().with_warning(warning),
            None => PolicyDecision::allow(),
        };
        Ok(decision)
    }
}

fn is_read_query(statement: &Statement) -> bool {
    match statement {
        Statement::Query(_) => true,
        Statement::Explain { statement, .. } => matches!(statement.as_ref(), Statement::Query(_)),
        _ => false,
    }
}

fn leading_words(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

impl QueryGuard for QueryValidator {
    fn evaluate(&self, sql: &str) -> PolicyDecision {
        match self.check(sql) {
            Ok(decision) => decision,
            Err(PolicyError::Rejected { class, keyword }) => {
                PolicyDecision::deny(class.as_str(), format!("{class} keyword `{keyword}`"))
            }
            Err(err) => PolicyDecision::deny("grammar", err.to_string()),
        }
    }

    fn validate(&self, sql: &str) -> PolicyResult<PolicyDecision> {
        let result = self.check(sql);
        if let Err(err) = &result {
            debug!(%err, "query rejected");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(sql: &str) -> (StatementClass, String) {
        match QueryValidator::new().validate(sql) {
            Err(PolicyError::Rejected { class, keyword }) => (class, keyword),
            other => panic!("expected lexical rejection for {sql:?}, got {other:?}"),
        }
    }

    #[test]
    fn allows_plain_selects() {
        let validator = QueryValidator::new();
        for sql in [
            "SELECT COUNT(*) FROM logs",
            "select region, sum(amount) from sales group by region",
            "WITH t AS (SELECT 1 AS x) SELECT x FROM t",
            "EXPLAIN SELECT * FROM logs",
        ] {
            let decision = validator.validate(sql).unwrap();
            assert!(decision.is_allow(), "{sql}");
            assert!(decision.warnings().is_empty(), "{sql}");
        }
    }

    #[test]
    fn rejects_each_statement_class() {
        assert_eq!(
            rejected("DROP TABLE logs"),
            (StatementClass::SchemaMutation, "DROP".into())
        );
        assert_eq!(rejected("delete from logs").0, StatementClass::DataMutation);
        assert_eq!(rejected("GRANT ALL ON x TO y").0, StatementClass::PrivilegeManagement);
        assert_eq!(
            rejected("create user mallory"),
            (StatementClass::UserManagement, "CREATE USER".into())
        );
        assert_eq!(rejected("ATTACH 'x.db' AS x").0, StatementClass::EngineControl);
        assert_eq!(rejected("PRAGMA writable_schema = 1").0, StatementClass::EngineControl);
    }

    #[test]
    fn ignores_keywords_inside_literals_comments_and_quoted_identifiers() {
        let validator = QueryValidator::new();
        for sql in [
            "SELECT 'DROP TABLE logs' AS note",
            "SELECT \"delete\" FROM logs",
            "SELECT 1 -- drop table logs",
            "SELECT /* insert */ 1",
            "SELECT replace(name, 'a', 'b') FROM logs",
        ] {
            assert!(validator.validate(sql).is_ok(), "{sql}");
        }
    }

    #[test]
    fn catches_mutations_hidden_behind_a_select() {
        assert_eq!(
            rejected("SELECT 1; DROP TABLE logs").0,
            StatementClass::SchemaMutation
        );
        assert_eq!(rejected("select * from x;\ninsert into y values (1)").0, StatementClass::DataMutation);
    }

    #[test]
    fn grammar_pass_rejects_multiple_statements_and_non_queries() {
        let validator = QueryValidator::new();
        assert!(matches!(
            validator.validate("SELECT 1; SELECT 2"),
            Err(PolicyError::MultipleStatements { count: 2 })
        ));
        assert!(matches!(
            validator.validate("BEGIN TRANSACTION"),
            Err(PolicyError::NotAQuery { .. })
        ));
    }

    #[test]
    fn unparseable_text_passes_with_warning_unless_strict() {
        let sql = "SELECT * FROM logs WHERE (";
        let decision = QueryValidator::new().validate(sql).unwrap();
        assert_eq!(decision.warnings().len(), 1);
        assert!(QueryValidator::new().require_parse(true).validate(sql).is_err());
    }

    #[test]
    fn empty_text_is_rejected() {
        assert!(matches!(
            QueryValidator::new().validate("   \n"),
            Err(PolicyError::EmptyQuery)
        ));
        assert!(QueryValidator::new().evaluate("").is_deny());
    }

    #[test]
    fn custom_rules_extend_the_standard_set() {
        let validator = QueryValidator::new()
            .with_rule(QueryRule::new(StatementClass::EngineControl, ["load_extension"]).unwrap());
        assert!(validator.validate("SELECT load_extension('x')").is_err());
        assert!(validator.validate("SELECT load_extension FROM t").is_err());
        assert!(validator.validate("SELECT replace(name, 'a', 'b') FROM t").is_ok());
        assert!(validator.validate("REPLACE INTO t VALUES (1)").is_err());

        let lenient = QueryValidator::new().with_rule(
            QueryRule::new(StatementClass::EngineControl, ["load_extension"])
                .unwrap()
                .allowing_calls(),
        );
        assert!(lenient.validate("SELECT load_extension('x')").is_ok());
        let decision = validator.evaluate("DROP TABLE x");
        assert_eq!(decision.rule(), Some("schema_mutation"));
    }
}

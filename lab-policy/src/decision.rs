//! Verdicts produced by the query validator.

use serde::{Deserialize, Serialize};

/// Whether a query may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// Query may run.
    Allow,
    /// Query is refused.
    Deny,
}

/// Verdict with the rule that fired and any warnings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    kind: DecisionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rule: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
}

impl PolicyDecision {
    /// Plain allow.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            kind: DecisionKind::Allow,
            reason: None,
            rule: None,
            warnings: Vec::new(),
        }
    }

    /// Returns a deny decision attributed to `rule`.
    #[must_use]
    pub fn deny(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: DecisionKind::Deny,
            reason: Some(reason.into()),
            rule: Some(rule.into()),
            warnings: Vec::new(),
        }
    }

    /// Attaches a non-fatal warning.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// Verdict.
    #[must_use]
    pub fn kind(&self) -> DecisionKind {
        self.kind
    }

    /// True when the query may run.
    #[must_use]
    pub fn is_allow(&self) -> bool {
        self.kind == DecisionKind::Allow
    }

    /// True when the query is refused.
    #[must_use]
    pub fn is_deny(&self) -> bool {
        self.kind == DecisionKind::Deny
    }

    /// Explanation attached to a deny.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Name of the rule that produced a deny decision.
    #[must_use]
    pub fn rule(&self) -> Option<&str> {
        self.rule.as_deref()
    }

    /// Warnings collected while reaching the decision.
    #[must_use]
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_helpers_work() {
        let allow = PolicyDecision::allow().with_warning("unparsed");
        assert!(allow.is_allow());
        assert!(!allow.is_deny());
        assert_eq!(allow.warnings(), ["unparsed"]);

        let deny = PolicyDecision::deny("schema_mutation", "DROP is not allowed");
        assert!(deny.is_deny());
        assert_eq!(deny.rule(), Some("schema_mutation"));
        assert_eq!(deny.reason(), Some("DROP is not allowed"));
    }

    #[test]
    fn empty_fields_are_skipped_on_the_wire() {
        let json = serde_json::to_value(PolicyDecision::allow()).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "allow"}));
    }
}

//! Security policy and query safety validation.
//!
//! [`SecurityPolicy`] carries the capability allow-list, identifier
//! deny-list, path allow-list, and resource bounds applied to every
//! execution. [`QueryValidator`] screens query text before it reaches the
//! relational engine.

#![warn(missing_docs, clippy::pedantic)]

pub mod decision;
pub mod policy;
pub mod validator;

pub use decision::{DecisionKind, PolicyDecision};
pub use policy::{
    DEFAULT_DENIED_IDENTIFIERS, DEFAULT_MEMORY_LIMIT, DEFAULT_TIMEOUT, SecurityPolicy,
    SecurityPolicyBuilder,
};
pub use validator::{
    PolicyError, PolicyResult, QueryGuard, QueryRule, QueryValidator, StatementClass,
};

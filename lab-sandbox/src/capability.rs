//! Static capability table.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use crate::builtins;
use crate::context::CallContext;
use crate::script::{ScriptResult, ScriptValue};

/// Signature shared by every capability implementation.
pub type CapabilityFn = fn(&mut CallContext<'_>, Vec<ScriptValue>) -> ScriptResult<ScriptValue>;

/// Named operation a script may call.
#[derive(Clone, Copy)]
pub struct CapabilitySpec {
    name: &'static str,
    summary: &'static str,
    touches_paths: bool,
    func: CapabilityFn,
}

impl CapabilitySpec {
    /// Declares a capability.
    #[must_use]
    pub const fn new(
        name: &'static str,
        summary: &'static str,
        touches_paths: bool,
        func: CapabilityFn,
    ) -> Self {
        Self {
            name,
            summary,
            touches_paths,
            func,
        }
    }

    /// Name scripts call it by.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// One-line description.
    #[must_use]
    pub const fn summary(&self) -> &'static str {
        self.summary
    }

    /// True when the capability takes a filesystem path and runs it through
    /// the path guard.
    #[must_use]
    pub const fn touches_paths(&self) -> bool {
        self.touches_paths
    }

    /// Invokes the capability.
    ///
    /// # Errors
    ///
    /// Propagates the capability's own error.
    pub fn invoke(&self, ctx: &mut CallContext<'_>, args: Vec<ScriptValue>) -> ScriptResult<ScriptValue> {
        (self.func)(ctx, args)
    }
}

impl fmt::Debug for CapabilitySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilitySpec")
            .field("name", &self.name)
            .field("touches_paths", &self.touches_paths)
            .finish_non_exhaustive()
    }
}

/// Immutable name → capability map. Scopes copy the entries they are
/// granted; the table itself is never mutated after construction.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    entries: BTreeMap<&'static str, CapabilitySpec>,
}

static STANDARD: LazyLock<CapabilityTable> =
    LazyLock::new(|| CapabilityTable::from_specs(builtins::STANDARD));

impl CapabilityTable {
    /// Process-wide table holding the standard capabilities, built on first
    /// use.
    #[must_use]
    pub fn standard() -> &'static Self {
        &STANDARD
    }

    /// Builds a table from a list of specs. Later duplicates replace earlier
    /// ones.
    #[must_use]
    pub fn from_specs(specs: &[CapabilitySpec]) -> Self {
        Self {
            entries: specs.iter().map(|spec| (spec.name, *spec)).collect(),
        }
    }

    /// Looks up a capability.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CapabilitySpec> {
        self.entries.get(name)
    }

    /// True if the table knows `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Capability names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    /// Number of capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True for an empty table.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table_is_shared() {
        let a = CapabilityTable::standard();
        let b = CapabilityTable::standard();
        assert!(std::ptr::eq(a, b));
        assert_eq!(a.len(), 26);
        assert!(a.contains("aggregate"));
        assert!(!a.contains("exec"));
    }

    #[test]
    fn path_capabilities_are_flagged() {
        let table = CapabilityTable::standard();
        let flagged: Vec<_> = table
            .names()
            .filter(|name| table.get(name).is_some_and(CapabilitySpec::touches_paths))
            .collect();
        assert_eq!(flagged, ["list_dir", "read_text", "write_csv", "write_text"]);
    }
}

//! The immutable security policy shared by every execution.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lab_primitives::CapabilityName;

use crate::validator::{PolicyError, PolicyResult};

/// Identifiers bound to failing stubs unless configured otherwise.
pub const DEFAULT_DENIED_IDENTIFIERS: &[&str] = &[
    "exec",
    "system",
    "spawn",
    "shell",
    "eval",
    "import",
    "open",
    "env",
    "getenv",
    "exit",
    "socket",
    "connect",
    "remove_file",
    "remove_dir",
    "chmod",
];

/// Default execution timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default per-worker address-space ceiling (1 GiB).
pub const DEFAULT_MEMORY_LIMIT: u64 = 1024 * 1024 * 1024;

/// Capability allow-list, identifier deny-list, path allow-list, and resource
/// bounds applied to every execution.
///
/// Built once at startup and shared read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    capabilities: BTreeSet<CapabilityName>,
    denied: BTreeSet<CapabilityName>,
    allowed_paths: Vec<PathBuf>,
    timeout: Duration,
    memory_limit: Option<u64>,
}

impl SecurityPolicy {
    /// Creates a builder seeded with the default deny-list, timeout, and
    /// memory ceiling and an empty capability allow-list.
    #[must_use]
    pub fn builder() -> SecurityPolicyBuilder {
        SecurityPolicyBuilder::default()
    }

    /// Allow-listed capability names.
    #[must_use]
    pub fn capabilities(&self) -> &BTreeSet<CapabilityName> {
        &self.capabilities
    }

    /// Deny-listed identifiers.
    #[must_use]
    pub fn denied(&self) -> &BTreeSet<CapabilityName> {
        &self.denied
    }

    /// Returns true if `name` is deny-listed.
    #[must_use]
    pub fn is_denied(&self, name: &str) -> bool {
        self.denied.contains(name)
    }

    /// Returns true if `name` is allow-listed and not deny-listed.
    #[must_use]
    pub fn permits(&self, name: &str) -> bool {
        self.capabilities.contains(name) && !self.is_denied(name)
    }

    /// Directory prefixes file capabilities may touch.
    #[must_use]
    pub fn allowed_paths(&self) -> &[PathBuf] {
        &self.allowed_paths
    }

    /// Default execution timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Per-worker memory ceiling in bytes, if any.
    #[must_use]
    pub fn memory_limit(&self) -> Option<u64> {
        self.memory_limit
    }
}

/// Builder for [`SecurityPolicy`].
#[derive(Debug)]
pub struct SecurityPolicyBuilder {
    capabilities: Vec<String>,
    denied: Vec<String>,
    allowed_paths: Vec<PathBuf>,
    timeout: Duration,
    memory_limit: Option<u64>,
}

impl Default for SecurityPolicyBuilder {
    fn default() -> Self {
        Self {
            capabilities: Vec::new(),
            denied: DEFAULT_DENIED_IDENTIFIERS
                .iter()
                .map(|name| (*name).to_owned())
                .collect(),
            allowed_paths: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            memory_limit: Some(DEFAULT_MEMORY_LIMIT),
        }
    }
}

impl SecurityPolicyBuilder {
    /// Adds capabilities to the allow-list.
    #[must_use]
    pub fn allow_capabilities<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(names.into_iter().map(Into::into));
        self
    }

    /// Replaces the deny-list.
    #[must_use]
    pub fn deny_identifiers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.denied = names.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a directory prefix to the path allow-list.
    #[must_use]
    pub fn allow_path(mut self, path: impl AsRef<Path>) -> Self {
        self.allowed_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Sets the default execution timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets (or clears) the per-worker memory ceiling.
    #[must_use]
    pub fn memory_limit(mut self, bytes: Option<u64>) -> Self {
        self.memory_limit = bytes;
        self
    }

    /// Validates and builds the policy.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidPolicy`] for malformed names, a zero
    /// timeout, a zero memory ceiling, or relative allow-listed paths.
    pub fn build(self) -> PolicyResult<SecurityPolicy> {
        if self.timeout.is_zero() {
            return Err(PolicyError::InvalidPolicy("timeout must be non-zero".into()));
        }
        if self.memory_limit == Some(0) {
            return Err(PolicyError::InvalidPolicy(
                "memory limit must be non-zero".into(),
            ));
        }
        if let Some(path) = self.allowed_paths.iter().find(|path| !path.is_absolute()) {
            return Err(PolicyError::InvalidPolicy(format!(
                "allowed path {} must be absolute",
                path.display()
            )));
        }

        let names = |raw: Vec<String>| {
            raw.into_iter()
                .map(|name| {
                    CapabilityName::new(name.trim())
                        .map_err(|err| PolicyError::InvalidPolicy(err.to_string()))
                })
                .collect::<PolicyResult<BTreeSet<_>>>()
        };

        Ok(SecurityPolicy {
            capabilities: names(self.capabilities)?,
            denied: names(self.denied)?,
            allowed_paths: self.allowed_paths,
            timeout: self.timeout,
            memory_limit: self.memory_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_list_wins_over_allow_list() {
        let policy = SecurityPolicy::builder()
            .allow_capabilities(["print", "exec"])
            .build()
            .unwrap();
        assert!(policy.permits("print"));
        assert!(!policy.permits("exec"));
        assert!(policy.is_denied("exec"));
        assert!(!policy.permits("scan"));
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert!(SecurityPolicy::builder().timeout(Duration::ZERO).build().is_err());
        assert!(SecurityPolicy::builder().allow_path("relative/dir").build().is_err());
        assert!(
            SecurityPolicy::builder()
                .allow_capabilities(["Bad Name"])
                .build()
                .is_err()
        );
    }
}

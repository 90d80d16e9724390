//! Execution scopes and the builder that assembles them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use lab_policy::SecurityPolicy;
use lab_registry::{DataRegistry, DatasetHandle};
use tracing::{debug, warn};

use crate::capability::{CapabilitySpec, CapabilityTable};
use crate::error::{SandboxError, SandboxResult};
use crate::path_guard::PathGuard;
use crate::protocol::ScopeManifest;

/// What a name in the scope refers to.
#[derive(Debug, Clone, Copy)]
pub enum Binding<'a> {
    /// Deny-listed identifier; any use fails with access denied.
    Denied,
    /// Granted capability.
    Capability(&'a CapabilitySpec),
    /// Dataset handle.
    Dataset(&'a DatasetHandle),
}

/// The only names a script can reach: dataset handles, granted
/// capabilities, and deny-listed stubs, plus the path guard file
/// capabilities run through.
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    datasets: BTreeMap<String, DatasetHandle>,
    capabilities: BTreeMap<&'static str, CapabilitySpec>,
    denied: BTreeSet<String>,
    guard: PathGuard,
}

impl ExecutionScope {
    /// Resolves `name`. The deny-list wins over capabilities, and
    /// capabilities win over dataset names.
    #[must_use]
    pub fn binding(&self, name: &str) -> Option<Binding<'_>> {
        if self.denied.contains(name) {
            return Some(Binding::Denied);
        }
        if let Some(spec) = self.capabilities.get(name) {
            return Some(Binding::Capability(spec));
        }
        self.datasets.get(name).map(Binding::Dataset)
    }

    /// Dataset handle by name, unless the name is deny-listed.
    #[must_use]
    pub fn dataset(&self, name: &str) -> Option<&DatasetHandle> {
        if self.denied.contains(name) {
            return None;
        }
        self.datasets.get(name)
    }

    /// Datasets in the scope.
    #[must_use]
    pub fn datasets(&self) -> &BTreeMap<String, DatasetHandle> {
        &self.datasets
    }

    /// Granted capability names.
    pub fn capability_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.capabilities.keys().copied()
    }

    /// True if the capability is granted.
    #[must_use]
    pub fn grants(&self, name: &str) -> bool {
        matches!(self.binding(name), Some(Binding::Capability(_)))
    }

    /// Deny-listed identifiers.
    #[must_use]
    pub fn denied(&self) -> &BTreeSet<String> {
        &self.denied
    }

    /// True if `name` is deny-listed.
    #[must_use]
    pub fn is_denied(&self, name: &str) -> bool {
        self.denied.contains(name)
    }

    /// Guard applied by file capabilities.
    #[must_use]
    pub fn path_guard(&self) -> &PathGuard {
        &self.guard
    }

    /// Reduces the scope to a manifest another process can rebuild it from.
    /// Datasets without an on-disk representation are spilled into
    /// `spill_dir` as columnar files.
    ///
    /// This performs blocking I/O.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Registry`] when a spill file cannot be
    /// written.
    pub fn manifest(&self, spill_dir: &Path) -> SandboxResult<ScopeManifest> {
        let mut datasets = BTreeMap::new();
        for (name, handle) in &self.datasets {
            datasets.insert(name.clone(), handle.export(spill_dir)?);
        }
        Ok(ScopeManifest {
            datasets,
            capabilities: self.capability_names().map(str::to_owned).collect(),
            denied: self.denied.clone(),
            allowed_paths: self.guard.roots().to_vec(),
        })
    }

    /// Rebuilds a scope from a manifest, opening every referenced dataset
    /// and resolving relative paths against `base_dir`.
    ///
    /// Capability names missing from `table` are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Registry`] when a dataset cannot be opened.
    pub fn from_manifest(
        manifest: &ScopeManifest,
        table: &CapabilityTable,
        base_dir: &Path,
    ) -> SandboxResult<Self> {
        let mut datasets = BTreeMap::new();
        for (name, reference) in &manifest.datasets {
            datasets.insert(name.clone(), reference.open(name)?);
        }
        let capabilities = manifest
            .capabilities
            .iter()
            .filter(|name| !manifest.denied.contains(*name))
            .filter_map(|name| table.get(name).map(|spec| (spec.name(), *spec)))
            .collect();
        Ok(Self {
            datasets,
            capabilities,
            denied: manifest.denied.clone(),
            guard: PathGuard::new(&manifest.allowed_paths, base_dir),
        })
    }
}

/// Assembles an [`ExecutionScope`] from registry lookups and a policy.
#[derive(Debug, Clone)]
pub struct SandboxBuilder {
    registry: Arc<DataRegistry>,
    table: &'static CapabilityTable,
}

impl SandboxBuilder {
    /// Creates a builder over the standard capability table.
    #[must_use]
    pub fn new(registry: Arc<DataRegistry>) -> Self {
        Self {
            registry,
            table: CapabilityTable::standard(),
        }
    }

    /// Uses a different static capability table.
    #[must_use]
    pub fn with_table(mut self, table: &'static CapabilityTable) -> Self {
        self.table = table;
        self
    }

    /// Builds a scope holding the named datasets and the capabilities the
    /// policy grants. Performs no I/O besides registry lookups.
    ///
    /// Relative paths given to file capabilities are resolved against the
    /// process working directory; a worker rebuilds the guard against its
    /// own directory.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Registry`] wrapping a not-found registry error
    /// if any dataset is missing.
    pub async fn build(
        &self,
        dataset_names: &[String],
        policy: &SecurityPolicy,
    ) -> SandboxResult<ExecutionScope> {
        let mut datasets = BTreeMap::new();
        for name in dataset_names {
            if datasets.contains_key(name) {
                continue;
            }
            let handle = self.registry.get(name).await?;
            datasets.insert(name.clone(), handle);
        }

        let mut capabilities = BTreeMap::new();
        for name in policy.capabilities() {
            if policy.is_denied(name.as_str()) {
                debug!(capability = %name, "capability deny-listed; binding stub");
                continue;
            }
            match self.table.get(name.as_str()) {
                Some(spec) => {
                    capabilities.insert(spec.name(), *spec);
                }
                None => warn!(capability = %name, "unknown capability in allow-list; skipping"),
            }
        }

        let denied = policy
            .denied()
            .iter()
            .map(|name| name.as_str().to_owned())
            .collect();
        let base = std::env::current_dir().map_err(|err| SandboxError::io(".", err))?;

        debug!(
            datasets = datasets.len(),
            capabilities = capabilities.len(),
            "execution scope built"
        );
        Ok(ExecutionScope {
            datasets,
            capabilities,
            denied,
            guard: PathGuard::new(policy.allowed_paths(), base),
        })
    }

    /// Registry the builder resolves datasets from.
    #[must_use]
    pub fn registry(&self) -> &Arc<DataRegistry> {
        &self.registry
    }
}

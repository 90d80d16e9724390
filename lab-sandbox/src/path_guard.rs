//! Path allow-list enforcement for file capabilities.
//!
//! A path is resolved before it is checked: relative paths are joined onto
//! the base directory, `.` and `..` are folded lexically, and symlinks are
//! resolved through the longest prefix that exists on disk. The resolved path
//! is what callers act on, so a check cannot be raced by re-interpreting the
//! original string.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{SandboxError, SandboxResult};

/// Checks paths against a set of allowed directory prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathGuard {
    roots: Vec<PathBuf>,
    base: PathBuf,
}

impl PathGuard {
    /// Creates a guard over `roots`, resolving relative paths against `base`.
    ///
    /// Roots are resolved the same way checked paths are, so an allow-listed
    /// directory reached through a symlink still matches.
    #[must_use]
    pub fn new(roots: &[PathBuf], base: impl Into<PathBuf>) -> Self {
        let base = normalize(&base.into());
        let roots = roots
            .iter()
            .map(|root| {
                let absolute = normalize(&base.join(root));
                resolve_existing_prefix(&absolute).unwrap_or(absolute)
            })
            .collect();
        Self { roots, base }
    }

    /// Resolved allow-listed roots.
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Directory relative paths are resolved against.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Resolves `path` and checks it lies under an allowed root.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::PathDenied`] when the resolved path is outside
    /// every root, and [`SandboxError::UnresolvablePath`] when an existing
    /// component cannot be resolved (a dangling or looping symlink).
    pub fn resolve(&self, path: impl AsRef<Path>) -> SandboxResult<PathBuf> {
        let path = path.as_ref();
        let absolute = normalize(&self.base.join(path));
        let resolved =
            resolve_existing_prefix(&absolute).map_err(|reason| SandboxError::UnresolvablePath {
                path: path.to_path_buf(),
                reason,
            })?;

        if self.roots.iter().any(|root| resolved.starts_with(root)) {
            Ok(resolved)
        } else {
            tracing::debug!(path = %path.display(), resolved = %resolved.display(), "path rejected");
            Err(SandboxError::PathDenied { path: resolved })
        }
    }

    /// Returns true when `path` resolves inside an allowed root.
    #[must_use]
    pub fn allows(&self, path: impl AsRef<Path>) -> bool {
        self.resolve(path).is_ok()
    }
}

/// Folds `.` and `..` without touching the filesystem. `..` never climbs
/// above the root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Canonicalizes the longest existing ancestor of `path` and re-attaches the
/// remaining components.
fn resolve_existing_prefix(path: &Path) -> Result<PathBuf, String> {
    let mut missing = Vec::new();
    let mut current = path.to_path_buf();
    loop {
        if fs::symlink_metadata(&current).is_ok() {
            let mut resolved = fs::canonicalize(&current)
                .map_err(|err| format!("{}: {err}", current.display()))?;
            for part in missing.iter().rev() {
                resolved.push(part);
            }
            return Ok(resolved);
        }
        match (current.file_name(), current.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name.to_os_string());
                current = parent.to_path_buf();
            }
            _ => return Ok(path.to_path_buf()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(dir: &Path) -> (PathGuard, PathBuf) {
        let allowed = dir.join("allowed");
        fs::create_dir_all(&allowed).unwrap();
        (PathGuard::new(std::slice::from_ref(&allowed), dir), allowed)
    }

    #[test]
    fn accepts_paths_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, allowed) = guard(dir.path());
        fs::write(allowed.join("a.txt"), "x").unwrap();

        let resolved = guard.resolve(allowed.join("a.txt")).unwrap();
        assert!(resolved.ends_with("allowed/a.txt"));
        assert!(guard.allows(allowed.join("new/file.csv")));
    }

    #[test]
    fn relative_paths_use_base_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, _) = guard(dir.path());
        assert!(guard.allows("allowed/out.txt"));
        assert!(guard.allows("./allowed/./nested/../out.txt"));
        assert!(!guard.allows("out.txt"));
    }

    #[test]
    fn rejects_parent_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, allowed) = guard(dir.path());
        let err = guard.resolve(allowed.join("../secret.txt")).unwrap_err();
        assert!(matches!(err, SandboxError::PathDenied { .. }));
        assert_eq!(err.kind(), lab_primitives::ErrorKind::AccessDenied);
        assert!(!guard.allows("/etc/passwd"));
        assert!(!guard.allows(allowed.join("../../../../../etc/passwd")));
    }

    #[test]
    fn prefix_match_is_component_wise() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, _) = guard(dir.path());
        fs::create_dir_all(dir.path().join("allowed-not")).unwrap();
        assert!(!guard.allows(dir.path().join("allowed-not/x")));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlinks_pointing_outside() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, allowed) = guard(dir.path());
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, allowed.join("link")).unwrap();
        std::os::unix::fs::symlink(outside.join("missing"), allowed.join("dangling")).unwrap();

        assert!(!guard.allows(allowed.join("link/data.txt")));
        assert!(!guard.allows(allowed.join("dangling")));
    }
}

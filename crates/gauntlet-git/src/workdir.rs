//! Working directory resolution
//!
//! `--cwd` is interpreted relative to the repository root and must stay
//! inside it. The check runs twice: lexically before touching the
//! filesystem, then on the canonical path so symlinks cannot escape.

use gauntlet_core::{GauntletError, Result};
use std::path::{Component, Path, PathBuf};

/// A working directory validated against the repository root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWorkdir {
    /// Absolute, canonical path
    pub absolute: PathBuf,
    /// Path relative to the root with `/` separators, `.` for the root itself
    pub relative: String,
}

/// Resolves working directories for an invocation
#[derive(Debug, Clone)]
pub struct WorkdirResolver {
    root: PathBuf,
    invoking_dir: PathBuf,
}

impl WorkdirResolver {
    /// `root` is the repository root, or the invoking directory outside a repository
    pub fn new(root: impl Into<PathBuf>, invoking_dir: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = root.canonicalize().unwrap_or(root);
        let invoking_dir = invoking_dir.into();
        let invoking_dir = invoking_dir.canonicalize().unwrap_or(invoking_dir);
        Self { root, invoking_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an explicit `--cwd` or fall back to the invoking directory
    pub fn resolve(&self, explicit: Option<&str>) -> Result<ResolvedWorkdir> {
        let (requested, candidate) = match explicit {
            Some(dir) => {
                let path = Path::new(dir);
                let joined = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    self.root.join(path)
                };
                (dir.to_string(), joined)
            }
            None => (
                self.invoking_dir.display().to_string(),
                self.invoking_dir.clone(),
            ),
        };

        let traversal = || GauntletError::PathTraversal {
            requested: requested.clone(),
            root: self.root.clone(),
        };

        let normalized = normalize_lexically(&candidate).ok_or_else(traversal)?;
        if !normalized.starts_with(&self.root) {
            return Err(traversal());
        }

        let absolute = normalized
            .canonicalize()
            .map_err(|_| GauntletError::WorkdirNotFound(requested.clone()))?;
        if !absolute.starts_with(&self.root) {
            return Err(traversal());
        }
        if !absolute.is_dir() {
            return Err(GauntletError::WorkdirNotFound(requested));
        }

        let relative = relative_display(&absolute, &self.root);
        Ok(ResolvedWorkdir { absolute, relative })
    }
}

/// Collapse `.` and `..` without consulting the filesystem
///
/// Returns `None` when `..` climbs above the filesystem root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

fn relative_display(path: &Path, root: &Path) -> String {
    let Ok(rel) = path.strip_prefix(root) else {
        return ".".to_string();
    };
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repo() -> (TempDir, WorkdirResolver) {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("crates/core")).unwrap();
        let resolver = WorkdirResolver::new(temp_dir.path(), temp_dir.path());
        (temp_dir, resolver)
    }

    #[test]
    fn test_default_is_invoking_dir() {
        let (_dir, resolver) = repo();
        let resolved = resolver.resolve(None).unwrap();
        assert_eq!(resolved.relative, ".");
    }

    #[test]
    fn test_explicit_subdirectory() {
        let (_dir, resolver) = repo();
        let resolved = resolver.resolve(Some("crates/core")).unwrap();
        assert_eq!(resolved.relative, "crates/core");
        assert!(resolved.absolute.ends_with("crates/core"));
    }

    #[test]
    fn test_explicit_normalizes_dots() {
        let (_dir, resolver) = repo();
        let resolved = resolver.resolve(Some("./crates/../crates/core/.")).unwrap();
        assert_eq!(resolved.relative, "crates/core");
    }

    #[test]
    fn test_rejects_parent_traversal() {
        let (_dir, resolver) = repo();
        let err = resolver.resolve(Some("../../etc")).unwrap_err();
        assert!(matches!(err, GauntletError::PathTraversal { .. }));
    }

    #[test]
    fn test_rejects_absolute_outside_root() {
        let (_dir, resolver) = repo();
        let err = resolver.resolve(Some("/etc")).unwrap_err();
        assert!(matches!(err, GauntletError::PathTraversal { .. }));
    }

    #[test]
    fn test_rejects_traversal_even_when_target_missing() {
        let (_dir, resolver) = repo();
        let err = resolver
            .resolve(Some("crates/../../nonexistent-sibling"))
            .unwrap_err();
        assert!(matches!(err, GauntletError::PathTraversal { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_symlink_escape() {
        let (dir, resolver) = repo();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();

        let err = resolver.resolve(Some("escape")).unwrap_err();
        assert!(matches!(err, GauntletError::PathTraversal { .. }));
    }

    #[test]
    fn test_missing_directory() {
        let (_dir, resolver) = repo();
        let err = resolver.resolve(Some("does/not/exist")).unwrap_err();
        assert!(matches!(err, GauntletError::WorkdirNotFound(_)));
    }
}

//! Workspace path containment.
//!
//! Paths are compared by canonical components, never by string prefix, so
//! `/ws-evil` is not inside `/ws` and symlinks are resolved before the check.
//! Paths that do not exist yet (write targets) keep their missing tail
//! after the existing prefix is canonicalized.

use std::path::{Component, Path, PathBuf};

use crate::error::{RelayError, Result};

/// A path that has passed workspace validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafePath(PathBuf);

impl SafePath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

/// Resolve `path` against `workspace` one component at a time.
///
/// Every prefix that exists is canonicalized before the next component is
/// applied, so a `..` can never step back out of a symlink target by text
/// alone. Components past the last existing prefix are joined as-is.
pub fn resolve(path: &str, workspace: &Path) -> Result<PathBuf> {
    let raw = Path::new(path);
    let candidate = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        workspace.join(raw)
    };

    let mut resolved = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(part) => {
                resolved.push(part);
                // symlink_metadata also sees dangling links, which must not
                // be written through.
                if resolved.symlink_metadata().is_ok() {
                    resolved = resolved.canonicalize().map_err(|e| {
                        RelayError::SecurityViolation(format!(
                            "Cannot resolve path '{}': {}",
                            path, e
                        ))
                    })?;
                }
            }
        }
    }

    Ok(resolved)
}

/// Validate that `path` stays inside `workspace` after resolution.
///
/// # Example
/// ```
/// use relayclaw::security::validate_path_in_workspace;
///
/// let dir = tempfile::tempdir().unwrap();
/// assert!(validate_path_in_workspace("notes/today.md", dir.path()).is_ok());
/// assert!(validate_path_in_workspace("../outside.txt", dir.path()).is_err());
/// ```
pub fn validate_path_in_workspace(path: &str, workspace: &Path) -> Result<SafePath> {
    let root = workspace.canonicalize().map_err(|e| {
        RelayError::SecurityViolation(format!(
            "Workspace '{}' is not accessible: {}",
            workspace.display(),
            e
        ))
    })?;

    let resolved = resolve(path, &root)?;
    if !resolved.starts_with(&root) {
        return Err(RelayError::SecurityViolation(format!(
            "Path '{}' is outside the workspace",
            path
        )));
    }
    Ok(SafePath(resolved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_relative_path_inside_workspace() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let safe = validate_path_in_workspace("a.txt", dir.path()).unwrap();
        assert_eq!(
            safe.as_path(),
            dir.path().canonicalize().unwrap().join("a.txt")
        );
    }

    #[test]
    fn test_nonexistent_write_target_allowed() {
        let dir = TempDir::new().unwrap();
        let safe = validate_path_in_workspace("new/dir/file.md", dir.path()).unwrap();
        assert!(safe.as_path().ends_with("new/dir/file.md"));
    }

    #[test]
    fn test_parent_traversal_blocked() {
        let dir = TempDir::new().unwrap();
        assert!(validate_path_in_workspace("../escape.txt", dir.path()).is_err());
        assert!(validate_path_in_workspace("missing/../../escape.txt", dir.path()).is_err());
    }

    #[test]
    fn test_dotdot_that_stays_inside_is_allowed() {
        let dir = TempDir::new().unwrap();
        assert!(validate_path_in_workspace("a/../b.txt", dir.path()).is_ok());
    }

    #[test]
    fn test_absolute_outside_blocked() {
        let dir = TempDir::new().unwrap();
        let err = validate_path_in_workspace("/etc/hostname", dir.path()).unwrap_err();
        assert!(matches!(err, RelayError::SecurityViolation(_)));
    }

    #[test]
    fn test_sibling_with_common_prefix_blocked() {
        let parent = TempDir::new().unwrap();
        let ws = parent.path().join("ws");
        let evil = parent.path().join("ws-evil");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&evil).unwrap();
        let target = evil.join("x.txt");
        assert!(validate_path_in_workspace(target.to_str().unwrap(), &ws).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_blocked() {
        let parent = TempDir::new().unwrap();
        let ws = parent.path().join("ws");
        let outside = parent.path().join("outside");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, ws.join("link")).unwrap();
        assert!(validate_path_in_workspace("link/secret.txt", &ws).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_through_missing_dir_blocked() {
        let parent = TempDir::new().unwrap();
        let ws = parent.path().join("ws");
        let outside = parent.path().join("outside");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, ws.join("link")).unwrap();

        let err = validate_path_in_workspace("missing/../link/pwned.txt", &ws).unwrap_err();
        assert!(matches!(err, RelayError::SecurityViolation(_)));
        assert!(validate_path_in_workspace("./missing/.././link", &ws).is_err());
        assert!(!outside.join("pwned.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_blocked() {
        let parent = TempDir::new().unwrap();
        let ws = parent.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::os::unix::fs::symlink(parent.path().join("gone.txt"), ws.join("dangling")).unwrap();
        assert!(validate_path_in_workspace("dangling", &ws).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_workspace_allowed() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("alias")).unwrap();
        let safe = validate_path_in_workspace("missing/../alias/new.txt", dir.path()).unwrap();
        assert_eq!(
            safe.as_path(),
            dir.path().canonicalize().unwrap().join("real").join("new.txt")
        );
    }
}

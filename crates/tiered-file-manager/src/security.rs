//! Path safety: lexical normalization and root containment.
//!
//! Containment is checked in two layers. `normalize_relative` strips `.` and
//! folds `..` segments lexically, rejecting anything that would climb above
//! the managed root; since segments that do not exist yet cannot be symlinks,
//! lexical folding is sound for them. `resolve_under_root` then asks the OS
//! to resolve the deepest ancestor that *does* exist, which is where a
//! symlink could smuggle the path out of the root.

use crate::error::{Result, TieredFileError};
use std::path::{Component, Path, PathBuf};

fn rejected(path: &Path, reason: impl Into<String>) -> TieredFileError {
    TieredFileError::PathRejected {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Lexically normalize a relative path. `.` segments drop out; each `..`
/// pops the previous segment and must never run out of segments to pop.
pub fn normalize_relative(candidate: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(name) => clean.push(name),
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    return Err(rejected(candidate, "climbs above the managed root"));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(rejected(candidate, "must be relative to the managed root"));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(rejected(candidate, "empty after normalization"));
    }
    Ok(clean)
}

/// Normalize `candidate` and pin it under `root`. Returns the clean relative
/// path (the manager's registry key) and the absolute path to operate on.
///
/// The deepest existing ancestor of the result is resolved through the OS;
/// if that resolution lands outside the root, a symlink is pointing out of
/// the sandbox and the path is rejected.
pub fn resolve_under_root(root: &Path, candidate: &Path) -> Result<(PathBuf, PathBuf)> {
    let clean = normalize_relative(candidate)?;
    let canonical_root = root
        .canonicalize()
        .map_err(|e| rejected(root, format!("managed root cannot be resolved: {e}")))?;
    let absolute = canonical_root.join(&clean);

    let mut probe = absolute.clone();
    let anchor = loop {
        if probe == canonical_root {
            break canonical_root.clone();
        }
        match probe.canonicalize() {
            Ok(resolved) => break resolved,
            // Not on disk yet: try one level up
            Err(_) => {
                if !probe.pop() {
                    break canonical_root.clone();
                }
            }
        }
    };
    if !anchor.starts_with(&canonical_root) {
        return Err(rejected(
            candidate,
            format!("resolves to {:?}, outside the managed root", anchor),
        ));
    }

    Ok((clean, absolute))
}

/// Restrict a managed directory to its owning user (mode 0700). Non-Unix
/// targets only verify the directory exists.
pub async fn set_secure_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|_e| TieredFileError::Permissions {
                path: path.to_path_buf(),
            })?;
    }

    #[cfg(not(unix))]
    if !path.exists() {
        return Err(rejected(path, "managed directory is missing"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_folds_dot_segments() {
        assert_eq!(
            normalize_relative(Path::new("a/./b.txt")).unwrap(),
            PathBuf::from("a/b.txt")
        );
        assert_eq!(
            normalize_relative(Path::new("a/b/../c.txt")).unwrap(),
            PathBuf::from("a/c.txt")
        );
        assert_eq!(
            normalize_relative(Path::new("dir/../file.txt")).unwrap(),
            PathBuf::from("file.txt")
        );
    }

    #[test]
    fn normalization_rejects_escapes_and_absolutes() {
        assert!(normalize_relative(Path::new("../outside.txt")).is_err());
        assert!(normalize_relative(Path::new("a/../../outside.txt")).is_err());
        assert!(normalize_relative(Path::new("/etc/passwd")).is_err());
        assert!(normalize_relative(Path::new("")).is_err());
        assert!(normalize_relative(Path::new(".")).is_err());
    }

    #[test]
    fn resolve_accepts_paths_that_do_not_exist_yet() {
        let root = tempfile::tempdir().unwrap();
        let (clean, absolute) =
            resolve_under_root(root.path(), Path::new("nested/deep/file.bin")).unwrap();
        assert_eq!(clean, PathBuf::from("nested/deep/file.bin"));
        assert!(absolute.starts_with(root.path().canonicalize().unwrap()));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_symlinks_leaving_the_root() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("escape")).unwrap();

        let result = resolve_under_root(root.path(), Path::new("escape/file.bin"));
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn resolve_accepts_symlinks_staying_inside() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("real")).unwrap();
        std::os::unix::fs::symlink(root.path().join("real"), root.path().join("alias")).unwrap();

        let result = resolve_under_root(root.path(), Path::new("alias/file.bin"));
        assert!(result.is_ok());
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Relative path handling and file permission helpers. */

use {
    crate::error::{Result, StoreError},
    std::path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

fn is_separator(c: char) -> bool {
    c == '/' || (cfg!(windows) && c == '\\')
}

/// Normalize a relative path to `/` separated components.
///
/// `.` and empty components are dropped and `..` consumes its parent. Paths
/// that are absolute or would climb above their root are rejected with
/// [StoreError::PathBreakout]. The empty string is the root itself.
pub fn normalize_relative(path: &str) -> Result<String> {
    if path.starts_with(is_separator) || Path::new(path).has_root() {
        return Err(StoreError::PathBreakout(path.to_string()));
    }
    #[cfg(windows)]
    if path.chars().nth(1) == Some(':') {
        return Err(StoreError::PathBreakout(path.to_string()));
    }

    let mut components: Vec<&str> = vec![];

    for component in path.split(is_separator) {
        match component {
            "" | "." => {}
            ".." => {
                if components.pop().is_none() {
                    return Err(StoreError::PathBreakout(path.to_string()));
                }
            }
            c => components.push(c),
        }
    }

    Ok(components.join("/"))
}

/// Whether a relative path would escape the directory it is relative to.
pub fn is_breakout_path(path: &str) -> bool {
    normalize_relative(path).is_err()
}

/// Resolve a relative path against a root, refusing anything outside the root.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf> {
    let normalized = normalize_relative(relative)?;

    let mut full = root.to_path_buf();
    for component in normalized.split('/').filter(|c| !c.is_empty()) {
        full.push(component);
    }

    Ok(full)
}

/// Join two relative paths, either of which may be empty.
pub fn join_relative(base: &str, relative: &str) -> String {
    match (base.is_empty(), relative.is_empty()) {
        (true, _) => relative.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{}/{}", base.trim_end_matches('/'), relative),
    }
}

/// Express `path` relative to `root` with `/` separators.
pub fn relative_to(path: &Path, root: &Path) -> Result<String> {
    let stripped = path
        .strip_prefix(root)
        .map_err(|_| StoreError::PathBreakout(format!("{}", path.display())))?;

    Ok(stripped
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

#[cfg(unix)]
pub fn is_executable(metadata: &std::fs::Metadata) -> bool {
    let permissions = metadata.permissions();
    permissions.mode() & 0o111 != 0
}

#[cfg(not(unix))]
pub fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
pub fn set_executable(path: &Path) -> std::io::Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    std::fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
pub fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Mark every file and directory below `path` read-only (or writable again).
pub fn set_write_protection(path: &Path, protect: bool) -> std::io::Result<()> {
    let metadata = std::fs::symlink_metadata(path)?;

    if metadata.file_type().is_symlink() {
        return Ok(());
    }

    if metadata.is_dir() {
        // Directories are made writable before descending and protected after.
        if !protect {
            set_readonly(path, &metadata, false)?;
        }
        for entry in std::fs::read_dir(path)? {
            set_write_protection(&entry?.path(), protect)?;
        }
        if protect {
            set_readonly(path, &metadata, true)?;
        }
        Ok(())
    } else {
        set_readonly(path, &metadata, protect)
    }
}

#[cfg(unix)]
fn set_readonly(path: &Path, metadata: &std::fs::Metadata, readonly: bool) -> std::io::Result<()> {
    let mut permissions = metadata.permissions();
    let mode = permissions.mode();
    permissions.set_mode(if readonly { mode & !0o222 } else { mode | 0o200 });
    std::fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
fn set_readonly(path: &Path, metadata: &std::fs::Metadata, readonly: bool) -> std::io::Result<()> {
    let mut permissions = metadata.permissions();
    permissions.set_readonly(readonly);
    std::fs::set_permissions(path, permissions)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalize() -> Result<()> {
        assert_eq!(normalize_relative("a/b/c")?, "a/b/c");
        assert_eq!(normalize_relative("./a//b/")?, "a/b");
        assert_eq!(normalize_relative("a/../b")?, "b");
        assert_eq!(normalize_relative("")?, "");

        Ok(())
    }

    #[test]
    fn breakout() {
        assert!(is_breakout_path(".."));
        assert!(is_breakout_path("../a"));
        assert!(is_breakout_path("a/../../b"));
        assert!(is_breakout_path("/etc/passwd"));
        assert!(!is_breakout_path("a/b/../c"));
    }

    #[test]
    fn resolve_under_root() -> Result<()> {
        let root = Path::new("/tmp/root");
        assert_eq!(resolve(root, "a/./b")?, root.join("a").join("b"));
        assert_eq!(resolve(root, "")?, root.to_path_buf());
        assert!(matches!(
            resolve(root, "a/../../x"),
            Err(StoreError::PathBreakout(_))
        ));

        Ok(())
    }

    #[test]
    fn join() {
        assert_eq!(join_relative("", "a"), "a");
        assert_eq!(join_relative("a", ""), "a");
        assert_eq!(join_relative("a/", "b/c"), "a/b/c");
    }
}

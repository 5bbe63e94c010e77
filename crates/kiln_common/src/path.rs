//! Path normalization and project-relative keys.
//!
//! Every store keys files by a normalized string rather than by `PathBuf`, so
//! `src/./A.java` and `src/b/../A.java` land on the same entry. When portable
//! caches are enabled the project root is replaced by [`PROJECT_DIR_MACRO`],
//! which lets a data directory be moved to another checkout location.

use std::path::{Component, Path, PathBuf};

/// Placeholder substituted for the project root in portable keys.
pub const PROJECT_DIR_MACRO: &str = "$PROJECT_DIR$";

/// Lexically normalizes a path into a forward-slash separated string.
///
/// Removes `.` components, collapses `..` against preceding components and
/// drops trailing separators. The file system is never consulted, so symlinks
/// are not resolved.
pub fn normalize_path(path: &Path) -> String {
    let mut prefix = String::new();
    let mut absolute = false;
    let mut parts: Vec<String> = Vec::new();

    for component in path.components() {
        match component {
            Component::Prefix(p) => {
                prefix = p.as_os_str().to_string_lossy().replace('\\', "/");
            }
            Component::RootDir => absolute = true,
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(last) if last != ".." => {
                    parts.pop();
                }
                // `..` above the root of an absolute path stays at the root.
                _ if absolute => {}
                _ => parts.push("..".to_string()),
            },
            Component::Normal(name) => parts.push(name.to_string_lossy().into_owned()),
        }
    }

    let mut out = prefix;
    if absolute {
        out.push('/');
    }
    out.push_str(&parts.join("/"));
    if out.is_empty() {
        out.push('.');
    }
    out
}

/// Converts file paths to store keys and back.
///
/// Without a project root, keys are plain normalized paths. With a root, paths
/// under it are rewritten to start with [`PROJECT_DIR_MACRO`].
#[derive(Debug, Clone, Default)]
pub struct PathRelativizer {
    root: Option<String>,
}

impl PathRelativizer {
    /// Creates a relativizer that keys paths by their normalized absolute form.
    pub fn absolute() -> Self {
        Self { root: None }
    }

    /// Creates a relativizer that rewrites paths under `root` to portable keys.
    pub fn portable(root: &Path) -> Self {
        Self {
            root: Some(normalize_path(root)),
        }
    }

    /// Returns the project root used for portable keys, if any.
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// Returns the store key for `path`.
    pub fn to_key(&self, path: &Path) -> String {
        let normalized = normalize_path(path);
        let Some(root) = &self.root else {
            return normalized;
        };
        if normalized == *root {
            return PROJECT_DIR_MACRO.to_string();
        }
        let dir_prefix = if root.ends_with('/') {
            root.clone()
        } else {
            format!("{root}/")
        };
        match normalized.strip_prefix(&dir_prefix) {
            Some(rest) => format!("{PROJECT_DIR_MACRO}/{rest}"),
            None => normalized,
        }
    }

    /// Restores a file path from a key produced by [`to_key`](Self::to_key).
    pub fn to_path(&self, key: &str) -> PathBuf {
        match (&self.root, key.strip_prefix(PROJECT_DIR_MACRO)) {
            (Some(root), Some("")) => PathBuf::from(root),
            // A root of `/` already ends in the separator `rest` starts with.
            (Some(root), Some(rest)) => {
                PathBuf::from(format!("{}{rest}", root.trim_end_matches('/')))
            }
            _ => PathBuf::from(key),
        }
    }
}

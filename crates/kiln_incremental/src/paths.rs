//! Layout of the build data root.
//!
//! Every store owns one subdirectory and never reads another's files.

use std::path::{Path, PathBuf};

use kiln_common::ContentHash;

use crate::target::TargetId;

/// Name of the data format marker at the root.
pub const VERSION_FILE: &str = "data-version.json";

/// Longest file name produced by [`safe_file_name`] before hashing kicks in.
const MAX_NAME_LEN: usize = 64;

/// Resolves store directories under a project data root.
#[derive(Debug, Clone)]
pub struct BuildDataPaths {
    root: PathBuf,
}

impl BuildDataPaths {
    /// Creates a layout rooted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// The data root itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File recording the data format version of the whole root.
    pub fn version_file(&self) -> PathBuf {
        self.root.join(VERSION_FILE)
    }

    /// Target registry directory.
    pub fn targets_dir(&self) -> PathBuf {
        self.root.join("targets")
    }

    /// Timestamp stamp store.
    pub fn timestamps_dir(&self) -> PathBuf {
        self.root.join("timestamps")
    }

    /// Hash stamp store.
    pub fn hashes_dir(&self) -> PathBuf {
        self.root.join("hashes")
    }

    /// Parent of the per-target source-to-output stores.
    pub fn mappings_dir(&self) -> PathBuf {
        self.root.join("mappings")
    }

    /// Source-to-output store of one target.
    pub fn mapping_dir(&self, target: TargetId) -> PathBuf {
        self.mappings_dir().join(target.to_string())
    }

    /// Output-to-target claim index.
    pub fn output_targets_dir(&self) -> PathBuf {
        self.root.join("output-targets")
    }

    /// Target configuration snapshots.
    pub fn configs_dir(&self) -> PathBuf {
        self.root.join("configs")
    }

    /// Every directory a store writes under the root. Anything else in the
    /// root belongs to someone else.
    pub fn store_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.targets_dir(),
            self.timestamps_dir(),
            self.hashes_dir(),
            self.mappings_dir(),
            self.output_targets_dir(),
            self.configs_dir(),
        ]
    }
}

/// Turns an arbitrary name into a portable file name.
///
/// Characters outside `[A-Za-z0-9._-]` become `_`. If anything was replaced, or
/// the name is long, a hash of the original is appended so distinct names do
/// not collide.
pub fn safe_file_name(name: &str) -> String {
    let mut escaped: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let needs_hash = name.is_empty()
        || escaped != name
        || escaped.len() > MAX_NAME_LEN
        || escaped.starts_with('.');
    if needs_hash {
        escaped.truncate(MAX_NAME_LEN);
        escaped.push('-');
        escaped.push_str(&ContentHash::from_bytes(name.as_bytes()).to_string());
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let paths = BuildDataPaths::new(Path::new("/data"));
        assert_eq!(paths.timestamps_dir(), PathBuf::from("/data/timestamps"));
        assert_eq!(
            paths.mapping_dir(TargetId::new(3)),
            PathBuf::from("/data/mappings/3")
        );
    }

    #[test]
    fn store_dirs_stay_under_root() {
        let paths = BuildDataPaths::new(Path::new("/data"));
        let dirs = paths.store_dirs();
        assert_eq!(dirs.len(), 6);
        assert!(dirs.iter().all(|d| d.parent() == Some(Path::new("/data"))));
        assert!(dirs.contains(&paths.mappings_dir()));
        assert!(!dirs.contains(&paths.version_file()));
    }

    #[test]
    fn plain_names_pass_through() {
        assert_eq!(safe_file_name("java-production"), "java-production");
        assert_eq!(safe_file_name("core_module.v2"), "core_module.v2");
    }

    #[test]
    fn unsafe_names_are_escaped_and_hashed() {
        let a = safe_file_name("a/b");
        let b = safe_file_name("a:b");
        assert!(a.starts_with("a_b-"));
        assert_ne!(a, b);
    }

    #[test]
    fn hidden_and_empty_names() {
        assert!(safe_file_name("..").starts_with("..-"));
        assert!(!safe_file_name("").is_empty());
    }

    #[test]
    fn long_names_are_truncated() {
        let long = "x".repeat(200);
        assert!(safe_file_name(&long).len() < 100);
    }
}

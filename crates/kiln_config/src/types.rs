//! Configuration types deserialized from `kiln.toml`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default name of the build data directory, relative to the project root.
pub const DEFAULT_DATA_DIR: &str = ".kiln";

/// The top-level configuration parsed from `kiln.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct KilnConfig {
    /// Build data storage settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Settings for the incremental build data stores.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directory holding all store subdirectories. Relative paths are resolved
    /// against the project directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Use content hashes instead of timestamps and key files relative to the
    /// project root, so build data can be reused across checkouts.
    #[serde(default)]
    pub portable_caches: bool,
    /// Number of worker threads for per-target hashing. `0` picks the
    /// thread pool default.
    #[serde(default)]
    pub worker_threads: usize,
}

fn default_data_dir() -> String {
    DEFAULT_DATA_DIR.to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            portable_caches: false,
            worker_threads: 0,
        }
    }
}

impl StorageConfig {
    /// Resolves the absolute data root for a project.
    pub fn data_root(&self, project_dir: &Path) -> PathBuf {
        let dir = Path::new(&self.data_dir);
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            project_dir.join(dir)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.data_dir, ".kiln");
        assert!(!config.portable_caches);
        assert_eq!(config.worker_threads, 0);
    }

    #[test]
    fn relative_data_root() {
        let config = StorageConfig::default();
        assert_eq!(
            config.data_root(Path::new("/work/project")),
            PathBuf::from("/work/project/.kiln")
        );
    }

    #[test]
    fn absolute_data_root() {
        let config = StorageConfig {
            data_dir: "/var/cache/kiln".to_string(),
            ..StorageConfig::default()
        };
        assert_eq!(
            config.data_root(Path::new("/work/project")),
            PathBuf::from("/var/cache/kiln")
        );
    }
}

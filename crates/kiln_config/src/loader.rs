//! Configuration file loading and validation.

use crate::error::ConfigError;
use crate::types::KilnConfig;
use std::path::{Component, Path};

/// Name of the configuration file inside a project directory.
pub const CONFIG_FILE: &str = "kiln.toml";

/// Upper bound on `storage.worker_threads`.
const MAX_WORKER_THREADS: usize = 256;

/// Loads and validates `kiln.toml` from a project directory.
pub fn load_config(project_dir: &Path) -> Result<KilnConfig, ConfigError> {
    let config_path = project_dir.join(CONFIG_FILE);
    let content = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    load_config_from_str(&content)
}

/// Loads `kiln.toml` if present, falling back to defaults when the file does
/// not exist. Parse and validation errors are still reported.
pub fn load_config_or_default(project_dir: &Path) -> Result<KilnConfig, ConfigError> {
    match load_config(project_dir) {
        Err(e) if e.is_missing_file() => Ok(KilnConfig::default()),
        other => other,
    }
}

/// Parses and validates a `kiln.toml` configuration from a string.
///
/// Useful for testing without filesystem dependencies.
pub fn load_config_from_str(content: &str) -> Result<KilnConfig, ConfigError> {
    let config: KilnConfig =
        toml::from_str(content).map_err(|e| ConfigError::Malformed(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Validates that required fields are present and values are in range.
fn validate_config(config: &KilnConfig) -> Result<(), ConfigError> {
    let data_dir = config.storage.data_dir.trim();
    if data_dir.is_empty() {
        return Err(ConfigError::Empty("storage.data_dir"));
    }
    if names_project_dir(Path::new(data_dir)) {
        return Err(ConfigError::Rejected {
            field: "storage.data_dir",
            reason: format!("`{data_dir}` is the project directory itself"),
        });
    }
    if config.storage.worker_threads > MAX_WORKER_THREADS {
        return Err(ConfigError::Rejected {
            field: "storage.worker_threads",
            reason: format!(
                "must be at most {MAX_WORKER_THREADS}, got {}",
                config.storage.worker_threads
            ),
        });
    }
    Ok(())
}

/// Returns `true` if the relative path `dir` resolves lexically to the
/// directory it is relative to, e.g. `.` or `src/..`.
fn names_project_dir(dir: &Path) -> bool {
    let mut depth = 0usize;
    for component in dir.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(_) => depth += 1,
            Component::ParentDir if depth > 0 => depth -= 1,
            // Leaves the project directory, or is absolute.
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    depth == 0
}

//! Errors raised while reading the `[storage]` settings of `kiln.toml`.

use std::path::PathBuf;

/// Why the build data storage settings could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `kiln.toml` exists but could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// The configuration file.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// `kiln.toml` is not valid TOML or does not match the schema.
    #[error("malformed storage configuration: {0}")]
    Malformed(String),

    /// A storage setting that must be non-empty is blank.
    #[error("storage setting `{0}` must not be empty")]
    Empty(&'static str),

    /// A storage setting has a value the stores cannot work with.
    #[error("storage setting `{field}` rejected: {reason}")]
    Rejected {
        /// Dotted name of the setting, e.g. `storage.data_dir`.
        field: &'static str,
        /// What is wrong with the value.
        reason: String,
    },
}

impl ConfigError {
    /// Returns `true` if the configuration file simply does not exist.
    pub fn is_missing_file(&self) -> bool {
        matches!(self, ConfigError::Read { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

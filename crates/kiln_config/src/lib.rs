//! Parsing and validation of `kiln.toml` storage configuration.
//!
//! This crate reads the project configuration file and produces a strongly-typed
//! [`KilnConfig`] describing where build data lives and which staleness strategy
//! the stores use.

#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod types;

pub use error::ConfigError;
pub use loader::{load_config, load_config_from_str, load_config_or_default, CONFIG_FILE};
pub use types::*;

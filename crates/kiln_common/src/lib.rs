//! Shared foundational types used across the Kiln build data stores.
//!
//! This crate provides content hashing for stamps and reverse-index keys, and
//! path normalization so that every store agrees on how a file is keyed.

#![warn(missing_docs)]

pub mod hash;
pub mod path;

pub use hash::{ContentHash, ContentHasher, Xxh3Hasher};
pub use path::{normalize_path, PathRelativizer, PROJECT_DIR_MACRO};

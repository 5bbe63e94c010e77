//! Content hashing for hash stamps and output-path index keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 64-bit content digest.
///
/// Two inputs with the same `ContentHash` are assumed to be identical. Used by
/// the hash stamp strategy to detect content changes independently of file
/// modification times, and to key the output-to-target claim index by path.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(u64);

impl ContentHash {
    /// Computes a content hash from a byte slice using XXH3-64.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(xxhash_rust::xxh3::xxh3_64(data))
    }

    /// Wraps a digest produced by some other hash function.
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw digest value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({:08x}..)", self.0 >> 32)
    }
}

/// A pluggable digest function `hash(bytes) -> ContentHash`.
///
/// Stores hold an `Arc<dyn ContentHasher>` so a build can swap in a different
/// digest without touching the stamp logic.
pub trait ContentHasher: Send + Sync {
    /// Hashes the given bytes.
    fn hash(&self, data: &[u8]) -> ContentHash;
}

/// The default [`ContentHasher`], backed by XXH3-64.
#[derive(Debug, Default, Clone, Copy)]
pub struct Xxh3Hasher;

impl ContentHasher for Xxh3Hasher {
    fn hash(&self, data: &[u8]) -> ContentHash {
        ContentHash::from_bytes(data)
    }
}

//! On-disk snapshot format.
//!
//! A snapshot is a 4-byte little-endian header length, a bincode header with
//! magic bytes, format version, entry count and payload checksum, followed by
//! the bincode-encoded entries.

use std::path::Path;

use kiln_common::ContentHash;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Magic bytes identifying a Kiln store snapshot.
const STORE_MAGIC: [u8; 4] = *b"KILN";

/// Current snapshot format version. Increment on breaking changes to the
/// header or payload encoding.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Header prepended to every snapshot for validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Magic bytes: must be `b"KILN"`.
    pub magic: [u8; 4],

    /// Snapshot format version.
    pub format_version: u32,

    /// Number of entries in the payload.
    pub entry_count: u64,

    /// Content hash of the payload bytes.
    pub checksum: ContentHash,
}

/// Encodes entries into a complete snapshot.
pub fn encode<K: Serialize, V: Serialize>(entries: &[(&K, &V)]) -> Result<Vec<u8>, StoreError> {
    let payload = bincode::serde::encode_to_vec(entries, bincode::config::standard())
        .map_err(|e| StoreError::Serialization {
            reason: e.to_string(),
        })?;

    let header = SnapshotHeader {
        magic: STORE_MAGIC,
        format_version: STORE_FORMAT_VERSION,
        entry_count: entries.len() as u64,
        checksum: ContentHash::from_bytes(&payload),
    };
    let header_bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard())
        .map_err(|e| StoreError::Serialization {
            reason: e.to_string(),
        })?;

    let header_len = header_bytes.len() as u32;
    let mut output = Vec::with_capacity(4 + header_bytes.len() + payload.len());
    output.extend_from_slice(&header_len.to_le_bytes());
    output.extend_from_slice(&header_bytes);
    output.extend_from_slice(&payload);
    Ok(output)
}

/// Decodes and validates a snapshot read from `path`.
///
/// Every validation failure is reported as [`StoreError::Corrupted`].
pub fn decode<K: DeserializeOwned, V: DeserializeOwned>(
    raw: &[u8],
    path: &Path,
) -> Result<Vec<(K, V)>, StoreError> {
    let corrupted = |reason: String| StoreError::Corrupted {
        path: path.to_path_buf(),
        reason,
    };

    if raw.len() < 4 {
        return Err(corrupted("truncated header length".to_string()));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&raw[..4]);
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    if raw.len() < 4 + header_len {
        return Err(corrupted("truncated header".to_string()));
    }

    let (header, _): (SnapshotHeader, usize) =
        bincode::serde::decode_from_slice(&raw[4..4 + header_len], bincode::config::standard())
            .map_err(|e| corrupted(format!("unreadable header: {e}")))?;

    if header.magic != STORE_MAGIC {
        return Err(corrupted("bad magic bytes".to_string()));
    }
    if header.format_version != STORE_FORMAT_VERSION {
        return Err(corrupted(format!(
            "format version {} (expected {STORE_FORMAT_VERSION})",
            header.format_version
        )));
    }

    let payload = &raw[4 + header_len..];
    let actual = ContentHash::from_bytes(payload);
    if actual != header.checksum {
        return Err(corrupted(format!(
            "checksum mismatch: expected {}, got {actual}",
            header.checksum
        )));
    }

    let (entries, _): (Vec<(K, V)>, usize) =
        bincode::serde::decode_from_slice(payload, bincode::config::standard())
            .map_err(|e| corrupted(format!("unreadable payload: {e}")))?;
    if entries.len() as u64 != header.entry_count {
        return Err(corrupted(format!(
            "entry count mismatch: expected {}, got {}",
            header.entry_count,
            entries.len()
        )));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        let a = ("src/A.java".to_string(), 1u64);
        let b = ("src/B.java".to_string(), 2u64);
        encode(&[(&a.0, &a.1), (&b.0, &b.1)]).unwrap()
    }

    fn frame(header: &SnapshotHeader, payload: &[u8]) -> Vec<u8> {
        let header_bytes =
            bincode::serde::encode_to_vec(header, bincode::config::standard()).unwrap();
        let mut out = Vec::new();
        out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn decode_valid_snapshot() {
        let entries: Vec<(String, u64)> = decode(&sample(), Path::new("data.bin")).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], ("src/B.java".to_string(), 2));
    }

    #[test]
    fn truncated_length_is_corruption() {
        let err = decode::<String, u64>(b"AB", Path::new("data.bin")).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn garbage_is_corruption() {
        let err = decode::<String, u64>(b"garbage data here", Path::new("data.bin")).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn flipped_payload_byte_is_corruption() {
        let mut raw = sample();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let err = decode::<String, u64>(&raw, Path::new("data.bin")).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn wrong_magic_is_corruption() {
        let payload = b"";
        let header = SnapshotHeader {
            magic: *b"BAAD",
            format_version: STORE_FORMAT_VERSION,
            entry_count: 0,
            checksum: ContentHash::from_bytes(payload),
        };
        let err = decode::<String, u64>(&frame(&header, payload), Path::new("x")).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn wrong_version_is_corruption() {
        let payload = bincode::serde::encode_to_vec(
            Vec::<(String, u64)>::new(),
            bincode::config::standard(),
        )
        .unwrap();
        let header = SnapshotHeader {
            magic: STORE_MAGIC,
            format_version: 999,
            entry_count: 0,
            checksum: ContentHash::from_bytes(&payload),
        };
        let err = decode::<String, u64>(&frame(&header, &payload), Path::new("x")).unwrap_err();
        assert!(err.to_string().contains("format version 999"));
    }
}

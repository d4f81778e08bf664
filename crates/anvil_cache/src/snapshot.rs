//! Whole-cache snapshot persistence.
//!
//! The entire table set is persisted as one binary file: a 4-byte
//! little-endian header length, a bincode-encoded header (magic bytes,
//! format version, payload checksum), then the bincode-encoded tables.
//! Saves are atomic — the snapshot is written to a sibling temp file and
//! renamed over the old one, so a crash mid-save can never corrupt an
//! existing cache. Loads are fail-safe: any validation failure yields
//! `None` (an empty cache), never an error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use anvil_common::Digest;

use crate::error::CacheError;
use crate::tables::Tables;

/// Magic bytes identifying an Anvil cache snapshot.
const SNAPSHOT_MAGIC: [u8; 4] = *b"ANVL";

/// Current snapshot format version. Increment on breaking changes to the
/// header or table encoding; old snapshots are then silently discarded.
const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Header prepended to every snapshot for validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotHeader {
    /// Magic bytes: must be `b"ANVL"`.
    magic: [u8; 4],

    /// Snapshot format version.
    format_version: u32,

    /// Content digest of the payload (for integrity checks).
    checksum: Digest,
}

/// Encodes and writes the tables to `path`, atomically.
pub fn save(tables: &Tables, path: &Path) -> Result<(), CacheError> {
    let payload = bincode::serde::encode_to_vec(tables, bincode::config::standard())
        .map_err(|e| snapshot_err(path, format!("encoding tables: {e}")))?;

    let header = SnapshotHeader {
        magic: SNAPSHOT_MAGIC,
        format_version: SNAPSHOT_FORMAT_VERSION,
        checksum: Digest::from_bytes(&payload),
    };
    let header_bytes = bincode::serde::encode_to_vec(&header, bincode::config::standard())
        .map_err(|e| snapshot_err(path, format!("encoding header: {e}")))?;

    let header_len = header_bytes.len() as u32;
    let mut output = Vec::with_capacity(4 + header_bytes.len() + payload.len());
    output.extend_from_slice(&header_len.to_le_bytes());
    output.extend_from_slice(&header_bytes);
    output.extend_from_slice(&payload);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| snapshot_err(path, format!("creating {}: {e}", parent.display())))?;
        }
    }

    // Write to a sibling temp file, then rename over the old snapshot.
    let tmp = tmp_path(path);
    std::fs::write(&tmp, &output)
        .map_err(|e| snapshot_err(path, format!("writing {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path).map_err(|e| snapshot_err(path, format!("renaming: {e}")))?;

    Ok(())
}

/// Reads and validates a snapshot, returning its tables with the reverse
/// file index rebuilt.
///
/// Fail-safe: a missing file, bad magic, version mismatch, checksum
/// mismatch, or decode failure all yield `None`.
pub fn load(path: &Path) -> Option<Tables> {
    let raw = std::fs::read(path).ok()?;

    if raw.len() < 4 {
        return None;
    }
    let header_len = u32::from_le_bytes(raw[..4].try_into().ok()?) as usize;
    if raw.len() < 4 + header_len {
        return None;
    }

    let header: SnapshotHeader =
        bincode::serde::decode_from_slice(&raw[4..4 + header_len], bincode::config::standard())
            .ok()?
            .0;

    if header.magic != SNAPSHOT_MAGIC {
        return None;
    }
    if header.format_version != SNAPSHOT_FORMAT_VERSION {
        return None;
    }

    let payload = &raw[4 + header_len..];
    if Digest::from_bytes(payload) != header.checksum {
        return None;
    }

    let mut tables: Tables =
        bincode::serde::decode_from_slice(payload, bincode::config::standard())
            .ok()?
            .0;
    tables.rebuild_index();
    Some(tables)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn snapshot_err(path: &Path, reason: String) -> CacheError {
    CacheError::Snapshot {
        path: path.to_path_buf(),
        reason,
    }
}

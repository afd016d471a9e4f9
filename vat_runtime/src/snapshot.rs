//! Snapshot layer: deterministic vatstore snapshots.
//!
//! A snapshot holds the canonical JSON of the vatstore at a transcript
//! position, a hash of that JSON, and the effect-log hash the vat had
//! reached. No timestamps in snapshot content.
//!
//! If a snapshot disagrees with replay, the transcript wins.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use vat_core::hashing::hex;
use vat_core::CORE_VERSION;

use crate::error::{Result, RuntimeError};

/// Snapshot on-disk format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Transcript sequence after which this snapshot was taken.
    pub sequence: u64,
    /// Canonical JSON of the vatstore (UTF-8, keys sorted).
    pub vatstore_json: String,
    /// SHA-256 of `vatstore_json`.
    pub hash: String,
    /// Canonical hash of the effect log up to `sequence`.
    pub effects_hash: String,
    pub core_version: u32,
}

fn snapshot_path(dir: &Path, sequence: u64) -> PathBuf {
    dir.join(format!("snapshot_{:06}.json", sequence))
}

fn content_hash(json: &str) -> String {
    hex(&Sha256::digest(json.as_bytes()))
}

/// Save a snapshot of `vatstore` taken after `sequence`.
pub fn save_snapshot(
    dir: &Path,
    sequence: u64,
    vatstore: &BTreeMap<String, String>,
    effects_hash: &str,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let vatstore_json = serde_json::to_string(vatstore)?;
    let snap = Snapshot {
        sequence,
        hash: content_hash(&vatstore_json),
        vatstore_json,
        effects_hash: effects_hash.to_string(),
        core_version: CORE_VERSION,
    };

    let path = snapshot_path(dir, sequence);
    let mut file = File::create(&path)?;
    file.write_all(serde_json::to_string(&snap)?.as_bytes())?;
    file.sync_all()?;

    debug!(sequence, keys = vatstore.len(), "snapshot saved");
    Ok(path)
}

/// Load the snapshot taken at `sequence`, if there is one.
pub fn load_snapshot(dir: &Path, sequence: u64) -> Result<Option<Snapshot>> {
    let path = snapshot_path(dir, sequence);
    if !path.exists() {
        return Ok(None);
    }
    let snap: Snapshot = serde_json::from_str(&fs::read_to_string(&path)?)?;
    Ok(Some(snap))
}

/// Load the snapshot with the highest sequence in `dir`.
pub fn load_latest_snapshot(dir: &Path) -> Result<Option<Snapshot>> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut best_seq: Option<u64> = None;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let seq = name
            .to_string_lossy()
            .strip_prefix("snapshot_")
            .and_then(|s| s.strip_suffix(".json"))
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(seq) = seq {
            best_seq = Some(best_seq.map_or(seq, |best| best.max(seq)));
        }
    }

    match best_seq {
        Some(seq) => load_snapshot(dir, seq),
        None => Ok(None),
    }
}

/// True if the snapshot's hash matches its vatstore JSON.
pub fn verify_snapshot_hash(snap: &Snapshot) -> bool {
    content_hash(&snap.vatstore_json) == snap.hash
}

/// Decode the vatstore held by a snapshot, refusing one whose content
/// does not match its hash or that was taken by another core version.
pub fn restore_vatstore(snap: &Snapshot) -> Result<BTreeMap<String, String>> {
    if snap.core_version != CORE_VERSION {
        return Err(RuntimeError::SnapshotMismatch {
            sequence: snap.sequence,
            detail: format!("core version {} != {}", snap.core_version, CORE_VERSION),
        });
    }
    if !verify_snapshot_hash(snap) {
        return Err(RuntimeError::SnapshotMismatch {
            sequence: snap.sequence,
            detail: "content hash mismatch".into(),
        });
    }
    Ok(serde_json::from_str(&snap.vatstore_json)?)
}

//! On-disk cache entries.
//!
//! Each committed fingerprint owns `entries/<hex>/` holding the artifact
//! directory and an `entry.json` record. The record carries a checksum of
//! itself and a content hash of the artifact directory, both re-verified
//! whenever the entry is loaded from disk.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::consts::{ENTRY_FILE, ENTRY_FORMAT_VERSION, PACKAGE_DIR};
use crate::fingerprint::Fingerprint;
use crate::package::{OptionSet, PackageRef};
use crate::recipe::{ExportInfo, Phase};
use crate::util::hash::{ContentHash, digest_bytes, digest_tree};

use super::CacheError;

/// An immutable, committed build of one fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub format_version: u32,
  pub fingerprint: Fingerprint,
  pub package: PackageRef,
  pub options: OptionSet,
  /// Phases that completed, in order.
  pub phases: Vec<Phase>,
  /// Artifact paths relative to `package_dir`.
  pub artifacts: Vec<PathBuf>,
  pub export: ExportInfo,
  /// Hash of the artifact directory at commit time.
  pub content_hash: ContentHash,
  pub created_at_unix: u64,
  /// Absolute artifact directory. Derived from the cache location.
  #[serde(skip)]
  pub package_dir: PathBuf,
}

/// The parts of an entry the builder supplies. The cache fills in the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
  pub package: PackageRef,
  pub options: OptionSet,
  pub phases: Vec<Phase>,
  pub artifacts: Vec<PathBuf>,
  pub export: ExportInfo,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
  entry: CacheEntry,
  checksum: String,
}

pub(super) fn now_unix() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs()
}

/// Turn a draft into a full entry for an artifact directory about to be committed.
pub(super) fn seal(fingerprint: Fingerprint, draft: NewEntry, package_dir: &Path) -> Result<CacheEntry, CacheError> {
  let content_hash = digest_tree(package_dir)?;
  Ok(CacheEntry {
    format_version: ENTRY_FORMAT_VERSION,
    fingerprint,
    package: draft.package,
    options: draft.options,
    phases: draft.phases,
    artifacts: draft.artifacts,
    export: draft.export,
    content_hash,
    created_at_unix: now_unix(),
    package_dir: package_dir.to_path_buf(),
  })
}

fn checksum(entry: &CacheEntry) -> Result<String, CacheError> {
  let bytes = serde_json::to_vec(entry)?;
  Ok(digest_bytes(&bytes).0)
}

/// Write `entry.json` into `dir` atomically.
pub(super) fn write_record(dir: &Path, entry: &CacheEntry) -> Result<(), CacheError> {
  let stored = StoredEntry {
    checksum: checksum(entry)?,
    entry: entry.clone(),
  };

  let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|e| CacheError::io(dir, e))?;
  serde_json::to_writer_pretty(&mut file, &stored)?;
  let target = dir.join(ENTRY_FILE);
  file.persist(&target).map_err(|e| CacheError::io(&target, e.error))?;
  Ok(())
}

/// Load and verify the entry stored in `dir`.
///
/// Returns `Ok(None)` if no record exists, `Err(CacheError::Corrupted)` if
/// the record or the artifacts fail verification.
pub(super) fn read_record(dir: &Path, expected: Fingerprint) -> Result<Option<CacheEntry>, CacheError> {
  let record_path = dir.join(ENTRY_FILE);
  let content = match std::fs::read_to_string(&record_path) {
    Ok(content) => content,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(CacheError::io(&record_path, e)),
  };

  let corrupted = |reason: String| CacheError::Corrupted {
    fingerprint: expected.to_hex(),
    reason,
  };

  let stored: StoredEntry = serde_json::from_str(&content).map_err(|e| corrupted(format!("unreadable record: {}", e)))?;
  let mut entry = stored.entry;

  if entry.format_version != ENTRY_FORMAT_VERSION {
    return Err(corrupted(format!("unsupported format version {}", entry.format_version)));
  }
  if entry.fingerprint != expected {
    return Err(corrupted(format!("record belongs to {}", entry.fingerprint)));
  }
  if checksum(&entry)? != stored.checksum {
    return Err(corrupted("record checksum mismatch".to_string()));
  }

  let package_dir = dir.join(PACKAGE_DIR);
  let actual = digest_tree(&package_dir).map_err(|e| corrupted(e.to_string()))?;
  if actual != entry.content_hash {
    return Err(corrupted(format!(
      "artifact hash mismatch: expected {}, got {}",
      entry.content_hash, actual
    )));
  }

  entry.package_dir = package_dir;
  Ok(Some(entry))
}

/// Read only the record, without verifying artifacts. Used for retention scans.
pub(super) fn peek_record(dir: &Path) -> Option<CacheEntry> {
  let content = std::fs::read_to_string(dir.join(ENTRY_FILE)).ok()?;
  let stored: StoredEntry = serde_json::from_str(&content).ok()?;
  Some(stored.entry)
}

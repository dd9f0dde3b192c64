//! Artifact digests for cache integrity checks.
//!
//! A package directory is folded into a single SHA-256 stream: every entry
//! contributes a kind tag, its length-prefixed relative path and its payload
//! (file bytes or symlink target). Entries are visited in sorted path order,
//! so the digest depends on names, layout and content but not on timestamps,
//! permissions or the order the filesystem reports entries in.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Lowercase hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum DigestError {
  #[error("failed to walk artifact tree: {0}")]
  Walk(#[from] walkdir::Error),

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

const TAG_DIR: u8 = b'd';
const TAG_FILE: u8 = b'f';
const TAG_LINK: u8 = b'l';

/// Digest everything below `root`. The root itself contributes nothing, so
/// an empty directory and a missing one differ only in the walk error.
pub fn digest_tree(root: &Path) -> Result<ContentHash, DigestError> {
  let mut hasher = Sha256::new();

  for item in WalkDir::new(root).min_depth(1).sort_by_file_name() {
    let item = item?;
    let path = item.path();
    let relative = path.strip_prefix(root).unwrap_or(path);
    // Forward slashes keep digests stable across platforms
    let name = relative
      .components()
      .map(|c| c.as_os_str().to_string_lossy())
      .collect::<Vec<_>>()
      .join("/");

    let kind = item.file_type();
    let tag = if kind.is_dir() {
      TAG_DIR
    } else if kind.is_file() {
      TAG_FILE
    } else if kind.is_symlink() {
      TAG_LINK
    } else {
      continue;
    };

    hasher.update([tag]);
    hasher.update((name.len() as u64).to_le_bytes());
    hasher.update(name.as_bytes());

    match tag {
      TAG_FILE => {
        let read_err = |source| DigestError::Read {
          path: path.to_path_buf(),
          source,
        };
        let mut file = File::open(path).map_err(read_err)?;
        let len = io::copy(&mut file, &mut hasher).map_err(read_err)?;
        hasher.update(len.to_le_bytes());
      }
      TAG_LINK => {
        let target = std::fs::read_link(path).map_err(|source| DigestError::Read {
          path: path.to_path_buf(),
          source,
        })?;
        let target = target.to_string_lossy();
        hasher.update((target.len() as u64).to_le_bytes());
        hasher.update(target.as_bytes());
      }
      _ => {}
    }
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

pub fn digest_bytes(data: &[u8]) -> ContentHash {
  ContentHash(hex::encode(Sha256::digest(data)))
}

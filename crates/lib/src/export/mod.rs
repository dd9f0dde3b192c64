//! Export metadata.
//!
//! What a consumer needs to link against a built package. Metadata for a node
//! is derived from its own cached export info plus the already-computed
//! metadata of its direct dependencies, never by walking the whole graph.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cache::CacheEntry;
use crate::package::PackageRef;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportMetadata {
  pub package: Option<PackageRef>,
  /// The package's own libraries, in link order.
  pub libraries: Vec<String>,
  /// Absolute include directories of the package and everything it depends on.
  pub include_dirs: BTreeSet<PathBuf>,
  /// Direct dependency names, in declaration order.
  pub link_requires: Vec<String>,
  pub properties: BTreeMap<String, String>,
}

/// Aggregate the export metadata of one packaged node.
///
/// `dependencies` holds the direct dependencies' metadata in declaration order.
pub fn export_metadata(entry: &CacheEntry, dependencies: &[(String, ExportMetadata)]) -> ExportMetadata {
  let mut include_dirs: BTreeSet<PathBuf> = entry
    .export
    .include_dirs
    .iter()
    .map(|dir| entry.package_dir.join(dir))
    .collect();
  for (_, dep) in dependencies {
    include_dirs.extend(dep.include_dirs.iter().cloned());
  }

  ExportMetadata {
    package: Some(entry.package.clone()),
    libraries: entry.export.libraries.clone(),
    include_dirs,
    link_requires: dependencies.iter().map(|(name, _)| name.clone()).collect(),
    properties: entry.export.properties.clone(),
  }
}

impl ExportMetadata {
  /// Look up a single property.
  pub fn property(&self, key: &str) -> Option<&str> {
    self.properties.get(key).map(String::as_str)
  }
}

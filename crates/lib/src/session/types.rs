use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheError;
use crate::consts::APP_NAME;
use crate::execute::{ExecuteError, ExecutionReport};
use crate::export::ExportMetadata;
use crate::fingerprint::{Fingerprint, FingerprintError};
use crate::graph::GraphError;
use crate::options::OptionError;
use crate::package::{OptionSet, PackageRef};

/// Settings for one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
  /// Maximum number of packages in flight. Zero is treated as one.
  pub parallelism: usize,
  /// Root directory of the package cache.
  pub cache_location: PathBuf,
}

impl Default for BuildOptions {
  fn default() -> Self {
    Self {
      parallelism: crate::execute::types::num_cpus(),
      cache_location: default_cache_location(),
    }
  }
}

impl BuildOptions {
  pub fn with_cache_location(mut self, location: impl Into<PathBuf>) -> Self {
    self.cache_location = location.into();
    self
  }

  pub fn with_parallelism(mut self, parallelism: usize) -> Self {
    self.parallelism = parallelism;
    self
  }

  /// Parallelism clamped to at least one.
  pub fn effective_parallelism(&self) -> usize {
    self.parallelism.max(1)
  }
}

/// Platform cache directory joined with the application name.
pub fn default_cache_location() -> PathBuf {
  dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join(APP_NAME)
}

/// Errors raised before any lifecycle phase runs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Options(#[from] OptionError),

  #[error(transparent)]
  Fingerprint(#[from] FingerprintError),
}

#[derive(Debug, Error)]
pub enum BuildError {
  /// Nothing ran: the graph could not be planned.
  #[error("planning failed: {0}")]
  Plan(#[from] PlanError),

  #[error("failed to open package cache: {0}")]
  Cache(#[from] CacheError),

  #[error("execution error: {0}")]
  Execute(#[from] ExecuteError),

  /// Execution finished with failed, skipped or cancelled packages.
  #[error("build failed: {}", .0.summary())]
  Failed(Box<ExecutionReport>),
}

/// One package of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPackage {
  pub package: PackageRef,
  pub options: OptionSet,
  pub fingerprint: Fingerprint,
  /// Direct dependency names, in declaration order.
  pub dependencies: Vec<String>,
}

/// Resolved packages in topological order, dependencies first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanReport {
  pub packages: Vec<PlannedPackage>,
}

impl PlanReport {
  pub fn get(&self, name: &str) -> Option<&PlannedPackage> {
    self.packages.iter().find(|p| p.package.name == name)
  }

  pub fn len(&self) -> usize {
    self.packages.len()
  }

  pub fn is_empty(&self) -> bool {
    self.packages.is_empty()
  }
}

impl fmt::Display for PlanReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for planned in &self.packages {
      write!(f, "{} {}", planned.package, planned.fingerprint.short())?;
      for (name, value) in &planned.options {
        write!(f, " {}={}", name, value)?;
      }
      if !planned.dependencies.is_empty() {
        write!(f, " <- {}", planned.dependencies.join(", "))?;
      }
      writeln!(f)?;
    }
    Ok(())
  }
}

/// Export metadata of every package of a successful build.
#[derive(Debug, Clone, Default)]
pub struct ExportedGraph {
  /// Package names in topological order.
  pub order: Vec<String>,
  pub exports: BTreeMap<String, ExportMetadata>,
  pub cache_hits: usize,
  pub built: usize,
}

impl ExportedGraph {
  pub fn get(&self, name: &str) -> Option<&ExportMetadata> {
    self.exports.get(name)
  }
}

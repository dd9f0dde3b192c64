//! Types for lifecycle execution.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;

use crate::cache::{CacheEntry, CacheError};
use crate::export::ExportMetadata;
use crate::fingerprint::Fingerprint;
use crate::package::PackageRef;
use crate::recipe::Phase;

/// Identifies which failed node caused a node to be skipped.
///
/// Skips propagate the original failure, so a node two levels above a
/// failed package names that package rather than the skipped one in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDependency {
  pub package: String,
}

impl std::fmt::Display for FailedDependency {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.package)
  }
}

/// A lifecycle phase of one node returned an error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{node} failed during {phase}: {cause}")]
pub struct LifecycleFailure {
  pub node: PackageRef,
  pub phase: Phase,
  /// The recipe's error, rendered with its full context chain.
  pub cause: String,
}

/// Errors that can occur during lifecycle execution.
#[derive(Debug, Error)]
pub enum ExecuteError {
  /// A phase failed. Nothing was cached for the node.
  #[error(transparent)]
  Lifecycle(#[from] LifecycleFailure),

  #[error("cache error: {0}")]
  Cache(#[from] CacheError),

  /// Execution requires every node to carry a fingerprint.
  #[error("{package} has not been fingerprinted")]
  NotFingerprinted { package: String },

  #[error("task for {package} panicked: {message}")]
  TaskPanicked { package: String, message: String },
}

/// A node that reached the exported state.
#[derive(Debug, Clone)]
pub struct RealizedNode {
  pub package: PackageRef,
  pub fingerprint: Fingerprint,
  /// True if the entry came from the cache and no phase ran.
  pub cached: bool,
  pub entry: Arc<CacheEntry>,
  pub export: ExportMetadata,
}

/// Outcome of executing a whole graph. Every node appears in exactly one map.
#[derive(Debug, Default)]
pub struct ExecutionReport {
  pub realized: BTreeMap<String, RealizedNode>,

  /// Nodes whose own execution failed.
  pub failed: BTreeMap<String, ExecuteError>,

  /// Nodes never run because a dependency failed.
  pub skipped: BTreeMap<String, FailedDependency>,

  /// Nodes never admitted, or stopped between phases, for any other reason.
  pub cancelled: BTreeSet<String>,
}

impl ExecutionReport {
  /// Returns true if every node was realized.
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty() && self.cancelled.is_empty()
  }

  /// Returns the total number of nodes accounted for.
  pub fn total(&self) -> usize {
    self.realized.len() + self.failed.len() + self.skipped.len() + self.cancelled.len()
  }

  /// Number of nodes served from the cache.
  pub fn cache_hits(&self) -> usize {
    self.realized.values().filter(|n| n.cached).count()
  }

  /// Number of nodes that ran their phases in this execution.
  pub fn built(&self) -> usize {
    self.realized.values().filter(|n| !n.cached).count()
  }

  pub fn summary(&self) -> String {
    format!(
      "{} realized, {} failed, {} skipped, {} cancelled",
      self.realized.len(),
      self.failed.len(),
      self.skipped.len(),
      self.cancelled.len()
    )
  }
}

/// Configuration for lifecycle execution.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of nodes in flight at once.
  pub parallelism: usize,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      parallelism: num_cpus(),
    }
  }
}

/// Get the number of CPUs for default parallelism.
pub(crate) fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

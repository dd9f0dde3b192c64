use std::fmt;
use std::sync::Arc;

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::package::{OptionSet, PackageRef, VersionConstraint};
use crate::recipe::{Phase, Recipe};

/// Index of a node inside its owning [`Graph`](super::Graph).
pub type NodeId = NodeIndex;

/// Progress of a node through resolution and its lifecycle.
///
/// States are ordered, so `state >= LifecycleState::Fingerprinted` is a valid
/// progress check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
  Unresolved,
  OptionsResolved,
  Fingerprinted,
  Sourced,
  Configured,
  Built,
  Packaged,
  Exported,
}

impl LifecycleState {
  /// The state reached once `phase` completes.
  pub fn after(phase: Phase) -> Self {
    match phase {
      Phase::Source => LifecycleState::Sourced,
      Phase::Configure => LifecycleState::Configured,
      Phase::Build => LifecycleState::Built,
      Phase::Package => LifecycleState::Packaged,
    }
  }
}

/// Who declared a requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Consumer {
  Root,
  Package(NodeId),
}

/// A requirement as it arrived at its target node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
  pub consumer: Consumer,
  /// Package name of the consumer, or `root`.
  pub consumer_name: String,
  pub constraint: VersionConstraint,
  pub options: OptionSet,
  pub is_override: bool,
}

/// One resolved package instance.
pub struct Node {
  pub package: PackageRef,
  pub recipe: Arc<dyn Recipe>,
  /// Final options; empty until the option resolver runs.
  pub options: OptionSet,
  /// Direct dependencies in declaration order.
  pub dependencies: Vec<NodeId>,
  /// Every requirement that targets this node, in visitation order.
  pub incoming: Vec<Edge>,
  pub fingerprint: Option<Fingerprint>,
  pub state: LifecycleState,
}

impl Node {
  pub(crate) fn new(package: PackageRef, recipe: Arc<dyn Recipe>) -> Self {
    Self {
      package,
      recipe,
      options: OptionSet::new(),
      dependencies: Vec::new(),
      incoming: Vec::new(),
      fingerprint: None,
      state: LifecycleState::Unresolved,
    }
  }

  pub fn name(&self) -> &str {
    &self.package.name
  }
}

impl fmt::Debug for Node {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Node")
      .field("package", &self.package)
      .field("options", &self.options)
      .field("dependencies", &self.dependencies)
      .field("fingerprint", &self.fingerprint)
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}

/// Errors raised while assembling the requirement graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
  /// A package is reachable from itself. `path` starts and ends with it.
  #[error("cyclic dependency: {}", .path.join(" -> "))]
  CyclicDependency { path: Vec<String> },

  /// Requirements on one package name cannot agree on a version.
  #[error("version conflict on {name}: {}", describe_requests(.requesting_nodes, .constraints))]
  VersionConflict {
    name: String,
    requesting_nodes: Vec<String>,
    constraints: Vec<VersionConstraint>,
  },

  #[error("no recipe for {package} (required by {required_by})")]
  RecipeNotFound { package: PackageRef, required_by: String },
}

fn describe_requests(nodes: &[String], constraints: &[VersionConstraint]) -> String {
  nodes
    .iter()
    .zip(constraints)
    .map(|(node, constraint)| format!("{} wants {}", node, constraint))
    .collect::<Vec<_>>()
    .join(", ")
}

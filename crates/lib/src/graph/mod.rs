//! Requirement graph.
//!
//! The graph owns one [`Node`] per distinct package name reached from the root
//! requirements. Consumers refer to their dependencies by [`NodeId`], so a
//! package shared by many consumers exists exactly once.
//!
//! Assembly walks requirements depth-first in declaration order with an
//! explicit path stack, which gives both cycle detection and a deterministic
//! topological order (dependencies before consumers).
//!
//! # Submodules
//!
//! - `assemble` - the transitive walk and version validation

mod assemble;
mod types;

use std::collections::{BTreeMap, HashMap};

use petgraph::Direction;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use tracing::{debug, info};

use crate::package::Requirement;
use crate::recipe::RecipeSource;

use assemble::{Assembler, Walk};

pub use types::*;

/// The assembled requirement graph.
///
/// Edges in the underlying DAG point from a dependency to its consumer.
pub struct Graph {
  dag: DiGraph<Node, ()>,
  by_name: HashMap<String, NodeId>,
  order: Vec<NodeId>,
  /// Index of each node in `order`.
  positions: HashMap<NodeId, usize>,
  roots: Vec<NodeId>,
}

impl Graph {
  fn empty() -> Self {
    Self {
      dag: DiGraph::new(),
      by_name: HashMap::new(),
      order: Vec::new(),
      positions: HashMap::new(),
      roots: Vec::new(),
    }
  }

  /// Assemble the full transitive graph for a set of root requirements.
  ///
  /// # Errors
  ///
  /// - `CyclicDependency` when a package requires itself, directly or not
  /// - `VersionConflict` when requirements on one name disagree on a version
  ///   and no override settles it
  /// - `RecipeNotFound` when a reached package has no recipe
  pub fn build(root: &[Requirement], source: &dyn RecipeSource) -> Result<Graph, GraphError> {
    let mut pins = BTreeMap::new();

    loop {
      match Assembler::new(source, &pins).run(root)? {
        Walk::Complete(graph) => {
          debug_assert!(!is_cyclic_directed(&graph.dag));
          info!(nodes = graph.len(), restarts = pins.len(), "assembled requirement graph");
          return Ok(graph);
        }
        Walk::Repin { name, pin } => {
          debug!(package = %name, version = %pin.version, authoritative = pin.authoritative, "restarting walk with pinned version");
          pins.insert(name, pin);
        }
      }
    }
  }

  pub fn node(&self, id: NodeId) -> &Node {
    &self.dag[id]
  }

  pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
    &mut self.dag[id]
  }

  pub fn id_of(&self, name: &str) -> Option<NodeId> {
    self.by_name.get(name).copied()
  }

  pub fn node_by_name(&self, name: &str) -> Option<&Node> {
    self.id_of(name).map(|id| self.node(id))
  }

  /// Direct dependencies of a node, in declaration order.
  pub fn dependencies(&self, id: NodeId) -> &[NodeId] {
    &self.dag[id].dependencies
  }

  /// Nodes that directly depend on `id`, in topological order.
  pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
    let mut dependents: Vec<NodeId> = self.dag.neighbors_directed(id, Direction::Outgoing).collect();
    dependents.sort_by_key(|d| self.position(*d));
    dependents
  }

  /// Every node, dependencies before consumers. Ties follow declaration order.
  pub fn topological_order(&self) -> &[NodeId] {
    &self.order
  }

  /// Nodes required directly by the root, in declaration order.
  pub fn roots(&self) -> &[NodeId] {
    &self.roots
  }

  /// Nodes in topological order.
  pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
    self.order.iter().map(move |&id| (id, &self.dag[id]))
  }

  pub fn len(&self) -> usize {
    self.dag.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.dag.node_count() == 0
  }

  fn position(&self, id: NodeId) -> usize {
    self.positions.get(&id).copied().unwrap_or(usize::MAX)
  }

  /// Append a finished node to the topological order.
  fn place(&mut self, id: NodeId) {
    self.positions.insert(id, self.order.len());
    self.order.push(id);
  }

  fn insert(&mut self, node: Node) -> NodeId {
    let name = node.package.name.clone();
    let id = self.dag.add_node(node);
    self.by_name.insert(name, id);
    id
  }

  fn link(&mut self, dependency: NodeId, consumer: Consumer) {
    match consumer {
      Consumer::Root => {
        if !self.roots.contains(&dependency) {
          self.roots.push(dependency);
        }
      }
      Consumer::Package(consumer) => {
        if !self.dag[consumer].dependencies.contains(&dependency) {
          self.dag[consumer].dependencies.push(dependency);
          self.dag.add_edge(dependency, consumer, ());
        }
      }
    }
  }
}

impl std::fmt::Debug for Graph {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_list().entries(self.nodes().map(|(_, n)| n)).finish()
  }
}

//! Transitive requirement walk.
//!
//! The walk is an explicit depth-first traversal: each frame is a node whose
//! declared requirements are being visited, and `path` mirrors the frame
//! stack by name so a requirement on any name already on the path is a cycle.
//!
//! Versions are decided on first sight of a name. When a later requirement
//! carries a version that should have won (an override, or an exact
//! constraint arriving after an `Any`), the walk is abandoned and restarted
//! with that version pinned, because the first version's recipe may declare
//! different requirements. Pins only ever strengthen, so restarts are bounded
//! by the number of distinct names.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::trace;

use crate::consts::ROOT_CONSUMER;
use crate::package::{PackageRef, Requirement};
use crate::recipe::RecipeSource;

use super::types::{Consumer, Edge, GraphError, Node, NodeId};
use super::Graph;

/// A version decided before the walk starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Pin {
  pub version: String,
  /// Set when the pin came from an override requirement.
  pub authoritative: bool,
}

pub(super) enum Walk {
  Complete(Graph),
  Repin { name: String, pin: Pin },
}

struct Frame {
  id: NodeId,
  requirements: Vec<Requirement>,
  next: usize,
}

pub(super) struct Assembler<'a> {
  source: &'a dyn RecipeSource,
  pins: &'a BTreeMap<String, Pin>,
  graph: Graph,
  /// Nodes whose version came from an exact constraint or a pin.
  fixed: HashSet<NodeId>,
  path: Vec<String>,
  on_path: HashSet<String>,
  frames: Vec<Frame>,
}

impl<'a> Assembler<'a> {
  pub fn new(source: &'a dyn RecipeSource, pins: &'a BTreeMap<String, Pin>) -> Self {
    Self {
      source,
      pins,
      graph: Graph::empty(),
      fixed: HashSet::new(),
      path: Vec::new(),
      on_path: HashSet::new(),
      frames: Vec::new(),
    }
  }

  pub fn run(mut self, root: &[Requirement]) -> Result<Walk, GraphError> {
    for req in root {
      if let Some(repin) = self.visit(Consumer::Root, ROOT_CONSUMER, req)? {
        return Ok(repin);
      }
      if let Some(repin) = self.drain()? {
        return Ok(repin);
      }
    }

    self.validate_versions()?;
    Ok(Walk::Complete(self.graph))
  }

  /// Visit pending requirements until the frame stack is empty.
  fn drain(&mut self) -> Result<Option<Walk>, GraphError> {
    while let Some(frame) = self.frames.last_mut() {
      if frame.next < frame.requirements.len() {
        let req = frame.requirements[frame.next].clone();
        frame.next += 1;
        let consumer = frame.id;
        let consumer_name = self.graph.node(consumer).package.name.clone();

        if let Some(repin) = self.visit(Consumer::Package(consumer), &consumer_name, &req)? {
          return Ok(Some(repin));
        }
      } else {
        let id = frame.id;
        self.frames.pop();
        self.graph.place(id);
        if let Some(name) = self.path.pop() {
          self.on_path.remove(&name);
        }
      }
    }
    Ok(None)
  }

  fn visit(&mut self, consumer: Consumer, consumer_name: &str, req: &Requirement) -> Result<Option<Walk>, GraphError> {
    let name = req.name();

    if self.on_path.contains(name) {
      let start = self.path.iter().position(|p| p == name).unwrap_or(0);
      let mut path = self.path[start..].to_vec();
      path.push(name.to_string());
      return Err(GraphError::CyclicDependency { path });
    }

    let edge = Edge {
      consumer,
      consumer_name: consumer_name.to_string(),
      constraint: req.constraint.clone(),
      options: req.options.clone(),
      is_override: req.is_override,
    };

    if let Some(id) = self.graph.id_of(name) {
      if let Some(repin) = self.repin_for(id, req) {
        return Ok(Some(repin));
      }
      trace!(package = %name, consumer = %consumer_name, "attaching edge to existing node");
      self.graph.node_mut(id).incoming.push(edge);
      self.graph.link(id, consumer);
      return Ok(None);
    }

    let pin = self.pins.get(name).cloned();
    let version = pin
      .as_ref()
      .map(|p| p.version.clone())
      .unwrap_or_else(|| req.package.version.clone());
    let package = PackageRef::new(name, version);
    let recipe = self
      .source
      .recipe(&package)
      .ok_or_else(|| GraphError::RecipeNotFound {
        package: package.clone(),
        required_by: consumer_name.to_string(),
      })?;
    let requirements = recipe.declared_requirements();

    trace!(package = %package, consumer = %consumer_name, "adding node");
    let id = self.graph.insert(Node::new(package, recipe));
    if pin.is_some() || req.constraint.exact().is_some() {
      self.fixed.insert(id);
    }
    self.graph.node_mut(id).incoming.push(edge);
    self.graph.link(id, consumer);

    self.path.push(name.to_string());
    self.on_path.insert(name.to_string());
    self.frames.push(Frame {
      id,
      requirements,
      next: 0,
    });

    Ok(None)
  }

  /// Decide whether `req` should have chosen the node's version instead.
  fn repin_for(&self, id: NodeId, req: &Requirement) -> Option<Walk> {
    let wanted = req.constraint.exact()?;
    let node = self.graph.node(id);
    if node.package.version == wanted {
      return None;
    }

    let existing = self.pins.get(req.name());
    let should_repin = if req.is_override {
      !existing.is_some_and(|p| p.authoritative)
    } else {
      existing.is_none() && !self.fixed.contains(&id)
    };

    should_repin.then(|| Walk::Repin {
      name: req.name().to_string(),
      pin: Pin {
        version: wanted.to_string(),
        authoritative: req.is_override,
      },
    })
  }

  /// Check every node's version against the requirements that reached it.
  fn validate_versions(&self) -> Result<(), GraphError> {
    for (_, node) in self.graph.nodes() {
      let override_versions: BTreeSet<&str> = node
        .incoming
        .iter()
        .filter(|e| e.is_override)
        .filter_map(|e| e.constraint.exact())
        .collect();

      let consistent = match override_versions.len() {
        0 => node.incoming.iter().all(|e| e.constraint.allows(&node.package.version)),
        1 => override_versions.contains(node.package.version.as_str()),
        _ => false,
      };

      if !consistent {
        let relevant: Vec<&Edge> = if override_versions.len() > 1 {
          node.incoming.iter().filter(|e| e.is_override).collect()
        } else {
          node.incoming.iter().collect()
        };
        return Err(GraphError::VersionConflict {
          name: node.package.name.clone(),
          requesting_nodes: relevant.iter().map(|e| e.consumer_name.clone()).collect(),
          constraints: relevant.iter().map(|e| e.constraint.clone()).collect(),
        });
      }
    }
    Ok(())
  }
}

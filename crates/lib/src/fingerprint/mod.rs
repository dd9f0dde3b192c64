//! Fingerprint engine.
//!
//! A fingerprint identifies the exact buildable configuration of a node and
//! is the package cache key. It covers the package identity, the resolved
//! options, the recipe content and, in declaration order, the fingerprints of
//! the node's dependencies. Changing any of these changes the fingerprint of
//! the node and of every node that transitively depends on it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, trace};

use crate::consts::{FINGERPRINT_LEN, FINGERPRINT_SHORT_LEN};
use crate::graph::{Graph, LifecycleState, NodeId};
use crate::package::{OptionSet, PackageRef};

/// A fixed-width SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(pub [u8; FINGERPRINT_LEN]);

impl Fingerprint {
  /// Lowercase hex, used for storage paths.
  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }

  /// Abbreviated hex for log lines.
  pub fn short(&self) -> String {
    self.to_hex()[..FINGERPRINT_SHORT_LEN].to_string()
  }

  /// First byte, used to pick a reservation shard.
  pub fn shard_byte(&self) -> u8 {
    self.0[0]
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_hex())
  }
}

impl fmt::Debug for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Fingerprint({})", self.short())
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
  #[error("invalid fingerprint '{0}': expected {len} hex characters", len = FINGERPRINT_LEN * 2)]
  InvalidHex(String),

  /// A dependency was not fingerprinted before its consumer.
  #[error("dependency {dependency} of {package} has no fingerprint yet")]
  DependencyPending { package: String, dependency: String },
}

impl FromStr for Fingerprint {
  type Err = FingerprintError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let bytes = hex::decode(s).map_err(|_| FingerprintError::InvalidHex(s.to_string()))?;
    let digest: [u8; FINGERPRINT_LEN] = bytes
      .try_into()
      .map_err(|_| FingerprintError::InvalidHex(s.to_string()))?;
    Ok(Fingerprint(digest))
  }
}

impl Serialize for Fingerprint {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_hex())
  }
}

impl<'de> Deserialize<'de> for Fingerprint {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

/// Compute the fingerprint of one configuration.
///
/// Every field is tagged and length-prefixed so no two distinct inputs share
/// an encoding. Dependency fingerprints are hashed in the order given.
pub fn compute(package: &PackageRef, options: &OptionSet, content_id: &str, dependencies: &[Fingerprint]) -> Fingerprint {
  let mut hasher = Sha256::new();

  feed(&mut hasher, b"N", package.name.as_bytes());
  feed(&mut hasher, b"V", package.version.as_bytes());
  // BTreeMap iteration is already sorted by option name
  for (name, value) in options {
    feed(&mut hasher, b"O", name.as_bytes());
    feed(&mut hasher, b"=", value.to_string().as_bytes());
  }
  feed(&mut hasher, b"R", content_id.as_bytes());
  for dep in dependencies {
    feed(&mut hasher, b"D", &dep.0);
  }

  let digest = hasher.finalize();
  let mut out = [0u8; FINGERPRINT_LEN];
  out.copy_from_slice(&digest);
  Fingerprint(out)
}

fn feed(hasher: &mut Sha256, tag: &[u8], data: &[u8]) {
  hasher.update(tag);
  hasher.update((data.len() as u64).to_le_bytes());
  hasher.update(data);
}

/// Fingerprint a single node whose dependencies are already fingerprinted.
pub fn fingerprint_node(graph: &Graph, id: NodeId) -> Result<Fingerprint, FingerprintError> {
  let node = graph.node(id);

  let mut deps = Vec::with_capacity(node.dependencies.len());
  for &dep_id in &node.dependencies {
    let dep = graph.node(dep_id);
    let fp = dep.fingerprint.ok_or_else(|| FingerprintError::DependencyPending {
      package: node.package.to_string(),
      dependency: dep.package.to_string(),
    })?;
    deps.push(fp);
  }

  Ok(compute(&node.package, &node.options, &node.recipe.content_id(), &deps))
}

/// Assign fingerprints to every node, dependencies first.
pub fn assign_all(graph: &mut Graph) -> Result<(), FingerprintError> {
  let order = graph.topological_order().to_vec();

  for id in order {
    let fp = fingerprint_node(graph, id)?;
    let node = graph.node_mut(id);
    trace!(package = %node.package, fingerprint = %fp.short(), "fingerprinted");
    node.fingerprint = Some(fp);
    node.state = LifecycleState::Fingerprinted;
  }

  debug!(nodes = graph.len(), "assigned fingerprints");
  Ok(())
}

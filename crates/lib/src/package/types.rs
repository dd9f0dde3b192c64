use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of a package: a name plus an opaque version string.
///
/// Versions are compared for equality only. Two refs with the same name are
/// the same logical dependency.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PackageRef {
  pub name: String,
  pub version: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid package reference '{input}': expected name/version")]
pub struct ParseRefError {
  pub input: String,
}

impl PackageRef {
  pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
    }
  }

  /// Parse the `name/version` notation, e.g. `ffmpeg/6.0`.
  pub fn parse(input: &str) -> Result<Self, ParseRefError> {
    match input.split_once('/') {
      Some((name, version)) if !name.is_empty() && !version.is_empty() && !version.contains('/') => {
        Ok(Self::new(name, version))
      }
      _ => Err(ParseRefError {
        input: input.to_string(),
      }),
    }
  }
}

impl fmt::Display for PackageRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.name, self.version)
  }
}

/// Version constraint carried by a requirement edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VersionConstraint {
  /// Accepts whatever version the rest of the graph settles on.
  Any,
  /// Requires exactly this version.
  Exact(String),
}

impl VersionConstraint {
  /// Whether two constraints can be satisfied by one version.
  pub fn is_compatible(&self, other: &VersionConstraint) -> bool {
    match (self, other) {
      (VersionConstraint::Any, _) | (_, VersionConstraint::Any) => true,
      (VersionConstraint::Exact(a), VersionConstraint::Exact(b)) => a == b,
    }
  }

  pub fn allows(&self, version: &str) -> bool {
    match self {
      VersionConstraint::Any => true,
      VersionConstraint::Exact(v) => v == version,
    }
  }

  pub fn exact(&self) -> Option<&str> {
    match self {
      VersionConstraint::Any => None,
      VersionConstraint::Exact(v) => Some(v),
    }
  }
}

impl fmt::Display for VersionConstraint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      VersionConstraint::Any => write!(f, "*"),
      VersionConstraint::Exact(v) => write!(f, "={}", v),
    }
  }
}

/// A typed option value.
///
/// Values of different variants never compare equal, so the resolver can tell
/// a disagreement in value from a disagreement in kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum OptionValue {
  Bool(bool),
  Str(String),
  Enum(String),
}

impl OptionValue {
  pub fn kind(&self) -> &'static str {
    match self {
      OptionValue::Bool(_) => "bool",
      OptionValue::Str(_) => "str",
      OptionValue::Enum(_) => "enum",
    }
  }

  pub fn same_kind(&self, other: &OptionValue) -> bool {
    self.kind() == other.kind()
  }
}

impl From<bool> for OptionValue {
  fn from(value: bool) -> Self {
    OptionValue::Bool(value)
  }
}

impl From<&str> for OptionValue {
  fn from(value: &str) -> Self {
    OptionValue::Str(value.to_string())
  }
}

/// Canonical text form, `kind:value`.
impl fmt::Display for OptionValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OptionValue::Bool(b) => write!(f, "bool:{}", b),
      OptionValue::Str(s) => write!(f, "str:{}", s),
      OptionValue::Enum(s) => write!(f, "enum:{}", s),
    }
  }
}

/// Option name to value, ordered by name.
pub type OptionSet = BTreeMap<String, OptionValue>;

/// A requirement declared by the root project or by a recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
  pub package: PackageRef,
  pub constraint: VersionConstraint,
  /// Option values this consumer asks for on the dependency.
  pub options: OptionSet,
  /// Marks this requirement's version and options as authoritative.
  pub is_override: bool,
}

impl Requirement {
  /// A plain requirement on exactly `name/version`.
  pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
    let package = PackageRef::new(name, version);
    let constraint = VersionConstraint::Exact(package.version.clone());
    Self {
      package,
      constraint,
      options: OptionSet::new(),
      is_override: false,
    }
  }

  pub fn parse(reference: &str) -> Result<Self, ParseRefError> {
    let package = PackageRef::parse(reference)?;
    Ok(Self::new(package.name, package.version))
  }

  pub fn with_option(mut self, name: impl Into<String>, value: impl Into<OptionValue>) -> Self {
    self.options.insert(name.into(), value.into());
    self
  }

  pub fn overriding(mut self) -> Self {
    self.is_override = true;
    self
  }

  pub fn any_version(mut self) -> Self {
    self.constraint = VersionConstraint::Any;
    self
  }

  pub fn name(&self) -> &str {
    &self.package.name
  }
}

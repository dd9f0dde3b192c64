//! Recipe collaborator interface.
//!
//! A recipe describes one package: what it requires, which options it
//! declares, and how to run each lifecycle phase. Fetching sources, invoking a
//! toolchain and laying out the package are recipe business; the core only
//! sequences the calls and caches the outcome.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::export::ExportMetadata;
use crate::fingerprint::Fingerprint;
use crate::package::{OptionSet, PackageRef, Requirement};

/// One ordered step in producing a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
  Source,
  Configure,
  Build,
  Package,
}

impl Phase {
  /// All phases in execution order.
  pub const ALL: [Phase; 4] = [Phase::Source, Phase::Configure, Phase::Build, Phase::Package];
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Phase::Source => "source",
      Phase::Configure => "configure",
      Phase::Build => "build",
      Phase::Package => "package",
    };
    write!(f, "{}", name)
  }
}

/// Everything a phase may look at.
///
/// All directories live under the cache's staging area for this fingerprint
/// and are discarded if any phase fails.
#[derive(Debug, Clone)]
pub struct PhaseContext {
  pub package: PackageRef,
  pub fingerprint: Fingerprint,
  pub options: OptionSet,
  /// Export metadata of the direct dependencies, in declaration order.
  pub dependencies: Vec<(String, ExportMetadata)>,
  pub source_dir: PathBuf,
  pub build_dir: PathBuf,
  /// Where the package phase lays out artifacts. Becomes the cached package.
  pub package_dir: PathBuf,
  /// Fires when the session is cancelled. Phases decide how to wind down.
  pub cancel: CancellationToken,
}

/// What a single phase reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseResult {
  /// Artifact paths, relative to the package directory.
  pub artifacts: Vec<PathBuf>,
}

impl PhaseResult {
  pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
    self.artifacts.push(path.into());
    self
  }
}

/// Accumulated outcome of all phases of one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltArtifacts {
  pub package_dir: PathBuf,
  pub artifacts: Vec<PathBuf>,
}

/// Build facts a recipe publishes about its packaged output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInfo {
  /// Library names, in link order.
  pub libraries: Vec<String>,
  /// Include directories, relative to the package directory.
  pub include_dirs: Vec<PathBuf>,
  pub properties: BTreeMap<String, String>,
}

/// A package recipe.
#[async_trait]
pub trait Recipe: Send + Sync {
  /// Requirements on other packages, in declaration order.
  fn declared_requirements(&self) -> Vec<Requirement>;

  /// Declared options and their defaults.
  fn default_options(&self) -> OptionSet;

  /// Allowed values for enum options. Options not listed accept any value.
  fn option_choices(&self) -> BTreeMap<String, Vec<String>> {
    BTreeMap::new()
  }

  /// Stable identifier of the recipe definition itself.
  fn content_id(&self) -> String;

  /// Run one lifecycle phase.
  async fn run_phase(&self, phase: Phase, ctx: &PhaseContext) -> anyhow::Result<PhaseResult>;

  /// Describe the packaged output to consumers.
  fn export_info(&self, built: &BuiltArtifacts) -> ExportInfo;
}

/// Locates the recipe for a package reference.
pub trait RecipeSource: Send + Sync {
  fn recipe(&self, package: &PackageRef) -> Option<Arc<dyn Recipe>>;
}

/// In-memory recipe index keyed by name and version.
#[derive(Default, Clone)]
pub struct RecipeRegistry {
  recipes: HashMap<PackageRef, Arc<dyn Recipe>>,
}

impl RecipeRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, package: PackageRef, recipe: Arc<dyn Recipe>) {
    self.recipes.insert(package, recipe);
  }

  pub fn with(mut self, package: PackageRef, recipe: Arc<dyn Recipe>) -> Self {
    self.register(package, recipe);
    self
  }

  pub fn len(&self) -> usize {
    self.recipes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.recipes.is_empty()
  }
}

impl RecipeSource for RecipeRegistry {
  fn recipe(&self, package: &PackageRef) -> Option<Arc<dyn Recipe>> {
    self.recipes.get(package).cloned()
  }
}

impl fmt::Debug for RecipeRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut keys: Vec<String> = self.recipes.keys().map(|k| k.to_string()).collect();
    keys.sort();
    f.debug_struct("RecipeRegistry").field("recipes", &keys).finish()
  }
}

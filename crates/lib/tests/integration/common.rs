//! Shared test helpers for library integration tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use pkgweave_lib::recipe::{BuiltArtifacts, ExportInfo, Phase, PhaseContext, PhaseResult};
use pkgweave_lib::{BuildOptions, OptionSet, OptionValue, PackageRef, Recipe, RecipeRegistry, Requirement, Session};
use tempfile::TempDir;

/// A recipe that writes a one-file static library and counts phase calls.
pub struct FakeRecipe {
  pub name: String,
  requirements: Vec<Requirement>,
  defaults: OptionSet,
  failing_phase: Option<Phase>,
  phase_delay: Option<Duration>,
  calls: AtomicUsize,
}

impl FakeRecipe {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      requirements: Vec::new(),
      defaults: OptionSet::new(),
      failing_phase: None,
      phase_delay: None,
      calls: AtomicUsize::new(0),
    }
  }

  pub fn needs(mut self, requirement: Requirement) -> Self {
    self.requirements.push(requirement);
    self
  }

  pub fn default_option(mut self, name: &str, value: impl Into<OptionValue>) -> Self {
    self.defaults.insert(name.to_string(), value.into());
    self
  }

  pub fn failing_at(mut self, phase: Phase) -> Self {
    self.failing_phase = Some(phase);
    self
  }

  pub fn slow(mut self, delay: Duration) -> Self {
    self.phase_delay = Some(delay);
    self
  }

  pub fn shared(self) -> Arc<Self> {
    Arc::new(self)
  }

  /// Number of phases invoked so far.
  pub fn phase_calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Recipe for FakeRecipe {
  fn declared_requirements(&self) -> Vec<Requirement> {
    self.requirements.clone()
  }

  fn default_options(&self) -> OptionSet {
    self.defaults.clone()
  }

  fn content_id(&self) -> String {
    format!("fake:{}", self.name)
  }

  async fn run_phase(&self, phase: Phase, ctx: &PhaseContext) -> anyhow::Result<PhaseResult> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    if let Some(delay) = self.phase_delay {
      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = ctx.cancel.cancelled() => {}
      }
    }
    if self.failing_phase == Some(phase) {
      bail!("{} exploded in {}", self.name, phase);
    }

    match phase {
      Phase::Source => {
        tokio::fs::write(ctx.source_dir.join("CMakeLists.txt"), &self.name).await?;
        Ok(PhaseResult::default())
      }
      Phase::Package => {
        let lib = PathBuf::from("lib").join(format!("lib{}.a", self.name));
        tokio::fs::create_dir_all(ctx.package_dir.join("lib")).await?;
        tokio::fs::create_dir_all(ctx.package_dir.join("include")).await?;
        let options: Vec<String> = ctx.options.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        tokio::fs::write(ctx.package_dir.join(&lib), options.join(";")).await?;
        Ok(PhaseResult::default().with_artifact(lib))
      }
      Phase::Configure | Phase::Build => Ok(PhaseResult::default()),
    }
  }

  fn export_info(&self, _built: &BuiltArtifacts) -> ExportInfo {
    let mut properties = BTreeMap::new();
    properties.insert("cmake_file_name".to_string(), self.name.clone());
    ExportInfo {
      libraries: vec![self.name.clone()],
      include_dirs: vec![PathBuf::from("include")],
      properties,
    }
  }
}

/// Register every recipe at version 1.0.
pub fn registry_of(recipes: &[Arc<FakeRecipe>]) -> RecipeRegistry {
  let mut registry = RecipeRegistry::new();
  for recipe in recipes {
    registry.register(PackageRef::new(recipe.name.clone(), "1.0"), recipe.clone());
  }
  registry
}

pub fn dep(name: &str) -> Requirement {
  Requirement::new(name, "1.0")
}

/// Isolated cache directory per test.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  pub fn cache_dir(&self) -> &Path {
    self.temp.path()
  }

  pub fn options(&self) -> BuildOptions {
    BuildOptions::default().with_cache_location(self.cache_dir()).with_parallelism(4)
  }

  pub fn session(&self, recipes: &[Arc<FakeRecipe>]) -> Session {
    Session::new(registry_of(recipes))
  }

  /// Number of committed entries on disk.
  pub fn committed_entries(&self) -> usize {
    match std::fs::read_dir(self.cache_dir().join("entries")) {
      Ok(entries) => entries.count(),
      Err(_) => 0,
    }
  }
}

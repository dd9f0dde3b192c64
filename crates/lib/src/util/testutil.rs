//! Test utilities for pkgweave-lib.
//!
//! `ScriptedRecipe` is an in-memory recipe whose phases write a small fake
//! package and record every call, so tests can assert on what ran.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use crate::package::{OptionSet, OptionValue, PackageRef, Requirement};
use crate::recipe::{BuiltArtifacts, ExportInfo, Phase, PhaseContext, PhaseResult, Recipe, RecipeRegistry};

pub struct ScriptedRecipe {
  name: String,
  requirements: Vec<Requirement>,
  defaults: OptionSet,
  choices: BTreeMap<String, Vec<String>>,
  content: String,
  fail_at: Option<Phase>,
  delay: Option<Duration>,
  log: Mutex<Vec<Phase>>,
}

impl ScriptedRecipe {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      requirements: Vec::new(),
      defaults: OptionSet::new(),
      choices: BTreeMap::new(),
      content: format!("recipe:{}", name),
      fail_at: None,
      delay: None,
      log: Mutex::new(Vec::new()),
    }
  }

  pub fn requires(mut self, req: Requirement) -> Self {
    self.requirements.push(req);
    self
  }

  pub fn option(mut self, name: &str, value: impl Into<OptionValue>) -> Self {
    self.defaults.insert(name.to_string(), value.into());
    self
  }

  pub fn choices(mut self, name: &str, allowed: &[&str]) -> Self {
    self
      .choices
      .insert(name.to_string(), allowed.iter().map(|s| s.to_string()).collect());
    self
  }

  pub fn content(mut self, id: &str) -> Self {
    self.content = id.to_string();
    self
  }

  pub fn fail_at(mut self, phase: Phase) -> Self {
    self.fail_at = Some(phase);
    self
  }

  pub fn delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn arc(self) -> Arc<Self> {
    Arc::new(self)
  }

  /// Phases run so far, in call order.
  pub fn phase_log(&self) -> Vec<Phase> {
    self.log.lock().unwrap().clone()
  }
}

#[async_trait]
impl Recipe for ScriptedRecipe {
  fn declared_requirements(&self) -> Vec<Requirement> {
    self.requirements.clone()
  }

  fn default_options(&self) -> OptionSet {
    self.defaults.clone()
  }

  fn option_choices(&self) -> BTreeMap<String, Vec<String>> {
    self.choices.clone()
  }

  fn content_id(&self) -> String {
    self.content.clone()
  }

  async fn run_phase(&self, phase: Phase, ctx: &PhaseContext) -> anyhow::Result<PhaseResult> {
    self.log.lock().unwrap().push(phase);

    if let Some(delay) = self.delay {
      tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = ctx.cancel.cancelled() => {}
      }
    }

    if self.fail_at == Some(phase) {
      bail!("{} failed during {}", self.name, phase);
    }

    if phase != Phase::Package {
      return Ok(PhaseResult::default());
    }

    let lib = PathBuf::from("lib").join(format!("lib{}.a", self.name));
    let header = PathBuf::from("include").join(format!("{}.h", self.name));
    tokio::fs::create_dir_all(ctx.package_dir.join("lib")).await?;
    tokio::fs::create_dir_all(ctx.package_dir.join("include")).await?;
    tokio::fs::write(ctx.package_dir.join(&lib), format!("{}:{}", self.name, ctx.fingerprint)).await?;
    tokio::fs::write(ctx.package_dir.join(&header), "#pragma once\n").await?;

    Ok(PhaseResult::default().with_artifact(lib).with_artifact(header))
  }

  fn export_info(&self, _built: &BuiltArtifacts) -> ExportInfo {
    let mut properties = BTreeMap::new();
    properties.insert("cmake_target_name".to_string(), format!("{0}::{0}", self.name));
    ExportInfo {
      libraries: vec![self.name.clone()],
      include_dirs: vec![PathBuf::from("include")],
      properties,
    }
  }
}

/// Register every recipe at version 1.0.
pub fn registry(recipes: &[Arc<ScriptedRecipe>]) -> RecipeRegistry {
  let mut registry = RecipeRegistry::new();
  for recipe in recipes {
    registry.register(PackageRef::new(recipe.name.clone(), "1.0"), recipe.clone());
  }
  registry
}

/// Requirement on `name/1.0`.
pub fn req(name: &str) -> Requirement {
  Requirement::new(name, "1.0")
}

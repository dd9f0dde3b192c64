//! Root API.
//!
//! A [`Session`] owns a recipe source, one package cache per cache location
//! and a cancellation token. It exposes the three root operations:
//! [`plan`](Session::plan), [`build`](Session::build) and
//! [`export`](Session::export).

mod types;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::{CacheError, GcStats, PackageCache, RetentionPolicy};
use crate::execute::{self, ExecuteConfig};
use crate::export::ExportMetadata;
use crate::fingerprint;
use crate::graph::Graph;
use crate::options;
use crate::package::Requirement;
use crate::recipe::RecipeSource;

pub use types::{
  BuildError, BuildOptions, ExportedGraph, PlanError, PlanReport, PlannedPackage, default_cache_location,
};

pub struct Session {
  source: Arc<dyn RecipeSource>,
  caches: Mutex<HashMap<PathBuf, Arc<PackageCache>>>,
  exports: Mutex<BTreeMap<String, ExportMetadata>>,
  cancel: CancellationToken,
}

impl Session {
  pub fn new(source: impl RecipeSource + 'static) -> Self {
    Self::with_source(Arc::new(source))
  }

  pub fn with_source(source: Arc<dyn RecipeSource>) -> Self {
    Self {
      source,
      caches: Mutex::new(HashMap::new()),
      exports: Mutex::new(BTreeMap::new()),
      cancel: CancellationToken::new(),
    }
  }

  /// Resolve `root` without running anything.
  pub fn plan(&self, root: &[Requirement]) -> Result<PlanReport, PlanError> {
    let graph = self.prepare(root)?;
    let packages = graph
      .nodes()
      .filter_map(|(id, node)| {
        Some(PlannedPackage {
          package: node.package.clone(),
          options: node.options.clone(),
          fingerprint: node.fingerprint?,
          dependencies: graph
            .dependencies(id)
            .iter()
            .map(|dep| graph.node(*dep).name().to_string())
            .collect(),
        })
      })
      .collect();
    Ok(PlanReport { packages })
  }

  /// Resolve and build `root`, reusing cached packages.
  ///
  /// Planning errors are returned before any phase runs. On success the
  /// exported metadata also becomes available through [`export`](Self::export).
  pub async fn build(&self, root: &[Requirement], options: &BuildOptions) -> Result<ExportedGraph, BuildError> {
    let mut graph = self.prepare(root)?;
    let cache = self.cache_for(&options.cache_location)?;
    let config = ExecuteConfig {
      parallelism: options.effective_parallelism(),
    };

    info!(packages = graph.len(), cache = ?options.cache_location, "starting build");
    let mut report = execute::execute(&mut graph, cache, &config, &self.cancel).await?;
    if !report.is_success() {
      return Err(BuildError::Failed(Box::new(report)));
    }

    let order: Vec<String> = graph.nodes().map(|(_, node)| node.name().to_string()).collect();
    let cache_hits = report.cache_hits();
    let built = report.built();
    let exports: BTreeMap<String, ExportMetadata> = std::mem::take(&mut report.realized)
      .into_iter()
      .map(|(name, realized)| (name, realized.export))
      .collect();

    *self.exports.lock().unwrap_or_else(PoisonError::into_inner) = exports.clone();
    info!(built, cache_hits, "build complete");

    Ok(ExportedGraph {
      order,
      exports,
      cache_hits,
      built,
    })
  }

  /// Export metadata of `name` from the last successful build.
  pub fn export(&self, name: &str) -> Option<ExportMetadata> {
    self
      .exports
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(name)
      .cloned()
  }

  /// Stop admitting packages in the current and any later build.
  pub fn cancel(&self) {
    info!("session cancelled");
    self.cancel.cancel();
  }

  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  /// Evict cache entries at `options.cache_location` according to `policy`.
  pub fn collect_garbage(&self, options: &BuildOptions, policy: &dyn RetentionPolicy) -> Result<GcStats, CacheError> {
    self.cache_for(&options.cache_location)?.collect_garbage(policy)
  }

  fn prepare(&self, root: &[Requirement]) -> Result<Graph, PlanError> {
    let mut graph = Graph::build(root, self.source.as_ref())?;
    options::resolve(&mut graph)?;
    fingerprint::assign_all(&mut graph)?;
    debug!(packages = graph.len(), "planned graph");
    Ok(graph)
  }

  fn cache_for(&self, location: &Path) -> Result<Arc<PackageCache>, CacheError> {
    let mut caches = self.caches.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(cache) = caches.get(location) {
      return Ok(cache.clone());
    }
    let cache = Arc::new(PackageCache::open(location)?);
    caches.insert(location.to_path_buf(), cache.clone());
    Ok(cache)
  }
}

impl std::fmt::Debug for Session {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("cancelled", &self.cancel.is_cancelled())
      .finish_non_exhaustive()
  }
}

//! Lifecycle executor.
//!
//! Drives every fingerprinted node of a [`Graph`] to the exported state:
//! - ready-queue scheduling, a node is released once all its dependencies
//!   are exported
//! - bounded parallelism over a tokio `JoinSet`
//! - cache hits short-circuit every phase, misses run the phases in order
//!   under a cache reservation
//! - failure and cancellation stop admission and are accounted per node

pub mod types;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{Acquired, BuildToken, CacheEntry, CacheError, NewEntry, PackageCache};
use crate::export::{ExportMetadata, export_metadata};
use crate::fingerprint::Fingerprint;
use crate::graph::{Graph, LifecycleState, NodeId};
use crate::package::{OptionSet, PackageRef};
use crate::recipe::{BuiltArtifacts, Phase, PhaseContext, Recipe};

pub use types::{ExecuteConfig, ExecuteError, ExecutionReport, FailedDependency, LifecycleFailure, RealizedNode};

/// Everything a worker needs to realize one node, detached from the graph.
struct NodeJob {
  id: NodeId,
  package: PackageRef,
  fingerprint: Fingerprint,
  options: OptionSet,
  recipe: Arc<dyn Recipe>,
  dependencies: Vec<(String, ExportMetadata)>,
}

enum NodeOutcome {
  Exported { entry: Arc<CacheEntry>, export: ExportMetadata, cached: bool },
  /// Stopped between phases after cancellation.
  Cancelled,
}

/// What a worker hands back: the outcome and the furthest state reached.
struct NodeRun {
  id: NodeId,
  reached: LifecycleState,
  result: Result<NodeOutcome, ExecuteError>,
}

/// Execute every node in `graph`.
///
/// Nodes must be fingerprinted. Node states are updated in place as work
/// completes. A failed node never stops in-flight siblings, but no new node
/// is admitted after the first failure or once `cancel` fires.
pub async fn execute(
  graph: &mut Graph,
  cache: Arc<PackageCache>,
  config: &ExecuteConfig,
  cancel: &CancellationToken,
) -> Result<ExecutionReport, ExecuteError> {
  for (_, node) in graph.nodes() {
    if node.fingerprint.is_none() {
      return Err(ExecuteError::NotFingerprinted {
        package: node.package.to_string(),
      });
    }
  }

  let parallelism = config.parallelism.max(1);
  info!(nodes = graph.len(), parallelism, "starting lifecycle execution");

  let mut pending: HashMap<NodeId, usize> = HashMap::new();
  let mut ready: VecDeque<NodeId> = VecDeque::new();
  for &id in graph.topological_order() {
    let deps = graph.dependencies(id).len();
    if deps == 0 {
      ready.push_back(id);
    } else {
      pending.insert(id, deps);
    }
  }

  let mut report = ExecutionReport::default();
  let mut exports: HashMap<NodeId, ExportMetadata> = HashMap::new();
  let mut tasks: JoinSet<NodeRun> = JoinSet::new();
  let mut task_nodes = HashMap::new();
  let mut admitting = true;

  loop {
    while admitting && tasks.len() < parallelism {
      if cancel.is_cancelled() {
        info!("cancellation requested, no further nodes will be admitted");
        admitting = false;
        break;
      }
      let Some(id) = ready.pop_front() else {
        break;
      };

      let job = job_for(graph, id, &exports)?;
      debug!(package = %job.package, fingerprint = %job.fingerprint.short(), "admitting node");
      let handle = tasks.spawn(realize_node(job, cache.clone(), cancel.clone()));
      task_nodes.insert(handle.id(), id);
    }

    let Some(joined) = tasks.join_next_with_id().await else {
      break;
    };

    let run = match joined {
      Ok((task_id, run)) => {
        task_nodes.remove(&task_id);
        run
      }
      Err(e) => {
        let Some(id) = task_nodes.remove(&e.id()) else {
          error!(error = %e, "unknown task failed");
          continue;
        };
        let name = graph.node(id).name().to_string();
        error!(package = %name, error = %e, "node task panicked");
        report.failed.insert(
          name.clone(),
          ExecuteError::TaskPanicked {
            package: name,
            message: e.to_string(),
          },
        );
        admitting = false;
        continue;
      }
    };

    let node = graph.node_mut(run.id);
    node.state = run.reached;
    let name = node.name().to_string();

    match run.result {
      Ok(NodeOutcome::Exported { entry, export, cached }) => {
        node.state = LifecycleState::Exported;
        debug!(package = %name, cached, "node exported");
        report.realized.insert(
          name,
          RealizedNode {
            package: entry.package.clone(),
            fingerprint: entry.fingerprint,
            cached,
            entry,
            export: export.clone(),
          },
        );
        exports.insert(run.id, export);

        for dependent in graph.dependents(run.id) {
          if let Some(count) = pending.get_mut(&dependent) {
            *count -= 1;
            if *count == 0 {
              pending.remove(&dependent);
              ready.push_back(dependent);
            }
          }
        }
      }
      Ok(NodeOutcome::Cancelled) => {
        debug!(package = %name, "node stopped after cancellation");
        report.cancelled.insert(name);
      }
      Err(e) => {
        error!(package = %name, error = %e, "node failed");
        report.failed.insert(name, e);
        admitting = false;
      }
    }
  }

  account_unfinished(graph, &mut report);

  info!(
    realized = report.realized.len(),
    cache_hits = report.cache_hits(),
    failed = report.failed.len(),
    skipped = report.skipped.len(),
    cancelled = report.cancelled.len(),
    "lifecycle execution complete"
  );

  Ok(report)
}

fn job_for(graph: &Graph, id: NodeId, exports: &HashMap<NodeId, ExportMetadata>) -> Result<NodeJob, ExecuteError> {
  let node = graph.node(id);
  let fingerprint = node.fingerprint.ok_or_else(|| ExecuteError::NotFingerprinted {
    package: node.package.to_string(),
  })?;

  let dependencies = node
    .dependencies
    .iter()
    .map(|dep| {
      let meta = exports.get(dep).cloned().unwrap_or_default();
      (graph.node(*dep).name().to_string(), meta)
    })
    .collect();

  Ok(NodeJob {
    id,
    package: node.package.clone(),
    fingerprint,
    options: node.options.clone(),
    recipe: node.recipe.clone(),
    dependencies,
  })
}

/// Classify every node that neither finished nor failed.
///
/// Nodes below a failure are skipped and name the original failed package.
/// The rest were cut off by cancellation or by the stop after a failure.
fn account_unfinished(graph: &Graph, report: &mut ExecutionReport) {
  let mut failed_by: HashMap<NodeId, String> = HashMap::new();

  for &id in graph.topological_order() {
    let name = graph.node(id).name();
    if report.failed.contains_key(name) {
      failed_by.insert(id, name.to_string());
      continue;
    }
    if report.realized.contains_key(name) || report.cancelled.contains(name) {
      continue;
    }

    let cause = graph.dependencies(id).iter().find_map(|dep| failed_by.get(dep).cloned());
    match cause {
      Some(package) => {
        warn!(package = %name, failed_dep = %package, "skipping node due to failed dependency");
        failed_by.insert(id, package.clone());
        report.skipped.insert(name.to_string(), FailedDependency { package });
      }
      None => {
        report.cancelled.insert(name.to_string());
      }
    }
  }
}

/// Stage directories a build writes into.
struct Workspace {
  source_dir: PathBuf,
  build_dir: PathBuf,
  package_dir: PathBuf,
}

async fn prepare_workspace(token: &BuildToken) -> Result<Workspace, CacheError> {
  let staging = token.staging_dir();
  let workspace = Workspace {
    source_dir: staging.join("source"),
    build_dir: staging.join("build"),
    package_dir: token.package_dir(),
  };
  for dir in [&workspace.source_dir, &workspace.build_dir, &workspace.package_dir] {
    tokio::fs::create_dir_all(dir).await.map_err(|e| CacheError::io(dir, e))?;
  }
  Ok(workspace)
}

async fn realize_node(job: NodeJob, cache: Arc<PackageCache>, cancel: CancellationToken) -> NodeRun {
  let mut reached = LifecycleState::Fingerprinted;
  let result = run_lifecycle(&job, &cache, &cancel, &mut reached).await;
  NodeRun {
    id: job.id,
    reached,
    result,
  }
}

async fn run_lifecycle(
  job: &NodeJob,
  cache: &PackageCache,
  cancel: &CancellationToken,
  reached: &mut LifecycleState,
) -> Result<NodeOutcome, ExecuteError> {
  let token = match cache.acquire(&job.fingerprint).await? {
    Acquired::Hit(entry) => {
      info!(package = %job.package, fingerprint = %job.fingerprint.short(), "cache hit");
      *reached = LifecycleState::Packaged;
      let export = export_metadata(&entry, &job.dependencies);
      return Ok(NodeOutcome::Exported {
        entry,
        export,
        cached: true,
      });
    }
    Acquired::Build(token) => token,
  };

  let workspace = match prepare_workspace(&token).await {
    Ok(workspace) => workspace,
    Err(e) => {
      cache.abort(token).await;
      return Err(e.into());
    }
  };

  let ctx = PhaseContext {
    package: job.package.clone(),
    fingerprint: job.fingerprint,
    options: job.options.clone(),
    dependencies: job.dependencies.clone(),
    source_dir: workspace.source_dir,
    build_dir: workspace.build_dir,
    package_dir: workspace.package_dir,
    cancel: cancel.clone(),
  };

  let mut artifacts = Vec::new();
  let mut phases = Vec::with_capacity(Phase::ALL.len());

  for phase in Phase::ALL {
    if cancel.is_cancelled() {
      debug!(package = %job.package, phase = %phase, "cancelled before phase");
      cache.abort(token).await;
      return Ok(NodeOutcome::Cancelled);
    }

    debug!(package = %job.package, phase = %phase, "running phase");
    match job.recipe.run_phase(phase, &ctx).await {
      Ok(result) => {
        artifacts.extend(result.artifacts);
        phases.push(phase);
        *reached = LifecycleState::after(phase);
      }
      Err(e) => {
        error!(package = %job.package, phase = %phase, error = %e, "phase failed");
        cache.abort(token).await;
        return Err(
          LifecycleFailure {
            node: job.package.clone(),
            phase,
            cause: format!("{:#}", e),
          }
          .into(),
        );
      }
    }
  }

  let built = BuiltArtifacts {
    package_dir: ctx.package_dir.clone(),
    artifacts: artifacts.clone(),
  };
  let draft = NewEntry {
    package: job.package.clone(),
    options: job.options.clone(),
    phases,
    artifacts,
    export: job.recipe.export_info(&built),
  };

  let entry = cache.commit(token, draft).await?;
  let export = export_metadata(&entry, &job.dependencies);
  Ok(NodeOutcome::Exported {
    entry,
    export,
    cached: false,
  })
}

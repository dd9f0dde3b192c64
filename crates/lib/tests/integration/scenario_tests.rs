use pkgweave_lib::execute::ExecuteError;
use pkgweave_lib::graph::GraphError;
use pkgweave_lib::options::OptionError;
use pkgweave_lib::recipe::Phase;
use pkgweave_lib::{BuildError, OptionValue, PlanError};

use super::common::{FakeRecipe, TestEnv, dep};

#[test]
fn override_beats_default_option() {
  let env = TestEnv::new();
  let z = FakeRecipe::new("Z").default_option("flag", true).shared();
  let x = FakeRecipe::new("X")
    .needs(dep("Z").with_option("flag", false).overriding())
    .shared();
  let y = FakeRecipe::new("Y").needs(dep("Z").with_option("flag", true)).shared();
  let session = env.session(&[x, y, z]);

  let plan = session.plan(&[dep("X"), dep("Y")]).unwrap();
  let z = plan.get("Z").unwrap();
  assert_eq!(z.options.get("flag"), Some(&OptionValue::Bool(false)));
  assert_eq!(plan.len(), 3);
}

#[test]
fn conflicting_overrides_are_reported() {
  let env = TestEnv::new();
  let z = FakeRecipe::new("Z").default_option("flag", true).shared();
  let x = FakeRecipe::new("X")
    .needs(dep("Z").with_option("flag", false).overriding())
    .shared();
  let y = FakeRecipe::new("Y")
    .needs(dep("Z").with_option("flag", true).overriding())
    .shared();
  let session = env.session(&[x, y, z]);

  let err = session.plan(&[dep("X"), dep("Y")]).unwrap_err();
  assert_eq!(
    err,
    PlanError::Options(OptionError::OptionConflict {
      name: "Z".to_string(),
      option: "flag".to_string(),
      conflicting_sources: vec!["X".to_string(), "Y".to_string()],
    })
  );
}

#[tokio::test]
async fn cycle_fails_before_any_phase() {
  let env = TestEnv::new();
  let a = FakeRecipe::new("A").needs(dep("B")).shared();
  let b = FakeRecipe::new("B").needs(dep("C")).shared();
  let c = FakeRecipe::new("C").needs(dep("A")).shared();
  let session = env.session(&[a.clone(), b.clone(), c.clone()]);

  let err = session.build(&[dep("A")], &env.options()).await.unwrap_err();
  match err {
    BuildError::Plan(PlanError::Graph(GraphError::CyclicDependency { path })) => {
      assert_eq!(path, vec!["A", "B", "C", "A"]);
    }
    other => panic!("expected cycle, got {other:?}"),
  }
  assert_eq!(a.phase_calls() + b.phase_calls() + c.phase_calls(), 0);
}

#[tokio::test]
async fn failed_build_skips_consumer_and_caches_nothing() {
  let env = TestEnv::new();
  let a = FakeRecipe::new("A").failing_at(Phase::Build).shared();
  let b = FakeRecipe::new("B").needs(dep("A")).shared();
  let session = env.session(&[a.clone(), b.clone()]);

  let err = session.build(&[dep("B")], &env.options()).await.unwrap_err();
  let BuildError::Failed(report) = err else {
    panic!("expected failed build");
  };

  match &report.failed["A"] {
    ExecuteError::Lifecycle(failure) => {
      assert_eq!(failure.phase, Phase::Build);
      assert!(failure.cause.contains("exploded"));
    }
    other => panic!("unexpected failure {other:?}"),
  }
  assert_eq!(report.skipped["B"].package, "A");
  assert_eq!(b.phase_calls(), 0);
  assert_eq!(a.phase_calls(), 3);
  assert_eq!(env.committed_entries(), 0);
  assert!(session.export("A").is_none());
}

#[tokio::test]
async fn diamond_failure_reports_every_casualty() {
  let env = TestEnv::new();
  let base = FakeRecipe::new("base").failing_at(Phase::Configure).shared();
  let left = FakeRecipe::new("left").needs(dep("base")).shared();
  let right = FakeRecipe::new("right").needs(dep("base")).shared();
  let top = FakeRecipe::new("top").needs(dep("left")).needs(dep("right")).shared();
  let session = env.session(&[base, left, right, top]);

  let Err(BuildError::Failed(report)) = session.build(&[dep("top")], &env.options()).await else {
    panic!("expected failed build");
  };
  assert_eq!(report.failed.len(), 1);
  for name in ["left", "right", "top"] {
    assert_eq!(report.skipped[name].package, "base", "{name}");
  }
  assert_eq!(report.total(), 4);
}

#[test]
fn plain_requirements_on_different_versions_conflict() {
  let env = TestEnv::new();
  let z = FakeRecipe::new("Z").shared();
  let x = FakeRecipe::new("X").needs(dep("Z")).shared();
  let y = FakeRecipe::new("Y")
    .needs(pkgweave_lib::Requirement::new("Z", "2.0"))
    .shared();
  let session = env.session(&[x, y, z]);

  let err = session.plan(&[dep("X"), dep("Y")]).unwrap_err();
  assert!(matches!(err, PlanError::Graph(GraphError::VersionConflict { ref name, .. }) if name == "Z"));
}

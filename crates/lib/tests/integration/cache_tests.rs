use std::sync::Arc;

use pkgweave_lib::cache::{MaxEntries, PackageCache};
use pkgweave_lib::recipe::Phase;
use pkgweave_lib::session::BuildOptions;
use tracing_test::traced_test;

use super::common::{FakeRecipe, TestEnv, dep};

#[tokio::test]
async fn rebuild_is_a_cache_hit_with_zero_phases() {
  let env = TestEnv::new();
  let zlib = FakeRecipe::new("zlib").shared();
  let png = FakeRecipe::new("png").needs(dep("zlib")).shared();

  let first = env.session(&[zlib.clone(), png.clone()]);
  let exported = first.build(&[dep("png")], &env.options()).await.unwrap();
  assert_eq!(exported.built, 2);
  let calls = zlib.phase_calls() + png.phase_calls();
  assert_eq!(calls, 2 * Phase::ALL.len());

  // A fresh session sees the entries on disk
  let second = env.session(&[zlib.clone(), png.clone()]);
  let exported = second.build(&[dep("png")], &env.options()).await.unwrap();
  assert_eq!(exported.cache_hits, 2);
  assert_eq!(exported.built, 0);
  assert_eq!(zlib.phase_calls() + png.phase_calls(), calls);
  assert_eq!(second.export("png"), first.export("png"));
}

#[tokio::test]
async fn option_change_rebuilds_node_and_ancestors_only() {
  let env = TestEnv::new();
  let build = |flag: bool| {
    let zlib = FakeRecipe::new("zlib").shared();
    let png = FakeRecipe::new("png")
      .needs(dep("zlib"))
      .default_option("shared", flag)
      .shared();
    let app = FakeRecipe::new("app").needs(dep("png")).shared();
    (zlib, png, app)
  };

  let (zlib, png, app) = build(true);
  env
    .session(&[zlib, png, app])
    .build(&[dep("app")], &env.options())
    .await
    .unwrap();

  let (zlib, png, app) = build(false);
  let exported = env
    .session(&[zlib.clone(), png.clone(), app.clone()])
    .build(&[dep("app")], &env.options())
    .await
    .unwrap();

  assert_eq!(zlib.phase_calls(), 0);
  assert_eq!(png.phase_calls(), Phase::ALL.len());
  assert_eq!(app.phase_calls(), Phase::ALL.len());
  assert_eq!(exported.cache_hits, 1);
  assert_eq!(env.committed_entries(), 5);
}

#[tokio::test]
#[traced_test]
async fn corrupted_entry_is_rebuilt() {
  let env = TestEnv::new();
  let zlib = FakeRecipe::new("zlib").shared();

  let session = env.session(&[zlib.clone()]);
  session.build(&[dep("zlib")], &env.options()).await.unwrap();
  let fingerprint = session.plan(&[dep("zlib")]).unwrap().get("zlib").unwrap().fingerprint;

  let lib = env
    .cache_dir()
    .join("entries")
    .join(fingerprint.to_hex())
    .join("package/lib/libzlib.a");
  std::fs::write(&lib, "garbage").unwrap();

  let session = env.session(&[zlib.clone()]);
  let exported = session.build(&[dep("zlib")], &env.options()).await.unwrap();
  assert_eq!(exported.built, 1);
  assert_eq!(zlib.phase_calls(), 2 * Phase::ALL.len());
  assert_ne!(std::fs::read_to_string(&lib).unwrap(), "garbage");
  assert!(logs_contain("cache entry corrupted"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_share_one_build() {
  let env = TestEnv::new();
  let zlib = FakeRecipe::new("zlib").slow(std::time::Duration::from_millis(20)).shared();
  let cache = Arc::new(PackageCache::open(env.cache_dir()).unwrap());

  let mut tasks = Vec::new();
  for _ in 0..4 {
    let cache = cache.clone();
    let registry = super::common::registry_of(&[zlib.clone()]);
    tasks.push(tokio::spawn(async move {
      let mut graph = pkgweave_lib::graph::Graph::build(&[dep("zlib")], &registry).unwrap();
      pkgweave_lib::options::resolve(&mut graph).unwrap();
      pkgweave_lib::fingerprint::assign_all(&mut graph).unwrap();
      pkgweave_lib::execute::execute(
        &mut graph,
        cache,
        &pkgweave_lib::execute::ExecuteConfig { parallelism: 1 },
        &tokio_util::sync::CancellationToken::new(),
      )
      .await
      .unwrap()
    }));
  }

  let mut hits = 0;
  for task in tasks {
    let report = task.await.unwrap();
    assert!(report.is_success());
    hits += report.cache_hits();
  }

  assert_eq!(zlib.phase_calls(), Phase::ALL.len());
  assert_eq!(hits, 3);
}

#[tokio::test]
async fn retention_keeps_newest_entries() {
  let env = TestEnv::new();
  let recipes = [FakeRecipe::new("a").shared(), FakeRecipe::new("b").shared()];
  let session = env.session(&recipes);
  session.build(&[dep("a"), dep("b")], &env.options()).await.unwrap();
  assert_eq!(env.committed_entries(), 2);

  let stats = session.collect_garbage(&env.options(), &MaxEntries(1)).unwrap();
  assert_eq!(stats.entries_scanned, 2);
  assert_eq!(stats.entries_evicted, 1);
  assert_eq!(env.committed_entries(), 1);
}

#[tokio::test]
async fn separate_cache_locations_are_isolated() {
  let env = TestEnv::new();
  let other = TestEnv::new();
  let zlib = FakeRecipe::new("zlib").shared();
  let session = env.session(&[zlib.clone()]);

  session.build(&[dep("zlib")], &env.options()).await.unwrap();
  let options = BuildOptions::default().with_cache_location(other.cache_dir());
  let exported = session.build(&[dep("zlib")], &options).await.unwrap();

  assert_eq!(exported.built, 1);
  assert_eq!(zlib.phase_calls(), 2 * Phase::ALL.len());
}

use std::collections::BTreeSet;
use std::path::PathBuf;

use super::common::{FakeRecipe, TestEnv, dep};

#[tokio::test]
async fn diamond_exports_transitive_includes_and_direct_links() {
  let env = TestEnv::new();
  let zlib = FakeRecipe::new("zlib").shared();
  let png = FakeRecipe::new("png").needs(dep("zlib")).shared();
  let freetype = FakeRecipe::new("freetype").needs(dep("zlib")).shared();
  let app = FakeRecipe::new("app").needs(dep("png")).needs(dep("freetype")).shared();
  let session = env.session(&[zlib.clone(), png, freetype, app]);

  let exported = session.build(&[dep("app")], &env.options()).await.unwrap();
  assert_eq!(exported.order.first().map(String::as_str), Some("zlib"));
  assert_eq!(exported.order.last().map(String::as_str), Some("app"));
  // Shared dependency built once
  assert_eq!(zlib.phase_calls(), 4);

  let app = session.export("app").unwrap();
  assert_eq!(app.libraries, vec!["app"]);
  assert_eq!(app.link_requires, vec!["png", "freetype"]);
  assert_eq!(app.property("cmake_file_name"), Some("app"));

  let packages: BTreeSet<String> = app
    .include_dirs
    .iter()
    .map(|dir| {
      let package_dir = dir.parent().unwrap();
      let entry_dir = package_dir.parent().unwrap();
      let record = std::fs::read_to_string(entry_dir.join("entry.json")).unwrap();
      let value: serde_json::Value = serde_json::from_str(&record).unwrap();
      value["entry"]["package"]["name"].as_str().unwrap().to_string()
    })
    .collect();
  assert_eq!(
    packages,
    BTreeSet::from(["app", "freetype", "png", "zlib"].map(String::from))
  );
  assert!(app.include_dirs.iter().all(|dir| dir.ends_with(PathBuf::from("include"))));
}

#[tokio::test]
async fn export_of_unknown_package_is_none() {
  let env = TestEnv::new();
  let session = env.session(&[FakeRecipe::new("zlib").shared()]);
  session.build(&[dep("zlib")], &env.options()).await.unwrap();

  assert!(session.export("zlib").is_some());
  assert!(session.export("openssl").is_none());
}

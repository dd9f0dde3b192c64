use std::time::Duration;

use pkgweave_lib::BuildError;

use super::common::{FakeRecipe, TestEnv, dep};

#[tokio::test]
async fn cancel_stops_admission_and_leaves_no_entries() {
  let env = TestEnv::new();
  let slow = FakeRecipe::new("slow").slow(Duration::from_secs(30)).shared();
  let next = FakeRecipe::new("next").needs(dep("slow")).shared();
  let session = env.session(&[slow.clone(), next.clone()]);

  let token = session.cancellation_token();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();
  });

  let started = std::time::Instant::now();
  let err = session.build(&[dep("next")], &env.options()).await.unwrap_err();
  assert!(started.elapsed() < Duration::from_secs(10));

  let BuildError::Failed(report) = err else {
    panic!("expected failed build");
  };
  assert!(report.cancelled.contains("slow"));
  assert!(report.cancelled.contains("next"));
  assert!(report.failed.is_empty());
  assert_eq!(next.phase_calls(), 0);
  assert_eq!(env.committed_entries(), 0);
}

#[tokio::test]
async fn cancelled_session_refuses_new_work() {
  let env = TestEnv::new();
  let zlib = FakeRecipe::new("zlib").shared();
  let session = env.session(&[zlib.clone()]);
  session.cancel();

  assert!(matches!(
    session.build(&[dep("zlib")], &env.options()).await,
    Err(BuildError::Failed(_))
  ));
  assert_eq!(zlib.phase_calls(), 0);
}

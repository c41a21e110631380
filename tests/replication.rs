//! End-to-end replication over real TCP: a leader serving streams and a
//! follower bootstrapping from snapshot plus oplog tail. Convergence is
//! asserted by polling with a generous bound, never by assuming
//! zero-latency delivery.

use skiffdb::{replication, resp, Database, FollowFailurePolicy, Options, Role, SkiffError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

const CONVERGENCE_BOUND: Duration = Duration::from_secs(5);

fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter("skiffdb=debug")
    .try_init();
}

fn args(parts: &[&str]) -> Vec<Vec<u8>> {
  parts.iter().map(|part| part.as_bytes().to_vec()).collect()
}

fn open_db(dir: &Path) -> Arc<Database> {
  let mut options = Options::new(dir);
  // Exit would take the whole test harness down with a failed link.
  options.follow_failure = FollowFailurePolicy::Demote;
  let db = Arc::new(Database::open(options).expect("open database"));
  Arc::clone(&db).run();
  db
}

/// Starts the replication listener for `db` and returns its port.
async fn serve_replication(db: &Arc<Database>) -> (u16, watch::Sender<bool>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
  let port = listener.local_addr().expect("local addr").port();
  let (cancel_tx, cancel_rx) = watch::channel(false);
  let db = Arc::clone(db);
  tokio::spawn(async move {
    let _ = replication::serve(db, listener, cancel_rx).await;
  });
  (port, cancel_tx)
}

/// Polls GET until the reply matches, within the convergence bound.
async fn wait_for_value(db: &Database, key: &str, value: &str) {
  let expected = resp::bulk(value.as_bytes());
  let deadline = tokio::time::Instant::now() + CONVERGENCE_BOUND;
  loop {
    let outcome = db.exec(&args(&["GET", key])).expect("get");
    if outcome.output == expected {
      return;
    }
    if tokio::time::Instant::now() > deadline {
      panic!(
        "no convergence on {key}: got {:?}",
        String::from_utf8_lossy(&outcome.output)
      );
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
}

#[tokio::test]
async fn follower_converges_with_leader() {
  init_tracing();
  let leader_dir = tempfile::tempdir().expect("tempdir");
  let follower_dir = tempfile::tempdir().expect("tempdir");

  let leader = open_db(leader_dir.path());
  let (port, _serve_cancel) = serve_replication(&leader).await;

  // Writes that will arrive via the snapshot.
  leader.exec(&args(&["SET", "k1", "v1"])).expect("set k1");
  leader.exec(&args(&["SET", "k2", "v2"])).expect("set k2");

  let follower = open_db(follower_dir.path());
  follower.slave_of("127.0.0.1", port).await.expect("slaveof");
  assert!(!follower.is_writable());

  wait_for_value(&follower, "k1", "v1").await;
  wait_for_value(&follower, "k2", "v2").await;

  // A write accepted after the follower attached arrives via the tail.
  leader.exec(&args(&["SET", "k3", "v3"])).expect("set k3");
  wait_for_value(&follower, "k3", "v3").await;

  let status = follower.replication_status();
  assert_eq!(status.role, Role::Following);
  assert_eq!(
    status.leader.map(|node| node.port()),
    Some(port),
    "status must name the leader"
  );
  assert!(
    status.applied_offset.is_some(),
    "cursor must record replay progress"
  );
  assert_eq!(status.last_error, None);

  let leader_status = leader.replication_status();
  assert_eq!(leader_status.role, Role::Leader);
}

#[tokio::test]
async fn deletes_replicate_too() {
  init_tracing();
  let leader_dir = tempfile::tempdir().expect("tempdir");
  let follower_dir = tempfile::tempdir().expect("tempdir");

  let leader = open_db(leader_dir.path());
  let (port, _serve_cancel) = serve_replication(&leader).await;
  leader.exec(&args(&["SET", "doomed", "v"])).expect("set");

  let follower = open_db(follower_dir.path());
  follower.slave_of("127.0.0.1", port).await.expect("slaveof");
  wait_for_value(&follower, "doomed", "v").await;

  leader.exec(&args(&["DEL", "doomed"])).expect("del");
  let deadline = tokio::time::Instant::now() + CONVERGENCE_BOUND;
  loop {
    let outcome = follower.exec(&args(&["GET", "doomed"])).expect("get");
    if outcome.output == resp::null() {
      break;
    }
    if tokio::time::Instant::now() > deadline {
      panic!("delete never replicated");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
}

#[tokio::test]
async fn following_gates_external_writes() {
  init_tracing();
  let leader_dir = tempfile::tempdir().expect("tempdir");
  let follower_dir = tempfile::tempdir().expect("tempdir");

  let leader = open_db(leader_dir.path());
  let (port, _serve_cancel) = serve_replication(&leader).await;

  let follower = open_db(follower_dir.path());
  follower.slave_of("127.0.0.1", port).await.expect("slaveof");

  // External writes bounce; reads and the internal replay path still work.
  assert!(matches!(
    follower.exec(&args(&["SET", "local", "v"])),
    Err(SkiffError::NodeReadOnly)
  ));
  follower.exec(&args(&["GET", "anything"])).expect("reads pass");
  follower.iexec(&args(&["SET", "local", "v"])).expect("iexec passes");

  // Re-targeting while following is rejected until an explicit unfollow.
  assert!(matches!(
    follower.slave_of("127.0.0.1", port).await,
    Err(SkiffError::AlreadyFollowing(_))
  ));

  // SLAVEOF NO ONE surfaces the unfollow action for the front-end to act on.
  let outcome = follower
    .exec(&args(&["SLAVEOF", "NO", "ONE"]))
    .expect("slaveof no one");
  assert_eq!(outcome.action, skiffdb::Action::Unfollow);
  follower.unfollow().expect("unfollow");

  assert!(follower.is_writable());
  follower
    .exec(&args(&["SET", "local", "again"]))
    .expect("writable after unfollow");
  assert_eq!(follower.replication_status().role, Role::Leader);
}

#[tokio::test]
async fn follower_can_be_retargeted_after_unfollow() {
  init_tracing();
  let first_dir = tempfile::tempdir().expect("tempdir");
  let second_dir = tempfile::tempdir().expect("tempdir");
  let follower_dir = tempfile::tempdir().expect("tempdir");

  let first = open_db(first_dir.path());
  let (first_port, _first_cancel) = serve_replication(&first).await;
  first.exec(&args(&["SET", "origin", "first"])).expect("set");

  let second = open_db(second_dir.path());
  let (second_port, _second_cancel) = serve_replication(&second).await;
  second.exec(&args(&["SET", "origin", "second"])).expect("set");

  let follower = open_db(follower_dir.path());
  follower
    .slave_of("127.0.0.1", first_port)
    .await
    .expect("follow first");
  wait_for_value(&follower, "origin", "first").await;

  follower.unfollow().expect("unfollow");
  follower
    .slave_of("127.0.0.1", second_port)
    .await
    .expect("follow second");
  wait_for_value(&follower, "origin", "second").await;
}

//! Database orchestration: write gating, oplog recording, role transitions.
//!
//! [`Database`] is the aggregate root. External commands come in through
//! [`Database::exec`], which gates writes by role and records them in the
//! oplog before they touch storage. Replayed commands come in through
//! [`Database::iexec`], which skips both: a follower must be able to
//! write, and a record that already lives in the leader's log must not be
//! logged again here.

mod node;

pub use node::Node;

use crate::error::{Result, SkiffError};
use crate::executor::{self, Command, Kind, Outcome};
use crate::oplog::OplogBus;
use crate::replication::{self, FollowCursor};
use crate::storage::{MemoryStorage, Storage};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const OPLOG_FILE_NAME: &str = "skiffdb.oplog";

/// What to do when the background follow task dies.
///
/// `Exit` crashes the process: an unsupervised follower with a broken link
/// cannot guarantee freshness. `Demote` is the softer alternative: log
/// loudly, then drop the following role and serve writes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FollowFailurePolicy {
  #[default]
  Exit,
  Demote,
}

#[derive(Debug, Clone)]
pub struct Options {
  /// Directory holding the oplog file and replication sidecar state.
  pub dir: PathBuf,
  /// Cadence of the background oplog flush.
  pub flush_interval: Duration,
  /// Bound on the initial leader connect in `slave_of`. Snapshot and oplog
  /// transfer are unbounded by design and rely on cancellation instead.
  pub connect_timeout: Duration,
  pub follow_failure: FollowFailurePolicy,
}

impl Options {
  pub fn new(dir: impl Into<PathBuf>) -> Options {
    Options {
      dir: dir.into(),
      flush_interval: Duration::from_millis(100),
      connect_timeout: Duration::from_secs(3),
      follow_failure: FollowFailurePolicy::Exit,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  Leader,
  Following,
}

/// Snapshot of the replication state for operators.
#[derive(Debug, Clone)]
pub struct ReplicationStatus {
  pub role: Role,
  pub leader: Option<Node>,
  /// Hex form of the last replayed record id, if any.
  pub applied_offset: Option<String>,
  pub last_error: Option<String>,
}

enum FollowSignal {
  Start,
  Stop,
  /// Sent by a follow task's wrapper when the task finishes on its own.
  /// Carries the attempt number so a report from an attempt that was
  /// already stopped cannot be mistaken for the current one.
  Ended { attempt: u64, result: Result<()> },
}

pub struct Database {
  options: Options,
  storage: Arc<dyn Storage>,
  oplog: Arc<OplogBus>,
  cursor: Arc<FollowCursor>,
  /// `Some` exactly while this node is a follower. The node itself is set
  /// by `slave_of`/`unfollow`; the replication task behind it is owned by
  /// the background task and controlled only through `signal_tx`.
  following: Mutex<Option<Node>>,
  signal_tx: mpsc::UnboundedSender<FollowSignal>,
  /// Taken once by `run()`.
  signal_rx: Mutex<Option<mpsc::UnboundedReceiver<FollowSignal>>>,
  shutdown_tx: watch::Sender<bool>,
}

impl Database {
  /// Opens a database backed by the bundled in-memory engine.
  pub fn open(options: Options) -> Result<Database> {
    Self::with_storage(options, Arc::new(MemoryStorage::new()))
  }

  /// Opens a database on a caller-provided storage engine.
  pub fn with_storage(options: Options, storage: Arc<dyn Storage>) -> Result<Database> {
    std::fs::create_dir_all(&options.dir)?;
    let oplog = Arc::new(OplogBus::open(options.dir.join(OPLOG_FILE_NAME))?);
    let cursor = Arc::new(FollowCursor::open(&options.dir)?);
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _) = watch::channel(false);

    Ok(Database {
      options,
      storage,
      oplog,
      cursor,
      following: Mutex::new(None),
      signal_tx,
      signal_rx: Mutex::new(Some(signal_rx)),
      shutdown_tx,
    })
  }

  /// Starts the background maintenance task (periodic oplog flush plus
  /// follow-task supervision). Must be called from within a tokio runtime;
  /// later calls are no-ops. Takes its own handle on the database, so call
  /// it as `Arc::clone(&db).run()`.
  pub fn run(self: Arc<Self>) {
    let maybe_signals = self.signal_rx.lock().take();
    if let Some(signals) = maybe_signals {
      tokio::spawn(self.background(signals));
    }
  }

  pub fn is_writable(&self) -> bool {
    self.following.lock().is_none()
  }

  /// External command path: classify, gate writes by role, log, execute.
  ///
  /// A write that fails to append never reaches storage; durability of
  /// the log takes precedence over the mutation.
  pub fn exec(&self, args: &[Vec<u8>]) -> Result<Outcome> {
    let Some(name) = args.first() else {
      return Err(SkiffError::Arity);
    };
    let command = Command::parse(name);
    if command.kind() == Kind::Write {
      if !self.is_writable() {
        return Err(SkiffError::NodeReadOnly);
      }
      self.oplog.append(args)?;
    }
    executor::exec(&command, self.storage.as_ref(), args)
  }

  /// Internal replay path: no write gate, no oplog append. Used for
  /// records received from a leader, which are already logged there.
  pub fn iexec(&self, args: &[Vec<u8>]) -> Result<Outcome> {
    let Some(name) = args.first() else {
      return Err(SkiffError::Arity);
    };
    let command = Command::parse(name);
    executor::exec(&command, self.storage.as_ref(), args)
  }

  /// Starts following `host:port`.
  ///
  /// Probes the leader with a bounded connect, records the node, and
  /// signals the background task; returns as soon as the signal is sent,
  /// long before the snapshot or oplog transfer completes. Re-targeting
  /// while already following is rejected; unfollow first.
  pub async fn slave_of(&self, host: &str, port: u16) -> Result<()> {
    let node = Node::new(host, port);
    if let Some(current) = self.following.lock().as_ref() {
      return Err(SkiffError::AlreadyFollowing(current.to_string()));
    }

    let address = node.address();
    let probe = tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(&address))
      .await
      .map_err(|_| SkiffError::NodeConnectFailed {
        address: address.clone(),
        reason: "connect timed out".to_string(),
      })?
      .map_err(|error| SkiffError::NodeConnectFailed {
        address: address.clone(),
        reason: error.to_string(),
      })?;
    drop(probe);

    {
      let mut following = self.following.lock();
      if let Some(current) = following.as_ref() {
        return Err(SkiffError::AlreadyFollowing(current.to_string()));
      }
      *following = Some(node.clone());
    }

    if let Err(error) = self.send_signal(FollowSignal::Start) {
      self.following.lock().take();
      return Err(error);
    }
    info!(%node, "slaveof accepted");
    Ok(())
  }

  /// Leaves the following role and resumes leader duty.
  pub fn unfollow(&self) -> Result<()> {
    let previous = self.following.lock().take();
    let Some(node) = previous else {
      return Err(SkiffError::NodeIsMaster);
    };
    self.send_signal(FollowSignal::Stop)?;
    info!(%node, "unfollowed");
    Ok(())
  }

  pub fn replication_status(&self) -> ReplicationStatus {
    let leader = self.following.lock().clone();
    ReplicationStatus {
      role: match leader {
        Some(_) => Role::Following,
        None => Role::Leader,
      },
      leader,
      applied_offset: self.cursor.applied_offset(),
      last_error: self.cursor.last_error(),
    }
  }

  /// Best-effort teardown: stop the background task, flush and close the
  /// oplog, close storage. Errors are aggregated, not fail-fast.
  pub fn close(&self) -> Result<()> {
    let _ = self.shutdown_tx.send(true);
    self.following.lock().take();

    let mut failures: Vec<String> = Vec::new();
    if let Err(error) = self.oplog.close() {
      failures.push(format!("oplog: {error}"));
    }
    if let Err(error) = self.storage.close() {
      failures.push(format!("storage: {error}"));
    }
    if failures.is_empty() {
      Ok(())
    } else {
      Err(SkiffError::Runtime(format!("close: {}", failures.join("; "))))
    }
  }

  pub(crate) fn dir(&self) -> &Path {
    &self.options.dir
  }

  pub(crate) fn storage_handle(&self) -> Arc<dyn Storage> {
    Arc::clone(&self.storage)
  }

  pub(crate) fn oplog_handle(&self) -> Arc<OplogBus> {
    Arc::clone(&self.oplog)
  }

  pub(crate) fn follow_cursor(&self) -> &FollowCursor {
    &self.cursor
  }

  fn following_node(&self) -> Option<Node> {
    self.following.lock().clone()
  }

  fn send_signal(&self, signal: FollowSignal) -> Result<()> {
    self
      .signal_tx
      .send(signal)
      .map_err(|_| SkiffError::Runtime("background task is not running".to_string()))
  }

  /// The per-database maintenance loop. Owns the active follow task: it is
  /// spawned here, cancelled here, and its failure policy is applied here.
  async fn background(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<FollowSignal>) {
    let mut ticker = tokio::time::interval(self.options.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown = self.shutdown_tx.subscribe();
    let mut attempts: u64 = 0;
    let mut active: Option<(u64, watch::Sender<bool>, tokio::task::JoinHandle<()>)> = None;

    loop {
      tokio::select! {
        _ = shutdown.changed() => {
          if let Some((_, cancel_tx, handle)) = active.take() {
            let _ = cancel_tx.send(true);
            let _ = handle.await;
          }
          return;
        }
        _ = ticker.tick() => {
          if let Err(err) = self.oplog.flush() {
            warn!(%err, "periodic oplog flush failed");
          }
        }
        signal = signals.recv() => match signal {
          Some(FollowSignal::Start) => {
            if active.is_some() {
              warn!("follow task already active, ignoring start signal");
              continue;
            }
            let Some(node) = self.following_node() else {
              continue;
            };
            attempts += 1;
            let attempt = attempts;
            let (cancel_tx, cancel_rx) = watch::channel(false);
            let db = Arc::clone(&self);
            let target = node.clone();
            let ended_tx = self.signal_tx.clone();
            let handle = tokio::spawn(async move {
              let result = replication::follow(db, target, cancel_rx).await;
              // A dead receiver means the loop itself is gone; nothing to report to.
              let _ = ended_tx.send(FollowSignal::Ended { attempt, result });
            });
            active = Some((attempt, cancel_tx, handle));
            info!(%node, attempt, "follow task started");
          }
          Some(FollowSignal::Stop) => {
            if let Some((_, cancel_tx, handle)) = active.take() {
              let _ = cancel_tx.send(true);
              let _ = handle.await;
              info!("follow task stopped");
            }
          }
          Some(FollowSignal::Ended { attempt, result }) => {
            // Reports from attempts that were already stopped are stale;
            // only the current attempt may change state here.
            if active.as_ref().is_none_or(|(current, _, _)| *current != attempt) {
              continue;
            }
            active = None;
            if let Err(err) = result {
              let reason = err.to_string();
              if let Err(err) = self.cursor.mark_error(&reason) {
                warn!(%err, "recording follow failure failed");
              }
              match self.options.follow_failure {
                FollowFailurePolicy::Exit => {
                  error!(%reason, "replication link failed, exiting");
                  std::process::exit(1);
                }
                FollowFailurePolicy::Demote => {
                  error!(%reason, "replication link failed, demoting to leader");
                  self.following.lock().take();
                }
              }
            }
          }
          None => return,
        },
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{Database, Options};
  use crate::error::SkiffError;
  use crate::executor::Action;
  use crate::resp;
  use std::sync::Arc;

  fn args(parts: &[&str]) -> Vec<Vec<u8>> {
    parts.iter().map(|part| part.as_bytes().to_vec()).collect()
  }

  fn open(dir: &std::path::Path) -> Arc<Database> {
    Arc::new(Database::open(Options::new(dir)).expect("open database"))
  }

  #[tokio::test]
  async fn exec_rejects_empty_args() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open(dir.path());
    assert!(matches!(db.exec(&[]), Err(SkiffError::Arity)));
  }

  #[tokio::test]
  async fn writes_are_logged_before_execution() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open(dir.path());

    db.exec(&args(&["SET", "k", "v"])).expect("exec");
    db.exec(&args(&["GET", "k"])).expect("exec");
    drop(db);

    // Only the write landed in the log.
    let reopened = open(dir.path());
    let outcome = reopened.exec(&args(&["GET", "k"])).expect("exec");
    assert_eq!(outcome.output, resp::null(), "storage is not the log");

    let log = std::fs::read(dir.path().join(super::OPLOG_FILE_NAME)).expect("read oplog");
    // Close flushed the single SET record; GET must not appear.
    let (record, consumed) = resp::decode_record(&log)
      .expect("decode")
      .expect("one record");
    assert_eq!(record.args, args(&["SET", "k", "v"]));
    assert_eq!(consumed, log.len());
  }

  #[tokio::test]
  async fn unknown_commands_fail_without_logging() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open(dir.path());
    assert!(matches!(
      db.exec(&args(&["NOPE", "k"])),
      Err(SkiffError::UnknownCommand(_))
    ));
  }

  #[tokio::test]
  async fn iexec_bypasses_the_write_gate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open(dir.path());
    // Force the follower role without a live leader.
    *db.following.lock() = Some(super::Node::new("127.0.0.1", 1));

    assert!(matches!(
      db.exec(&args(&["SET", "k", "v"])),
      Err(SkiffError::NodeReadOnly)
    ));
    // Reads still pass.
    db.exec(&args(&["GET", "k"])).expect("read while following");

    db.iexec(&args(&["SET", "k", "v"])).expect("iexec");
    let outcome = db.exec(&args(&["GET", "k"])).expect("exec");
    assert_eq!(outcome.output, resp::bulk(b"v"));
  }

  #[tokio::test]
  async fn unfollow_without_leader_is_node_is_master() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open(dir.path());
    assert!(matches!(db.unfollow(), Err(SkiffError::NodeIsMaster)));
  }

  #[tokio::test]
  async fn slave_of_unreachable_leader_fails_typed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut options = Options::new(dir.path());
    options.connect_timeout = std::time::Duration::from_millis(200);
    let db = Arc::new(Database::open(options).expect("open database"));
    Arc::clone(&db).run();

    // A port nothing listens on: bind-then-drop reserves a dead address.
    let port = {
      let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
      probe.local_addr().expect("probe addr").port()
    };

    let result = db.slave_of("127.0.0.1", port).await;
    assert!(matches!(result, Err(SkiffError::NodeConnectFailed { .. })));
    assert!(db.is_writable(), "failed slaveof must not change the role");
  }

  #[tokio::test]
  async fn close_is_best_effort_and_repeatable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open(dir.path());
    db.exec(&args(&["SET", "k", "v"])).expect("exec");
    db.close().expect("close");
    db.close().expect("second close");

    assert!(matches!(
      db.exec(&args(&["SET", "k2", "v"])),
      Err(SkiffError::LogClosed)
    ));
  }

  #[tokio::test]
  async fn quit_and_shutdown_actions_surface() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = open(dir.path());
    assert_eq!(db.exec(&args(&["QUIT"])).expect("exec").action, Action::Close);
    assert_eq!(
      db.exec(&args(&["SHUTDOWN"])).expect("exec").action,
      Action::Shutdown
    );
  }
}

//! Crate-wide error taxonomy.

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SkiffError>;

/// Phase tag attached to replication failures so a broken follow attempt
/// names the step that died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationPhase {
  SnapshotStream,
  SnapshotLoad,
  OplogFetch,
  OplogDecode,
  Replay,
}

impl fmt::Display for ReplicationPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let value = match self {
      ReplicationPhase::SnapshotStream => "snapshot-stream",
      ReplicationPhase::SnapshotLoad => "snapshot-load",
      ReplicationPhase::OplogFetch => "oplog-fetch",
      ReplicationPhase::OplogDecode => "oplog-decode",
      ReplicationPhase::Replay => "replay",
    };
    write!(f, "{value}")
  }
}

/// Client-visible variants render as `ERR ...` wire texts so a front-end
/// can forward `to_string()` untouched.
#[derive(Debug, Error)]
pub enum SkiffError {
  #[error("ERR invalid number of arguments")]
  Arity,

  #[error("ERR syntax error")]
  Syntax,

  #[error("ERR runtime error: {0}")]
  Runtime(String),

  #[error("ERR unknown command '{0}'")]
  UnknownCommand(String),

  #[error("ERR node read only")]
  NodeReadOnly,

  #[error("ERR node is master")]
  NodeIsMaster,

  #[error("ERR node is already following {0}")]
  AlreadyFollowing(String),

  #[error("connect to {address} failed: {reason}")]
  NodeConnectFailed { address: String, reason: String },

  #[error("invalid oplog format: {0}")]
  InvalidLogFormat(String),

  #[error("oplog is closed")]
  LogClosed,

  #[error("cancelled")]
  Cancelled,

  #[error("replication {phase} failed: {source}")]
  Replication {
    phase: ReplicationPhase,
    #[source]
    source: Box<SkiffError>,
  },

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl SkiffError {
  /// Wraps the error with the replication phase it occurred in.
  pub fn in_phase(self, phase: ReplicationPhase) -> SkiffError {
    SkiffError::Replication {
      phase,
      source: Box::new(self),
    }
  }
}

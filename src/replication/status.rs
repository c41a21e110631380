//! Persisted follow cursor sidecar.
//!
//! The follower records how far it has replayed so operators can see
//! replication progress across restarts. This is observability state, not
//! a resume point: a restarted follower always bootstraps from a fresh
//! snapshot.

use crate::error::{Result, SkiffError};
use crate::uid::LogId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CURSOR_FILE_NAME: &str = "follow-cursor.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CursorState {
  /// Hex form of the last applied record id.
  applied_offset: Option<String>,
  last_error: Option<String>,
}

#[derive(Debug)]
pub struct FollowCursor {
  path: PathBuf,
  state: Mutex<CursorState>,
}

impl FollowCursor {
  /// Opens the sidecar in `dir`, loading any state a previous run left.
  pub fn open(dir: &Path) -> Result<FollowCursor> {
    let path = dir.join(CURSOR_FILE_NAME);
    let state = load_state(&path)?;
    Ok(FollowCursor {
      path,
      state: Mutex::new(state),
    })
  }

  pub fn applied_offset(&self) -> Option<String> {
    self.state.lock().applied_offset.clone()
  }

  pub fn last_error(&self) -> Option<String> {
    self.state.lock().last_error.clone()
  }

  /// Advances the applied offset and clears any recorded error. Fixed-width
  /// lowercase hex compares like the underlying bytes, so moving backwards
  /// is detectable and rejected.
  pub fn mark_applied(&self, id: LogId) -> Result<()> {
    let mut state = self.state.lock();
    let next = id.to_string();
    if let Some(current) = state.applied_offset.as_ref() {
      if *current > next {
        return Err(SkiffError::Runtime(format!(
          "follow cursor moved backwards: {current} -> {next}"
        )));
      }
    }
    state.applied_offset = Some(next);
    state.last_error = None;
    persist_state(&self.path, &state)
  }

  pub fn mark_error(&self, message: impl Into<String>) -> Result<()> {
    let mut state = self.state.lock();
    state.last_error = Some(message.into());
    persist_state(&self.path, &state)
  }
}

fn load_state(path: &Path) -> Result<CursorState> {
  if !path.exists() {
    return Ok(CursorState::default());
  }
  let bytes = std::fs::read(path)?;
  serde_json::from_slice(&bytes)
    .map_err(|error| SkiffError::Runtime(format!("decode follow cursor: {error}")))
}

fn persist_state(path: &Path, state: &CursorState) -> Result<()> {
  let bytes = serde_json::to_vec(state)
    .map_err(|error| SkiffError::Runtime(format!("encode follow cursor: {error}")))?;
  let tmp_path = path.with_extension("json.tmp");
  std::fs::write(&tmp_path, &bytes)?;
  std::fs::rename(&tmp_path, path)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::FollowCursor;
  use crate::uid::LogId;

  #[test]
  fn survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let id = LogId::generate();

    {
      let cursor = FollowCursor::open(dir.path()).expect("open");
      assert_eq!(cursor.applied_offset(), None);
      cursor.mark_applied(id).expect("mark applied");
    }

    let cursor = FollowCursor::open(dir.path()).expect("reopen");
    assert_eq!(cursor.applied_offset(), Some(id.to_string()));
    assert_eq!(cursor.last_error(), None);
  }

  #[test]
  fn rejects_backwards_movement() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cursor = FollowCursor::open(dir.path()).expect("open");

    let first = LogId::generate();
    let second = LogId::generate();
    cursor.mark_applied(second).expect("mark applied");
    assert!(cursor.mark_applied(first).is_err());
  }

  #[test]
  fn errors_clear_on_the_next_apply() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cursor = FollowCursor::open(dir.path()).expect("open");

    cursor.mark_error("leader went away").expect("mark error");
    assert_eq!(cursor.last_error(), Some("leader went away".to_string()));

    cursor.mark_applied(LogId::generate()).expect("mark applied");
    assert_eq!(cursor.last_error(), None);
  }
}

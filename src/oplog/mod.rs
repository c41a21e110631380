//! Append-only oplog bus.
//!
//! Every write command is recorded here as one framed record before it is
//! allowed to touch storage. The file is a growing stream, never rewritten
//! or compacted; rotation is an operator concern. [`OplogBus::sync`] is
//! both the bounded historical replay and the unbounded live tail: one
//! loop that decodes the file incrementally, discards records below the
//! requested offset, and polls for fresh bytes once it has caught up.

use crate::error::{Result, SkiffError};
use crate::resp;
use crate::uid::LogId;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};

/// How long the tail reader sleeps at end-of-file before looking again.
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_CHUNK_BYTES: usize = 64 * 1024;

pub struct OplogBus {
  path: PathBuf,
  /// `None` once closed. Appends serialize on this lock, and the record id
  /// is generated inside it so id order always equals file order.
  writer: Mutex<Option<BufWriter<File>>>,
}

impl OplogBus {
  /// Opens (or creates) the log file in append mode.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Self {
      path,
      writer: Mutex::new(Some(BufWriter::new(file))),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Appends one command as a framed record and returns its id.
  ///
  /// Does not flush; durability comes from the periodic flush or an
  /// explicit [`OplogBus::flush`].
  pub fn append(&self, args: &[Vec<u8>]) -> Result<LogId> {
    let mut guard = self.writer.lock();
    let writer = guard.as_mut().ok_or(SkiffError::LogClosed)?;
    let id = LogId::generate();
    writer.write_all(&resp::encode_record(id, args))?;
    Ok(id)
  }

  /// Forces buffered bytes to the file. Idempotent; a no-op after close.
  pub fn flush(&self) -> Result<()> {
    match self.writer.lock().as_mut() {
      Some(writer) => {
        writer.flush()?;
        Ok(())
      }
      None => Ok(()),
    }
  }

  /// Flushes and releases the file handle. Safe to call repeatedly.
  pub fn close(&self) -> Result<()> {
    if let Some(mut writer) = self.writer.lock().take() {
      writer.flush()?;
    }
    Ok(())
  }

  /// Streams the log to `sink`, preserving the encoded framing.
  ///
  /// Records with an id below `from` are discarded; everything at or past
  /// it is forwarded in file order. Once the reader catches up with the
  /// end of the file it waits for more bytes instead of terminating, so
  /// the same call serves historical replay and live tailing. Returns
  /// without error when `cancel` fires or the sink's receiver goes away;
  /// malformed framing is fatal and propagates.
  pub async fn sync(
    &self,
    mut cancel: watch::Receiver<bool>,
    sink: mpsc::Sender<Vec<u8>>,
    from: Option<LogId>,
  ) -> Result<()> {
    let mut file = tokio::fs::File::open(&self.path).await?;
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    loop {
      if *cancel.borrow() {
        return Ok(());
      }

      let read = file.read(&mut chunk).await?;
      if read == 0 {
        tokio::select! {
          _ = cancel.changed() => return Ok(()),
          _ = tokio::time::sleep(TAIL_POLL_INTERVAL) => continue,
        }
      }
      pending.extend_from_slice(&chunk[..read]);

      let mut forward = Vec::new();
      loop {
        match resp::decode_record(&pending)? {
          Some((record, consumed)) => {
            if from.is_none_or(|offset| record.id >= offset) {
              forward.extend_from_slice(&pending[..consumed]);
            }
            pending.drain(..consumed);
          }
          None => break,
        }
      }

      if !forward.is_empty() && sink.send(forward).await.is_err() {
        // Receiver dropped: the consumer cancelled from its side.
        return Ok(());
      }
    }
  }
}

//! Leader-side replication streams.
//!
//! Each follower connection asks for exactly one stream: a point-in-time
//! storage snapshot, or the oplog tail from an offset. Snapshot export
//! runs on a blocking thread and is chunked through a channel so a slow
//! follower backpressures the export instead of buffering it.

use super::wire::{self, replica_request, ReplicaRequest, StreamChunk};
use crate::db::Database;
use crate::error::{Result, SkiffError};
use crate::uid::LogId;
use std::io::Write;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Accepts follower connections until `cancel` fires. One streaming task
/// per connection; a follower that dies mid-stream only kills its own task.
pub async fn serve(
  db: Arc<Database>,
  listener: TcpListener,
  mut cancel: watch::Receiver<bool>,
) -> Result<()> {
  loop {
    tokio::select! {
      _ = cancel.changed() => return Ok(()),
      accepted = listener.accept() => {
        let (stream, peer) = accepted?;
        debug!(%peer, "replication connection accepted");
        let db = Arc::clone(&db);
        let cancel = cancel.clone();
        tokio::spawn(async move {
          if let Err(error) = handle_connection(db, stream, cancel).await {
            warn!(%peer, %error, "replication stream failed");
          }
        });
      }
    }
  }
}

async fn handle_connection(
  db: Arc<Database>,
  mut stream: TcpStream,
  cancel: watch::Receiver<bool>,
) -> Result<()> {
  let request: Option<ReplicaRequest> = wire::read_frame(&mut stream).await?;
  match request.and_then(|request| request.body) {
    Some(replica_request::Body::Snapshot(_)) => stream_snapshot(db, stream, cancel).await,
    Some(replica_request::Body::Oplog(request)) => {
      stream_oplog(db, stream, request.offset, cancel).await
    }
    // Peer disconnected before asking for anything.
    None => Ok(()),
  }
}

async fn stream_snapshot(
  db: Arc<Database>,
  mut stream: TcpStream,
  mut cancel: watch::Receiver<bool>,
) -> Result<()> {
  info!("fetching snapshot");
  let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(8);
  let storage = db.storage_handle();
  let export = tokio::task::spawn_blocking(move || {
    let mut sink = ChunkSink::new(chunk_tx);
    storage.snapshot(&mut sink)?;
    sink.finish()
  });

  info!("sending snapshot");
  loop {
    let chunk = tokio::select! {
      _ = cancel.changed() => {
        // Dropping the receiver makes the export's next write fail.
        drop(chunk_rx);
        let _ = export.await;
        return Err(SkiffError::Cancelled);
      }
      chunk = chunk_rx.recv() => chunk,
    };
    match chunk {
      Some(payload) => wire::write_frame(&mut stream, &StreamChunk { payload }).await?,
      None => break,
    }
  }

  match export.await {
    Ok(result) => result?,
    Err(join_error) => {
      return Err(SkiffError::Runtime(format!("snapshot export task: {join_error}")))
    }
  }

  // Empty chunk marks a complete export; a bare disconnect means abort.
  wire::write_frame(&mut stream, &StreamChunk { payload: Vec::new() }).await?;
  stream.shutdown().await?;
  info!("snapshot success");
  Ok(())
}

async fn stream_oplog(
  db: Arc<Database>,
  mut stream: TcpStream,
  offset: Vec<u8>,
  cancel: watch::Receiver<bool>,
) -> Result<()> {
  let from = match offset.len() {
    0 => None,
    _ => Some(LogId::from_bytes(&offset).ok_or_else(|| {
      SkiffError::InvalidLogFormat(format!("offset must be 12 bytes, got {}", offset.len()))
    })?),
  };

  info!(offset = %from.map(|id| id.to_string()).unwrap_or_default(), "sending oplog");
  let (chunk_tx, mut chunk_rx) = mpsc::channel::<Vec<u8>>(64);
  let oplog = db.oplog_handle();
  let sync = tokio::spawn(async move { oplog.sync(cancel, chunk_tx, from).await });

  while let Some(payload) = chunk_rx.recv().await {
    wire::write_frame(&mut stream, &StreamChunk { payload }).await?;
  }

  match sync.await {
    Ok(result) => result?,
    Err(join_error) => {
      return Err(SkiffError::Runtime(format!("oplog sync task: {join_error}")))
    }
  }
  info!("oplog sync finished");
  Ok(())
}

/// `io::Write` adapter that slices the export into bounded payloads and
/// hands them to the async side. Lives on the blocking export thread, so
/// `blocking_send` is the right bridge.
struct ChunkSink {
  tx: mpsc::Sender<Vec<u8>>,
  buffer: Vec<u8>,
}

impl ChunkSink {
  fn new(tx: mpsc::Sender<Vec<u8>>) -> ChunkSink {
    ChunkSink {
      tx,
      buffer: Vec::with_capacity(wire::SNAPSHOT_CHUNK_BYTES),
    }
  }

  fn send_buffer(&mut self) -> std::io::Result<()> {
    if self.buffer.is_empty() {
      return Ok(());
    }
    let chunk = std::mem::take(&mut self.buffer);
    self
      .tx
      .blocking_send(chunk)
      .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "snapshot stream closed"))
  }

  fn finish(mut self) -> Result<()> {
    self.send_buffer()?;
    Ok(())
  }
}

impl Write for ChunkSink {
  fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
    let mut rest = data;
    while !rest.is_empty() {
      let room = wire::SNAPSHOT_CHUNK_BYTES - self.buffer.len();
      let take = room.min(rest.len());
      self.buffer.extend_from_slice(&rest[..take]);
      rest = &rest[take..];
      if self.buffer.len() == wire::SNAPSHOT_CHUNK_BYTES {
        self.send_buffer()?;
      }
    }
    Ok(data.len())
  }

  fn flush(&mut self) -> std::io::Result<()> {
    self.send_buffer()
  }
}
